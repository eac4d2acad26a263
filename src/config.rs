/*
 * Kernel Build-Time Configuration
 *
 * Every tunable of the kernel core lives here: table sizes, the tick rate,
 * default scheduling parameters and the module enable switches. All values
 * are plain constants so the whole kernel is sized at compile time and
 * never allocates.
 */

/// Time unit used for timeouts and time slices. The wall-clock length of a
/// tick is decided by the port's clock source, not by the core.
pub type Tick = u32;

/// Thread priority. Lower numeric value means higher urgency; 0 is the most
/// urgent priority in the system.
pub type Priority = u8;

/// Number of distinct priority levels (0..PRIORITY_NUM-1).
///
/// Must not exceed 32: the ready queue keeps one bitmap bit per level.
pub const PRIORITY_NUM: usize = 32;

/// Least urgent usable priority.
pub const PRIO_MAX: Priority = (PRIORITY_NUM - 1) as Priority;

/// Capacity of the thread table.
pub const THREAD_NUM: usize = 32;

/// Nominal tick frequency of the port's clock source.
pub const TICK_HZ: u32 = 1_000;

/// Default time slice handed to a thread when its quantum is reloaded.
pub const DEFAULT_SLICE: Tick = 20;

/// Size of the interrupt vector table.
pub const IRQ_VECTOR_NUM: usize = 32;

/// Number of hardware IRQ lines the map table covers.
pub const CPU_IRQ_NUM: usize = 64;

/// Capacity of the deferred interrupt request pool.
pub const IRQ_REQUEST_NUM: usize = 16;

/// Capacities of the synchronization object pools.
pub const MAILBOX_NUM: usize = 8;
pub const SEMAPHORE_NUM: usize = 8;
pub const MUTEX_NUM: usize = 8;

/// Module enable switches.
pub const IPC_ENABLE: bool = true;
pub const IRQ_DAEMON_ENABLE: bool = true;
pub const PRIORITY_INHERITANCE_ENABLE: bool = true;
pub const DIAG_ASSERT_ENABLE: bool = true;

/// IRQ daemon thread parameters.
pub const DAEMON_PRIORITY: Priority = 0;
pub const DAEMON_SLICE: Tick = 10;
pub const DAEMON_STACK_BYTES: usize = 4096;

/// Convert milliseconds to ticks, rounding down. The core itself never
/// interprets wall-clock durations; this helper exists for applications.
pub const fn ms_to_ticks(ms: u32) -> Tick {
    ((ms as u64 * TICK_HZ as u64) / 1_000) as Tick
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_conversion_follows_tick_rate() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1_000), TICK_HZ);
        assert_eq!(ms_to_ticks(500), TICK_HZ / 2);
    }

    #[test]
    fn priority_levels_fit_the_ready_bitmap() {
        assert!(PRIORITY_NUM <= 32);
        assert_eq!(PRIO_MAX as usize, PRIORITY_NUM - 1);
    }
}
