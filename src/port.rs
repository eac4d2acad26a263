/*
 * CPU Port Interface
 *
 * The kernel core is architecture-neutral. Everything that touches the CPU
 * directly is supplied by a board port through this hook table:
 *
 * - `enter_critical` / `leave_critical`: mask interrupts and return the
 *   saved state, restore it on leave. Calls nest; every path that enters
 *   must leave with the mask it was handed.
 * - `switch_context`: request a context switch to the thread the kernel
 *   has selected as current. On most MCUs this pends the lowest-priority
 *   software interrupt (PendSV style) so the actual stack swap happens
 *   once the critical section is left. The hook must not perform the swap
 *   while interrupts are still masked.
 * - `load_root_thread`: start the very first thread; does not return.
 *
 * The port is also responsible for the raw vector shim that forwards the
 * hardware interrupt number to `irq::enter_isr`, and for a periodic clock
 * source calling `kernel::tick`.
 */

use spin::Mutex;

/// Hook table installed by the board port before `kernel::init`.
#[derive(Debug, Clone, Copy)]
pub struct CpuPort {
    pub enter_critical: fn() -> u32,
    pub leave_critical: fn(u32),
    pub switch_context: fn(),
    pub load_root_thread: fn(),
}

fn noop_enter() -> u32 {
    0
}

fn noop_leave(_mask: u32) {}

fn noop() {}

impl CpuPort {
    /// A port that masks nothing and switches nothing. Used before a real
    /// port is installed and by the host-side test harness, where the
    /// kernel's own bookkeeping stands in for the hardware switch.
    pub const fn noop() -> Self {
        CpuPort {
            enter_critical: noop_enter,
            leave_critical: noop_leave,
            switch_context: noop,
            load_root_thread: noop,
        }
    }
}

static PORT: Mutex<CpuPort> = Mutex::new(CpuPort::noop());

/// Install the board port's hook table.
pub fn install(port: CpuPort) {
    *PORT.lock() = port;
}

/// Snapshot of the installed hooks.
pub(crate) fn current() -> CpuPort {
    *PORT.lock()
}
