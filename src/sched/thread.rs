/*
 * Thread Control Blocks and the Thread API
 *
 * A thread is a slot in the fixed thread table. Its status decides which
 * kernel list holds it: Ready and Running threads sit in the ready queue,
 * Blocked threads sit in the kernel blocked list plus one wait queue,
 * Suspended and Terminated threads sit in no list at all.
 *
 * Lifecycle:
 *
 *   create -> Suspended -> activate -> Ready <-> Running
 *   Running -> block/delay -> Blocked -> unblock/timeout/flush -> Ready
 *   Running -> suspend_self -> Suspended
 *   any live state -> terminate -> Terminated -> delete -> slot free
 *
 * Suspending a Blocked thread is rejected: it would leave a wait queue
 * entry pointing at a thread the scheduler has forgotten about.
 */

use core::fmt;

use heapless::Vec;

use crate::config::{DEFAULT_SLICE, PRIO_MAX, Priority, THREAD_NUM, Tick};
use crate::kernel::{self, Diagnosis, ExecContext, Kernel};
use crate::sched::QueuePos;

/// Thread identifier: the thread's slot in the thread table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread status. A thread has exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Dormant,
    Ready,
    Running,
    Blocked,
    Suspended,
    Terminated,
}

/// Stack memory handed to a thread at creation. The core only records it;
/// the port lays out the initial frame and maintains the saved pointer.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    pub base: usize,
    pub size: usize,
}

/// Thread control block.
#[derive(Clone, Copy)]
pub(crate) struct Tcb {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,
    pub base_priority: Priority,
    /// Effective priority; equals `base_priority` unless boosted.
    pub priority: Priority,
    pub entry: fn(usize),
    pub arg: usize,
    pub stack: StackRegion,
    /// Saved stack pointer, owned by the port across context switches.
    pub stack_ptr: usize,
    pub slice: Tick,
    pub slice_reload: Tick,
    /// Remaining delta while queued on the timer list.
    pub timer_delta: Tick,
    pub timer_active: bool,
    /// Active blocking descriptor; present exactly while Blocked on IPC.
    pub ipc: Option<crate::ipc::IpcContext>,
}

/// Errors surfaced by the thread API. Invariant violations inside the
/// kernel never show up here; those take the fatal diagnostic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// Requested transition is not legal from the thread's current state.
    InvalidState,
    /// Thread table is full.
    NoSlot,
    /// Priority outside the configured range.
    BadPriority,
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::InvalidState => write!(f, "invalid thread state"),
            ThreadError::NoSlot => write!(f, "thread table full"),
            ThreadError::BadPriority => write!(f, "priority out of range"),
        }
    }
}

/// Per-thread snapshot for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStat {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,
    pub priority: Priority,
    pub slice: Tick,
}

impl Kernel {
    pub(crate) fn tcb(&self, t: ThreadId) -> &Tcb {
        match self.threads.get(t.0).and_then(|s| s.as_ref()) {
            Some(tcb) => tcb,
            None => panic!("kernel fatal: unknown thread {}", t),
        }
    }

    pub(crate) fn tcb_mut(&mut self, t: ThreadId) -> &mut Tcb {
        match self.threads.get_mut(t.0).and_then(|s| s.as_mut()) {
            Some(tcb) => tcb,
            None => panic!("kernel fatal: unknown thread {}", t),
        }
    }

    /// Apply a new effective priority, repositioning the thread in whatever
    /// ordered structure currently holds it.
    pub(crate) fn reposition(&mut self, t: ThreadId, prio: Priority) {
        match self.tcb(t).state {
            ThreadState::Ready => {
                self.leave_ready(t);
                self.tcb_mut(t).priority = prio;
                self.enter_ready(t, QueuePos::Tail);
            }
            ThreadState::Running => {
                // the running thread keeps the head slot of its new level
                self.leave_ready(t);
                self.tcb_mut(t).priority = prio;
                self.enter_ready(t, QueuePos::Head);
            }
            ThreadState::Blocked => {
                self.tcb_mut(t).priority = prio;
                self.ipc_requeue(t);
            }
            _ => {
                self.tcb_mut(t).priority = prio;
            }
        }
    }

    /// Wake the IRQ daemon from an ISR. No-op unless it is suspended, so a
    /// burst of interrupts folds into one wakeup.
    pub(crate) fn resume_from_isr(&mut self, t: ThreadId) {
        if self.tcb(t).state == ThreadState::Suspended {
            self.enter_ready(t, QueuePos::Tail);
            self.tcb_mut(t).state = ThreadState::Ready;
        }
    }
}

/// Create a thread in the Suspended state.
pub fn create(
    name: &'static str,
    entry: fn(usize),
    arg: usize,
    stack: StackRegion,
    priority: Priority,
    slice: Tick,
) -> Result<ThreadId, ThreadError> {
    if priority > PRIO_MAX {
        return Err(ThreadError::BadPriority);
    }
    let slice = if slice == 0 { DEFAULT_SLICE } else { slice };
    kernel::with_kernel(|k| {
        let slot = k
            .threads
            .iter()
            .position(|s| s.is_none())
            .ok_or(ThreadError::NoSlot)?;
        let id = ThreadId(slot);
        k.threads[slot] = Some(Tcb {
            id,
            name,
            state: ThreadState::Suspended,
            base_priority: priority,
            priority,
            entry,
            arg,
            stack,
            stack_ptr: stack.base + stack.size,
            slice,
            slice_reload: slice,
            timer_delta: 0,
            timer_active: false,
            ipc: None,
        });
        log::info!("created thread '{}' as {} at priority {}", name, id, priority);
        Ok(id)
    })
}

/// Move a Suspended thread into the ready queue.
pub fn activate(t: ThreadId) -> Result<(), ThreadError> {
    kernel::with_kernel(|k| {
        if k.tcb(t).state != ThreadState::Suspended {
            return Err(ThreadError::InvalidState);
        }
        k.enter_ready(t, QueuePos::Tail);
        k.tcb_mut(t).state = ThreadState::Ready;
        k.reschedule();
        Ok(())
    })
}

/// Suspend a thread. The running thread may suspend itself and a Ready
/// thread may be suspended by others; a Blocked thread may not.
pub fn suspend(t: ThreadId) -> Result<(), ThreadError> {
    kernel::with_kernel(|k| match k.tcb(t).state {
        ThreadState::Running | ThreadState::Ready => {
            k.leave_ready(t);
            k.tcb_mut(t).state = ThreadState::Suspended;
            k.reschedule();
            Ok(())
        }
        _ => Err(ThreadError::InvalidState),
    })
}

/// Suspend the calling thread.
pub fn suspend_self() {
    kernel::with_kernel(|k| {
        if k.context != ExecContext::Thread {
            k.fatal(Diagnosis::STATE_ERROR, "suspend_self outside thread context");
        }
        let Some(cur) = k.current else {
            k.fatal(Diagnosis::STATE_ERROR, "suspend_self with no current thread");
        };
        k.leave_ready(cur);
        k.tcb_mut(cur).state = ThreadState::Suspended;
        k.reschedule();
    });
}

/// Terminate a thread, pulling it out of every list it occupies.
pub fn terminate(t: ThreadId) -> Result<(), ThreadError> {
    kernel::with_kernel(|k| {
        match k.tcb(t).state {
            ThreadState::Running | ThreadState::Ready => {
                k.leave_ready(t);
            }
            ThreadState::Blocked => {
                k.blocked.remove(&mut k.sched_links, t.0);
                if let Some(ctx) = k.tcb(t).ipc {
                    k.ipc_dequeue(ctx.object, t, ctx.option);
                    k.tcb_mut(t).ipc = None;
                }
                k.timer_cancel(t);
            }
            ThreadState::Suspended => {}
            _ => return Err(ThreadError::InvalidState),
        }
        let name = k.tcb(t).name;
        k.tcb_mut(t).state = ThreadState::Terminated;
        log::info!("thread '{}' ({}) terminated", name, t);
        if k.current == Some(t) {
            k.reschedule();
        }
        Ok(())
    })
}

/// Release a Terminated thread's slot.
pub fn delete(t: ThreadId) -> Result<(), ThreadError> {
    kernel::with_kernel(|k| {
        if k.tcb(t).state != ThreadState::Terminated {
            return Err(ThreadError::InvalidState);
        }
        k.threads[t.0] = None;
        Ok(())
    })
}

/// Change a thread's base priority. The effective priority follows unless
/// an inheritance boost currently outranks the new base.
pub fn set_priority(t: ThreadId, priority: Priority) -> Result<(), ThreadError> {
    if priority > PRIO_MAX {
        return Err(ThreadError::BadPriority);
    }
    kernel::with_kernel(|k| {
        k.tcb_mut(t).base_priority = priority;
        if crate::config::PRIORITY_INHERITANCE_ENABLE {
            k.recompute_priority(t);
        } else {
            k.reposition(t, priority);
        }
        k.reschedule();
        Ok(())
    })
}

/// Put the calling thread to sleep for `ticks`.
pub fn delay(ticks: Tick) -> Result<(), ThreadError> {
    if ticks == 0 {
        return Ok(());
    }
    kernel::with_kernel(|k| {
        if k.context != ExecContext::Thread {
            k.fatal(Diagnosis::STATE_ERROR, "delay outside thread context");
        }
        let Some(cur) = k.current else {
            k.fatal(Diagnosis::STATE_ERROR, "delay with no current thread");
        };
        k.leave_ready(cur);
        k.blocked.push_tail(&mut k.sched_links, cur.0);
        k.tcb_mut(cur).state = ThreadState::Blocked;
        k.timer_arm(cur, ticks);
        k.reschedule();
        Ok(())
    })
}

/// Identity of the calling thread.
pub fn current() -> Option<ThreadId> {
    kernel::with_kernel(|k| k.current)
}

/// Snapshot of every live thread.
pub fn stats() -> Vec<ThreadStat, THREAD_NUM> {
    kernel::with_kernel(|k| {
        let mut out = Vec::new();
        for tcb in k.threads.iter().flatten() {
            let _ = out.push(ThreadStat {
                id: tcb.id,
                name: tcb.name,
                state: tcb.state,
                priority: tcb.priority,
                slice: tcb.slice,
            });
        }
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{TestEnv, dummy_stack, spawn};

    #[test]
    fn creation_starts_suspended_and_activation_readies() {
        let _env = TestEnv::new();
        let t = create("worker", crate::tests::support::noop_entry, 0, dummy_stack(), 5, 0)
            .unwrap();
        crate::kernel::with_kernel(|k| assert_eq!(k.tcb(t).state, ThreadState::Suspended));
        activate(t).unwrap();
        crate::kernel::with_kernel(|k| assert_eq!(k.tcb(t).state, ThreadState::Ready));
        // a second activation is a state machine violation
        assert_eq!(activate(t), Err(ThreadError::InvalidState));
    }

    #[test]
    fn bad_priority_is_rejected() {
        let _env = TestEnv::new();
        let r = create(
            "late",
            crate::tests::support::noop_entry,
            0,
            dummy_stack(),
            PRIO_MAX + 1,
            0,
        );
        assert_eq!(r, Err(ThreadError::BadPriority));
    }

    #[test]
    fn table_exhaustion_reports_no_slot() {
        let _env = TestEnv::new();
        // one slot is already taken by the IRQ daemon
        for _ in 0..(THREAD_NUM - 1) {
            create("filler", crate::tests::support::noop_entry, 0, dummy_stack(), 8, 0)
                .unwrap();
        }
        let r = create("extra", crate::tests::support::noop_entry, 0, dummy_stack(), 8, 0);
        assert_eq!(r, Err(ThreadError::NoSlot));
    }

    #[test]
    fn suspend_self_yields_to_the_next_thread() {
        let env = TestEnv::new();
        let ta = spawn("a", 5);
        let tb = spawn("b", 6);
        env.start();
        assert_eq!(current(), Some(ta));
        suspend_self();
        assert_eq!(current(), Some(tb));
        crate::kernel::with_kernel(|k| assert_eq!(k.tcb(ta).state, ThreadState::Suspended));
    }

    #[test]
    fn terminate_removes_a_blocked_thread_from_all_lists() {
        let env = TestEnv::new();
        let ta = spawn("a", 5);
        let _idle = spawn("idle", 31);
        env.start();
        delay(100).unwrap();
        crate::kernel::with_kernel(|k| assert_eq!(k.tcb(ta).state, ThreadState::Blocked));
        terminate(ta).unwrap();
        crate::kernel::with_kernel(|k| {
            assert_eq!(k.tcb(ta).state, ThreadState::Terminated);
            assert!(!k.sched_links[ta.0].is_attached());
            assert!(!k.timer_links[ta.0].is_attached());
            assert!(!k.tcb(ta).timer_active);
        });
        delete(ta).unwrap();
        crate::kernel::with_kernel(|k| assert!(k.threads[ta.0].is_none()));
    }

    #[test]
    fn suspending_a_blocked_thread_is_illegal() {
        let env = TestEnv::new();
        let ta = spawn("a", 5);
        let _idle = spawn("idle", 31);
        env.start();
        delay(50).unwrap();
        assert_eq!(suspend(ta), Err(ThreadError::InvalidState));
    }

    #[test]
    fn delay_expires_through_the_tick_handler() {
        let env = TestEnv::new();
        let ta = spawn("a", 5);
        let _idle = spawn("idle", 31);
        env.start();
        delay(3).unwrap();
        assert_ne!(current(), Some(ta));
        crate::kernel::tick();
        crate::kernel::tick();
        crate::kernel::tick();
        // woken and, being the most urgent ready thread, dispatched
        assert_eq!(current(), Some(ta));
    }

    #[test]
    fn stats_reports_live_threads() {
        let _env = TestEnv::new();
        let ta = spawn("alpha", 4);
        let snapshot = stats();
        let row = snapshot.iter().find(|s| s.id == ta).unwrap();
        assert_eq!(row.name, "alpha");
        assert_eq!(row.priority, 4);
        assert_eq!(row.state, ThreadState::Ready);
    }
}
