/*
 * Fixed-Priority Preemptive Scheduler
 *
 * One FIFO list per priority level plus a bitmap with a bit for every
 * non-empty level. Selection is O(1): the lowest set bit names the most
 * urgent level and the head of that list is the thread to run. The running
 * thread stays at the head of its list; round-robin within a level is
 * expressed by rotating the head to the tail when its time slice runs out.
 *
 * Preemption is decision-only here. `reschedule` updates the kernel's idea
 * of the current thread and asks the port to swap stacks; on hardware the
 * swap is deferred until the critical section is left, on the host test
 * port it is a no-op and the bookkeeping alone carries the semantics.
 */

pub mod thread;
pub mod timer;

use crate::config::{PRIORITY_NUM, Priority};
use crate::kernel::{Diagnosis, ExecContext, Kernel};
use crate::list::ListHead;
use crate::sched::thread::{ThreadId, ThreadState};

/// Insertion position within a priority level's FIFO list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePos {
    Head,
    Tail,
}

/// Per-priority FIFO lists plus the occupancy bitmap.
///
/// Invariant: bit `p` is set exactly when list `p` is non-empty.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyQueue {
    pub lists: [ListHead; PRIORITY_NUM],
    pub bitmap: u32,
}

impl ReadyQueue {
    pub fn new() -> Self {
        ReadyQueue {
            lists: [ListHead::EMPTY; PRIORITY_NUM],
            bitmap: 0,
        }
    }

    /// Most urgent non-empty priority level.
    pub fn highest(&self) -> Option<Priority> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as Priority)
        }
    }
}

impl Kernel {
    /// Head of the ready list at the most urgent non-empty level.
    pub(crate) fn select_next(&self) -> Option<ThreadId> {
        let prio = self.ready.highest()?;
        self.ready.lists[prio as usize].front().map(ThreadId)
    }

    /// Insert `t` into the ready queue at its current priority.
    ///
    /// Head insertion is reserved for a thread that was running when it was
    /// pulled out and must keep its slot; everything else goes to the tail.
    pub(crate) fn enter_ready(&mut self, t: ThreadId, pos: QueuePos) {
        let prio = self.tcb(t).priority;
        let list = &mut self.ready.lists[prio as usize];
        match pos {
            QueuePos::Head => list.push_head(&mut self.sched_links, t.0),
            QueuePos::Tail => list.push_tail(&mut self.sched_links, t.0),
        }
        self.ready.bitmap |= 1 << prio;
    }

    /// Remove `t` from the ready queue, clearing the bitmap bit when its
    /// level empties.
    pub(crate) fn leave_ready(&mut self, t: ThreadId) {
        let prio = self.tcb(t).priority;
        let list = &mut self.ready.lists[prio as usize];
        list.remove(&mut self.sched_links, t.0);
        if list.is_empty() {
            self.ready.bitmap &= !(1 << prio);
        }
    }

    /// Switch to the most urgent ready thread if it differs from the
    /// current one. No-op while the scheduler is locked or an ISR is
    /// active; those paths re-run the decision at their tail.
    pub(crate) fn reschedule(&mut self) {
        if self.sched_locked > 0 || self.context != ExecContext::Thread {
            return;
        }
        let next = self.select_next();
        if next == self.current {
            return;
        }
        let Some(next) = next else {
            // Nothing runnable. The application must keep one always-ready
            // thread alive for exactly this reason.
            self.fatal(Diagnosis::STATE_ERROR, "no runnable thread");
        };
        if let Some(cur) = self.current {
            let tcb = self.tcb_mut(cur);
            if tcb.state == ThreadState::Running {
                tcb.state = ThreadState::Ready;
            }
        }
        self.tcb_mut(next).state = ThreadState::Running;
        self.current = Some(next);
        (self.port.switch_context)();
    }

    /// One clock tick: time-slice accounting, timer list advance, then a
    /// preemption decision.
    pub(crate) fn tick_handler(&mut self) {
        self.jiffies = self.jiffies.wrapping_add(1);

        if let Some(cur) = self.current {
            let tcb = self.tcb_mut(cur);
            if tcb.slice > 0 {
                tcb.slice -= 1;
            }
            if tcb.slice == 0 {
                let prio = tcb.priority;
                tcb.slice = tcb.slice_reload;
                // rotate only when a peer shares the level, otherwise the
                // thread keeps running on a fresh quantum
                let has_peer = self.sched_links[cur.0].is_attached()
                    && self.ready.lists[prio as usize].len(&self.sched_links) > 1;
                if has_peer {
                    self.leave_ready(cur);
                    self.enter_ready(cur, QueuePos::Tail);
                }
            }
        }

        self.timer_advance();
        self.reschedule();
    }
}
