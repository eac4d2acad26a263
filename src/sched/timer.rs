/*
 * Delta-Encoded Timeout List
 *
 * Threads waiting on a timeout (IPC with a deadline, plain delays) queue
 * here ordered by expiry. Each entry stores only the tick delta to its
 * predecessor, so a tick touches exactly one counter: the head's. Expiry
 * handling pops every entry whose delta reached zero and routes it to the
 * owner: a thread with an IPC context is unblocked with a timeout verdict,
 * a plain sleeper is simply made ready again.
 */

use crate::config::Tick;
use crate::ipc::{IpcError, IpcState};
use crate::kernel::{Diagnosis, Kernel};
use crate::list::ListHead;
use crate::sched::QueuePos;
use crate::sched::thread::{ThreadId, ThreadState};

/// Head of the kernel timeout list. Deltas live in the thread table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerList {
    pub queue: ListHead,
}

impl TimerList {
    pub fn new() -> Self {
        TimerList {
            queue: ListHead::EMPTY,
        }
    }
}

impl Kernel {
    /// Queue `t` to expire after `ticks`.
    pub(crate) fn timer_arm(&mut self, t: ThreadId, ticks: Tick) {
        self.diag_assert(ticks > 0, Diagnosis::STATE_ERROR, "zero-tick timer");
        self.diag_assert(
            !self.tcb(t).timer_active,
            Diagnosis::LIST_ERROR,
            "timer armed twice",
        );

        // find the first entry whose cumulative expiry lies beyond ours
        let mut remaining = ticks;
        let mut anchor = None;
        let mut cursor = self.timer.queue.front();
        while let Some(n) = cursor {
            let delta = self.tcb(ThreadId(n)).timer_delta;
            if remaining < delta {
                anchor = Some(n);
                break;
            }
            remaining -= delta;
            cursor = self.timer.queue.next_of(&self.timer_links, n);
        }

        match anchor {
            Some(n) => {
                self.timer.queue.insert_before(&mut self.timer_links, t.0, n);
                self.tcb_mut(ThreadId(n)).timer_delta -= remaining;
            }
            None => {
                self.timer.queue.push_tail(&mut self.timer_links, t.0);
            }
        }
        let tcb = self.tcb_mut(t);
        tcb.timer_delta = remaining;
        tcb.timer_active = true;
    }

    /// Disarm `t`'s timeout. Safe to call on an inactive timer.
    pub(crate) fn timer_cancel(&mut self, t: ThreadId) {
        if !self.tcb(t).timer_active {
            return;
        }
        // the successor inherits the cancelled entry's remaining delta
        if let Some(n) = self.timer.queue.next_of(&self.timer_links, t.0) {
            let delta = self.tcb(t).timer_delta;
            self.tcb_mut(ThreadId(n)).timer_delta += delta;
        }
        self.timer.queue.remove(&mut self.timer_links, t.0);
        let tcb = self.tcb_mut(t);
        tcb.timer_delta = 0;
        tcb.timer_active = false;
    }

    /// Advance the list by one tick and wake everything that expired.
    pub(crate) fn timer_advance(&mut self) {
        let Some(h) = self.timer.queue.front() else {
            return;
        };
        {
            let head = self.tcb_mut(ThreadId(h));
            if head.timer_delta > 0 {
                head.timer_delta -= 1;
            }
        }
        let mut hirp = false;
        while let Some(h) = self.timer.queue.front() {
            if self.tcb(ThreadId(h)).timer_delta != 0 {
                break;
            }
            let t = ThreadId(h);
            self.timer.queue.remove(&mut self.timer_links, h);
            let tcb = self.tcb_mut(t);
            tcb.timer_delta = 0;
            tcb.timer_active = false;
            self.timeout_expire(t, &mut hirp);
        }
    }

    /// A timed wait ran out. IPC waits report the timeout through their
    /// context; a plain delay just returns to the ready queue.
    fn timeout_expire(&mut self, t: ThreadId, hirp: &mut bool) {
        if self.tcb(t).ipc.is_some() {
            self.ipc_unblock_one(t, IpcState::Failure, IpcError::Timeout, hirp);
        } else {
            self.diag_assert(
                self.tcb(t).state == ThreadState::Blocked,
                Diagnosis::THREAD_ERROR,
                "timer expiry on a thread that is not blocked",
            );
            self.blocked.remove(&mut self.sched_links, t.0);
            self.enter_ready(t, QueuePos::Tail);
            self.tcb_mut(t).state = ThreadState::Ready;
            if let Some(cur) = self.current {
                if self.tcb(t).priority < self.tcb(cur).priority {
                    *hirp = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::with_kernel;
    use crate::tests::support::{TestEnv, spawn};

    fn deltas() -> std::vec::Vec<(usize, Tick)> {
        with_kernel(|k| {
            k.timer
                .queue
                .iter(&k.timer_links)
                .map(|n| (n, k.tcb(ThreadId(n)).timer_delta))
                .collect()
        })
    }

    #[test]
    fn arming_builds_a_delta_chain() {
        let _env = TestEnv::new();
        let ta = spawn("a", 5);
        let tb = spawn("b", 5);
        let tc = spawn("c", 5);
        with_kernel(|k| {
            k.timer_arm(ta, 10);
            k.timer_arm(tb, 4);
            k.timer_arm(tc, 7);
        });
        // expiries 4, 7, 10 encoded as deltas 4, 3, 3
        assert_eq!(deltas(), vec![(tb.0, 4), (tc.0, 3), (ta.0, 3)]);
    }

    #[test]
    fn cancel_gives_the_delta_to_the_successor() {
        let _env = TestEnv::new();
        let ta = spawn("a", 5);
        let tb = spawn("b", 5);
        with_kernel(|k| {
            k.timer_arm(ta, 5);
            k.timer_arm(tb, 9);
            k.timer_cancel(ta);
        });
        assert_eq!(deltas(), vec![(tb.0, 9)]);
        with_kernel(|k| assert!(!k.tcb(ta).timer_active));
    }

    #[test]
    fn equal_deadlines_expire_in_arrival_order() {
        let _env = TestEnv::new();
        let ta = spawn("a", 5);
        let tb = spawn("b", 5);
        with_kernel(|k| {
            k.timer_arm(ta, 6);
            k.timer_arm(tb, 6);
        });
        assert_eq!(deltas(), vec![(ta.0, 6), (tb.0, 0)]);
    }
}
