/*
 * Mutex with Priority Inheritance
 *
 * Ownership-tracked lock whose wait queue is always priority ordered. A
 * contender more urgent than the holder lends the holder its priority, and
 * the loan follows the chain: if the holder is itself parked on another
 * mutex, that mutex's holder is raised too.
 *
 * Each mutex records a ceiling: the most urgent priority among its current
 * waiters. On release the holder's effective priority is recomputed as the
 * most urgent of its base priority and the ceilings of the mutexes it
 * still holds, so it can never end up below base.
 */

use core::fmt;

use crate::config::{IPC_ENABLE, MUTEX_NUM, PRIO_MAX, PRIORITY_INHERITANCE_ENABLE, Priority, Tick};
use crate::ipc::{
    IpcError, IpcOption, IpcState, ObjectId, QueueProperty, WaitQueue, finish_wait,
};
use crate::kernel::{self, Diagnosis, Kernel};
use crate::sched::thread::ThreadId;

/// Mutex handle: the slot index in the mutex pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexId(pub usize);

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mutex({})", self.0)
    }
}

/// Mutex control block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MutexCb {
    pub wait: WaitQueue,
    pub holder: Option<ThreadId>,
    /// Most urgent priority among current waiters; PRIO_MAX when none.
    pub ceiling: Priority,
}

impl Kernel {
    fn mutex(&self, id: MutexId) -> Result<&MutexCb, IpcError> {
        self.mutexes
            .get(id.0)
            .and_then(|s| s.as_ref())
            .ok_or(IpcError::Unready)
    }

    fn mutex_mut(&mut self, id: MutexId) -> Result<&mut MutexCb, IpcError> {
        self.mutexes
            .get_mut(id.0)
            .and_then(|s| s.as_mut())
            .ok_or(IpcError::Unready)
    }

    /// Lend `prio` along the holder chain starting at `start`. Stops as
    /// soon as a link is already at least that urgent. The walk is bounded
    /// by the pool size; a longer chain would have to cycle.
    pub(crate) fn boost_chain(&mut self, start: ThreadId, prio: Priority) {
        let mut t = start;
        for _ in 0..MUTEX_NUM {
            if self.tcb(t).priority <= prio {
                break;
            }
            self.reposition(t, prio);
            let Some(ctx) = self.tcb(t).ipc else { break };
            let ObjectId::Mutex(i) = ctx.object else { break };
            let Some(m) = self.mutexes[i].as_mut() else {
                break;
            };
            if prio < m.ceiling {
                m.ceiling = prio;
            }
            let Some(h) = m.holder else { break };
            t = h;
        }
    }

    /// Recompute `t`'s effective priority from its base and the ceilings
    /// of the mutexes it still holds.
    pub(crate) fn recompute_priority(&mut self, t: ThreadId) {
        let mut eff = self.tcb(t).base_priority;
        for m in self.mutexes.iter().flatten() {
            if m.holder == Some(t) && m.ceiling < eff {
                eff = m.ceiling;
            }
        }
        if eff != self.tcb(t).priority {
            self.reposition(t, eff);
        }
    }

    /// Re-derive a mutex's ceiling from the waiters still parked on it.
    pub(crate) fn mutex_refresh_ceiling(&mut self, i: usize) {
        let Some(m) = self.mutexes[i] else { return };
        let mut ceil = PRIO_MAX;
        for n in m.wait.primary.iter(&self.ipc_links) {
            let p = self.threads[n].as_ref().map_or(PRIO_MAX, |t| t.priority);
            if p < ceil {
                ceil = p;
            }
        }
        if let Some(mb) = self.mutexes[i].as_mut() {
            mb.ceiling = ceil;
        }
    }
}

/// Allocate a mutex. The wait queue is always priority ordered.
pub fn create() -> Result<MutexId, IpcError> {
    if !IPC_ENABLE {
        return Err(IpcError::Unready);
    }
    kernel::with_kernel(|k| {
        let slot = k
            .mutexes
            .iter()
            .position(|s| s.is_none())
            .ok_or(IpcError::Fault)?;
        k.mutexes[slot] = Some(MutexCb {
            wait: WaitQueue::new(QueueProperty::PRIMARY_PRIO),
            holder: None,
            ceiling: PRIO_MAX,
        });
        log::debug!("mutex {} created", slot);
        Ok(MutexId(slot))
    })
}

/// Destroy a mutex. Waiters wake with the deleted verdict and a still-live
/// holder sheds the boost this mutex was lending it.
pub fn delete(id: MutexId) -> Result<(), IpcError> {
    kernel::with_kernel(|k| {
        let holder = k.mutex(id)?.holder;
        let mut hirp = false;
        k.ipc_unblock_all(
            ObjectId::Mutex(id.0),
            IpcState::Failure,
            IpcError::Deleted,
            None,
            &mut hirp,
        );
        k.mutexes[id.0] = None;
        if let Some(h) = holder {
            if PRIORITY_INHERITANCE_ENABLE {
                k.recompute_priority(h);
            }
        }
        k.reschedule();
        Ok(())
    })
}

/// Acquire the mutex, waiting per `ticks` while someone else holds it.
/// Recursive acquisition is a fault.
pub fn lock(id: MutexId, ticks: Option<Tick>) -> Result<(), IpcError> {
    let obj = ObjectId::Mutex(id.0);
    let fast = kernel::with_kernel(|k| {
        let Some(cur) = k.current else {
            k.fatal(Diagnosis::IPC_ERROR, "mutex lock with no current thread");
        };
        let holder = k.mutex(id)?.holder;
        match holder {
            None => {
                k.mutex_mut(id)?.holder = Some(cur);
                Ok(Some(()))
            }
            Some(h) if h == cur => Err(IpcError::Fault),
            Some(h) => match ticks {
                Some(0) => Err(IpcError::Timeout),
                _ => {
                    let my = k.tcb(cur).priority;
                    let m = k.mutex_mut(id)?;
                    if my < m.ceiling {
                        m.ceiling = my;
                    }
                    if PRIORITY_INHERITANCE_ENABLE {
                        k.boost_chain(h, my);
                    }
                    let mut opt = IpcOption::WAIT;
                    if ticks.is_some() {
                        opt |= IpcOption::TIMED;
                    }
                    k.ipc_block_current(obj, opt, 0, ticks.unwrap_or(0));
                    Ok(None)
                }
            },
        }
    })?;
    match fast {
        Some(()) => Ok(()),
        None => match finish_wait() {
            Ok(_) => Ok(()),
            Err(e) => {
                // the wait failed; withdraw this thread's urgency from the
                // mutex and from the holder it was lending to
                kernel::with_kernel(|k| {
                    if k.mutexes[id.0].is_some() {
                        k.mutex_refresh_ceiling(id.0);
                        if let Some(h) = k.mutexes[id.0].and_then(|m| m.holder) {
                            if PRIORITY_INHERITANCE_ENABLE {
                                k.recompute_priority(h);
                            }
                        }
                    }
                });
                Err(e)
            }
        },
    }
}

/// Release the mutex, handing it to the most urgent waiter if any.
pub fn unlock(id: MutexId) -> Result<(), IpcError> {
    let obj = ObjectId::Mutex(id.0);
    kernel::with_kernel(|k| {
        let Some(cur) = k.current else {
            k.fatal(Diagnosis::IPC_ERROR, "mutex unlock with no current thread");
        };
        if k.mutex(id)?.holder != Some(cur) {
            return Err(IpcError::Fault);
        }
        k.mutex_mut(id)?.holder = None;
        if PRIORITY_INHERITANCE_ENABLE {
            // shed the boost this mutex was lending us
            k.recompute_priority(cur);
        }
        let mut hirp = false;
        if let Some(w) = k.wait_queue(obj).primary.front() {
            let w = ThreadId(w);
            k.ipc_unblock_one(w, IpcState::Success, IpcError::None, &mut hirp);
            k.mutex_mut(id)?.holder = Some(w);
            k.mutex_refresh_ceiling(id.0);
        } else {
            k.mutex_mut(id)?.ceiling = PRIO_MAX;
        }
        // either we dropped urgency or someone more urgent woke up
        k.reschedule();
        Ok(())
    })
}
