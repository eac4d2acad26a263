/*
 * Counting Semaphore
 *
 * Classic obtain/release counter on top of the blocking substrate. A
 * release with parked waiters never touches the count: the permit moves
 * straight to the first thread in line.
 */

use core::fmt;

use crate::config::{IPC_ENABLE, Tick};
use crate::ipc::{
    IpcError, IpcOption, IpcState, ObjectId, QueueProperty, WaitQueue, finish_wait,
};
use crate::kernel::{self, Kernel};
use crate::sched::thread::ThreadId;

use super::mailbox::WaitPolicy;

/// Semaphore handle: the slot index in the semaphore pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreId(pub usize);

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Semaphore({})", self.0)
    }
}

/// Semaphore control block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Semaphore {
    pub wait: WaitQueue,
    pub count: u32,
    pub limit: u32,
}

impl Kernel {
    fn semaphore(&self, id: SemaphoreId) -> Result<&Semaphore, IpcError> {
        self.semaphores
            .get(id.0)
            .and_then(|s| s.as_ref())
            .ok_or(IpcError::Unready)
    }

    fn semaphore_mut(&mut self, id: SemaphoreId) -> Result<&mut Semaphore, IpcError> {
        self.semaphores
            .get_mut(id.0)
            .and_then(|s| s.as_mut())
            .ok_or(IpcError::Unready)
    }
}

/// Allocate a semaphore with an initial count and an upper bound.
pub fn create(initial: u32, limit: u32, policy: WaitPolicy) -> Result<SemaphoreId, IpcError> {
    if !IPC_ENABLE {
        return Err(IpcError::Unready);
    }
    if limit == 0 || initial > limit {
        return Err(IpcError::Fault);
    }
    kernel::with_kernel(|k| {
        let slot = k
            .semaphores
            .iter()
            .position(|s| s.is_none())
            .ok_or(IpcError::Fault)?;
        let property = match policy {
            WaitPolicy::Fifo => QueueProperty::empty(),
            WaitPolicy::Priority => QueueProperty::PRIMARY_PRIO,
        };
        k.semaphores[slot] = Some(Semaphore {
            wait: WaitQueue::new(property),
            count: initial,
            limit,
        });
        log::debug!("semaphore {} created ({}/{})", slot, initial, limit);
        Ok(SemaphoreId(slot))
    })
}

/// Destroy a semaphore, waking every waiter with the deleted verdict.
pub fn delete(id: SemaphoreId) -> Result<(), IpcError> {
    kernel::with_kernel(|k| {
        k.semaphore(id)?;
        let mut hirp = false;
        k.ipc_unblock_all(
            ObjectId::Semaphore(id.0),
            IpcState::Failure,
            IpcError::Deleted,
            None,
            &mut hirp,
        );
        k.semaphores[id.0] = None;
        if hirp {
            k.reschedule();
        }
        Ok(())
    })
}

/// Take one permit, waiting per `ticks` when none is available.
pub fn obtain(id: SemaphoreId, ticks: Option<Tick>) -> Result<(), IpcError> {
    let obj = ObjectId::Semaphore(id.0);
    let fast = kernel::with_kernel(|k| {
        let sem = k.semaphore_mut(id)?;
        if sem.count > 0 {
            sem.count -= 1;
            return Ok(Some(()));
        }
        match ticks {
            Some(0) => Err(IpcError::Timeout),
            _ => {
                let mut opt = IpcOption::WAIT;
                if ticks.is_some() {
                    opt |= IpcOption::TIMED;
                }
                k.ipc_block_current(obj, opt, 0, ticks.unwrap_or(0));
                Ok(None)
            }
        }
    })?;
    match fast {
        Some(()) => Ok(()),
        None => finish_wait().map(|_| ()),
    }
}

/// Return one permit. A parked waiter receives it directly; otherwise the
/// count grows up to the configured bound.
pub fn release(id: SemaphoreId) -> Result<(), IpcError> {
    let obj = ObjectId::Semaphore(id.0);
    kernel::with_kernel(|k| {
        k.semaphore(id)?;
        if let Some(w) = k.wait_queue(obj).primary.front() {
            let mut hirp = false;
            k.ipc_unblock_one(ThreadId(w), IpcState::Success, IpcError::None, &mut hirp);
            if hirp {
                k.reschedule();
            }
            return Ok(());
        }
        let sem = k.semaphore_mut(id)?;
        if sem.count >= sem.limit {
            return Err(IpcError::Fault);
        }
        sem.count += 1;
        Ok(())
    })
}
