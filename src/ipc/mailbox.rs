/*
 * Mailbox
 *
 * Single-slot mail exchange carrying one machine word. Receivers park on
 * the primary sub-queue when the slot is empty; senders park on the
 * auxiliary sub-queue when it is full. This is the canonical two-class use
 * of the wait queue: one object, two kinds of waiters.
 *
 * A send with a parked receiver hands the mail over directly without
 * touching the slot; a receive with a parked sender drains the slot and
 * refills it from the first sender in line.
 */

use core::fmt;

use crate::config::{IPC_ENABLE, Tick};
use crate::ipc::{
    IpcError, IpcOption, IpcState, ObjectId, QueueProperty, WaitQueue, finish_wait,
};
use crate::kernel::{self, Kernel};
use crate::sched::thread::ThreadId;

/// Mailbox handle: the slot index in the mailbox pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxId(pub usize);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mailbox({})", self.0)
    }
}

/// Ordering of waiters on both sub-queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    Fifo,
    Priority,
}

/// Mailbox control block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Mailbox {
    pub wait: WaitQueue,
    pub mail: Option<u32>,
}

impl Kernel {
    fn mailbox(&self, id: MailboxId) -> Result<&Mailbox, IpcError> {
        self.mailboxes
            .get(id.0)
            .and_then(|s| s.as_ref())
            .ok_or(IpcError::Unready)
    }

    fn mailbox_mut(&mut self, id: MailboxId) -> Result<&mut Mailbox, IpcError> {
        self.mailboxes
            .get_mut(id.0)
            .and_then(|s| s.as_mut())
            .ok_or(IpcError::Unready)
    }
}

/// Allocate a mailbox.
pub fn create(policy: WaitPolicy) -> Result<MailboxId, IpcError> {
    if !IPC_ENABLE {
        return Err(IpcError::Unready);
    }
    kernel::with_kernel(|k| {
        let slot = k
            .mailboxes
            .iter()
            .position(|s| s.is_none())
            .ok_or(IpcError::Fault)?;
        let property = match policy {
            WaitPolicy::Fifo => QueueProperty::empty(),
            WaitPolicy::Priority => QueueProperty::PRIMARY_PRIO | QueueProperty::AUXILIARY_PRIO,
        };
        k.mailboxes[slot] = Some(Mailbox {
            wait: WaitQueue::new(property),
            mail: None,
        });
        log::debug!("mailbox {} created", slot);
        Ok(MailboxId(slot))
    })
}

/// Destroy a mailbox. Every waiter is woken with the deleted verdict.
pub fn delete(id: MailboxId) -> Result<(), IpcError> {
    kernel::with_kernel(|k| {
        k.mailbox(id)?;
        let mut hirp = false;
        k.ipc_unblock_all(
            ObjectId::Mailbox(id.0),
            IpcState::Failure,
            IpcError::Deleted,
            None,
            &mut hirp,
        );
        k.mailboxes[id.0] = None;
        log::debug!("mailbox {} deleted", id.0);
        if hirp {
            k.reschedule();
        }
        Ok(())
    })
}

/// Receive a mail word. `ticks` of None waits indefinitely, Some(0) never
/// waits, anything else bounds the wait.
pub fn receive(id: MailboxId, ticks: Option<Tick>) -> Result<u32, IpcError> {
    let obj = ObjectId::Mailbox(id.0);
    let fast = kernel::with_kernel(|k| {
        let taken = k.mailbox_mut(id)?.mail.take();
        if let Some(mail) = taken {
            // the first parked sender refills the slot
            if let Some(s) = k.wait_queue(obj).auxiliary.front() {
                let s = ThreadId(s);
                let refill = k.tcb(s).ipc.map(|ctx| ctx.data);
                let mut hirp = false;
                k.ipc_unblock_one(s, IpcState::Success, IpcError::None, &mut hirp);
                k.mailbox_mut(id)?.mail = refill;
                if hirp {
                    k.reschedule();
                }
            }
            return Ok(Some(mail));
        }
        match ticks {
            Some(0) => Err(IpcError::Timeout),
            _ => {
                let mut opt = IpcOption::WAIT | IpcOption::DATA_SINK;
                if ticks.is_some() {
                    opt |= IpcOption::TIMED;
                }
                k.ipc_block_current(obj, opt, 0, ticks.unwrap_or(0));
                Ok(None)
            }
        }
    })?;
    match fast {
        Some(mail) => Ok(mail),
        None => finish_wait(),
    }
}

/// Send a mail word, waiting out a full slot per `ticks`.
pub fn send(id: MailboxId, mail: u32, ticks: Option<Tick>) -> Result<(), IpcError> {
    let obj = ObjectId::Mailbox(id.0);
    let fast = kernel::with_kernel(|k| {
        if k.mailbox(id)?.mail.is_none() {
            // hand over directly when a receiver is already parked
            if let Some(r) = k.wait_queue(obj).primary.front() {
                let r = ThreadId(r);
                let mut hirp = false;
                k.ipc_unblock_one(r, IpcState::Success, IpcError::None, &mut hirp);
                if let Some(ctx) = k.tcb_mut(r).ipc.as_mut() {
                    ctx.data = mail;
                }
                if hirp {
                    k.reschedule();
                }
            } else {
                k.mailbox_mut(id)?.mail = Some(mail);
            }
            return Ok(Some(()));
        }
        match ticks {
            Some(0) => Err(IpcError::Timeout),
            _ => {
                let mut opt = IpcOption::WAIT | IpcOption::USE_AUXILIARY;
                if ticks.is_some() {
                    opt |= IpcOption::TIMED;
                }
                k.ipc_block_current(obj, opt, mail, ticks.unwrap_or(0));
                Ok(None)
            }
        }
    })?;
    match fast {
        Some(()) => Ok(()),
        None => finish_wait().map(|_| ()),
    }
}

/// Deliver one mail word to every parked receiver at once. Fails when
/// nobody is waiting.
pub fn broadcast(id: MailboxId, mail: u32) -> Result<(), IpcError> {
    let obj = ObjectId::Mailbox(id.0);
    kernel::with_kernel(|k| {
        k.mailbox(id)?;
        if !k
            .wait_queue(obj)
            .property
            .contains(QueueProperty::PRIMARY_AVAIL)
        {
            return Err(IpcError::Unready);
        }
        let mut hirp = false;
        k.ipc_unblock_all(obj, IpcState::Success, IpcError::None, Some(mail), &mut hirp);
        if hirp {
            k.reschedule();
        }
        Ok(())
    })
}

/// Abort every pending wait on the mailbox with the flush verdict.
pub fn flush(id: MailboxId) -> Result<(), IpcError> {
    kernel::with_kernel(|k| {
        k.mailbox(id)?;
        let mut hirp = false;
        k.ipc_unblock_all(
            ObjectId::Mailbox(id.0),
            IpcState::Failure,
            IpcError::Flush,
            None,
            &mut hirp,
        );
        if hirp {
            k.reschedule();
        }
        Ok(())
    })
}
