/*
 * IPC Blocking Substrate
 *
 * Every synchronization primitive in the kernel reduces to three moves on
 * the machinery in this module: park the running thread on an object's
 * wait queue, wake one specific waiter, or wake them all.
 *
 * Each object carries a wait queue made of two sub-queues. The primary
 * sub-queue holds the ordinary class of waiters; the auxiliary sub-queue
 * holds the second class where a primitive needs one (mailbox senders
 * opposite receivers). Each sub-queue independently orders its waiters
 * FIFO or by priority, recorded in the queue's property word alongside a
 * non-empty flag per sub-queue.
 *
 * A blocking call describes itself with an `IpcContext`: which object,
 * which sub-queue, the exchanged datum, and the (state, error) result pair
 * that the unblocker fills in. The context lives in the blocked thread's
 * control block for exactly the duration of the wait; the resumed call
 * consumes it with `ipc_take_result`.
 */

pub mod mailbox;
pub mod mutex;
pub mod semaphore;

use core::fmt;

use bitflags::bitflags;

use crate::config::{PRIO_MAX, Tick};
use crate::kernel::{Diagnosis, ExecContext, Kernel};
use crate::list::ListHead;
use crate::sched::QueuePos;
use crate::sched::thread::{ThreadId, ThreadState};

bitflags! {
    /// Wait queue policy and occupancy word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueProperty: u32 {
        /// Primary sub-queue orders waiters by priority.
        const PRIMARY_PRIO = 1 << 0;
        /// Auxiliary sub-queue orders waiters by priority.
        const AUXILIARY_PRIO = 1 << 1;
        /// Primary sub-queue is non-empty.
        const PRIMARY_AVAIL = 1 << 2;
        /// Auxiliary sub-queue is non-empty.
        const AUXILIARY_AVAIL = 1 << 3;
    }

    /// Options describing one blocking call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcOption: u32 {
        /// Caller is willing to wait.
        const WAIT = 1 << 0;
        /// Wait is bounded by a timeout.
        const TIMED = 1 << 1;
        /// Park on the auxiliary sub-queue instead of the primary one.
        const USE_AUXILIARY = 1 << 2;
        /// Context accepts a broadcast datum during a flush or broadcast.
        const DATA_SINK = 1 << 3;
    }
}

/// Coarse outcome of a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcState {
    Success,
    Failure,
}

/// Detailed outcome, reported alongside the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Operation completed normally.
    None,
    /// A timed wait expired.
    Timeout,
    /// Wait was aborted by a flush of the whole queue.
    Flush,
    /// Target object was deleted while waiting.
    Deleted,
    /// Object or request not in an operable state.
    Unready,
    /// Generic precondition failure; also the primed value of a fresh
    /// context before anything resolved it.
    Fault,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::None => write!(f, "no error"),
            IpcError::Timeout => write!(f, "wait timed out"),
            IpcError::Flush => write!(f, "wait flushed"),
            IpcError::Deleted => write!(f, "object deleted"),
            IpcError::Unready => write!(f, "object not ready"),
            IpcError::Fault => write!(f, "precondition failure"),
        }
    }
}

/// Identity of a synchronization object: pool plus slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectId {
    Mailbox(usize),
    Semaphore(usize),
    Mutex(usize),
}

/// Descriptor of one in-flight blocking call, stored in the owner's
/// control block while it waits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IpcContext {
    pub object: ObjectId,
    pub option: IpcOption,
    /// Exchanged datum: carries a sender's mail in, a receiver's mail out.
    pub data: u32,
    /// Out-parameter pair written by the unblocker.
    pub state: IpcState,
    pub error: IpcError,
}

/// Wait queue attached to every synchronization object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitQueue {
    pub primary: ListHead,
    pub auxiliary: ListHead,
    pub property: QueueProperty,
}

impl WaitQueue {
    pub fn new(policy: QueueProperty) -> Self {
        WaitQueue {
            primary: ListHead::EMPTY,
            auxiliary: ListHead::EMPTY,
            property: policy,
        }
    }
}

impl Kernel {
    pub(crate) fn wait_queue(&self, obj: ObjectId) -> &WaitQueue {
        match obj {
            ObjectId::Mailbox(i) => match self.mailboxes[i].as_ref() {
                Some(mb) => &mb.wait,
                None => panic!("kernel fatal: wait queue of dead mailbox {}", i),
            },
            ObjectId::Semaphore(i) => match self.semaphores[i].as_ref() {
                Some(sem) => &sem.wait,
                None => panic!("kernel fatal: wait queue of dead semaphore {}", i),
            },
            ObjectId::Mutex(i) => match self.mutexes[i].as_ref() {
                Some(m) => &m.wait,
                None => panic!("kernel fatal: wait queue of dead mutex {}", i),
            },
        }
    }

    fn wait_queue_mut(&mut self, obj: ObjectId) -> &mut WaitQueue {
        match obj {
            ObjectId::Mailbox(i) => match self.mailboxes[i].as_mut() {
                Some(mb) => &mut mb.wait,
                None => panic!("kernel fatal: wait queue of dead mailbox {}", i),
            },
            ObjectId::Semaphore(i) => match self.semaphores[i].as_mut() {
                Some(sem) => &mut sem.wait,
                None => panic!("kernel fatal: wait queue of dead semaphore {}", i),
            },
            ObjectId::Mutex(i) => match self.mutexes[i].as_mut() {
                Some(m) => &mut m.wait,
                None => panic!("kernel fatal: wait queue of dead mutex {}", i),
            },
        }
    }

    /// Link `t`'s context into the object's wait queue per its options and
    /// the queue's policy, and mark the sub-queue occupied.
    fn ipc_enqueue(&mut self, obj: ObjectId, t: ThreadId) {
        let opt = match self.tcb(t).ipc {
            Some(ctx) => ctx.option,
            None => self.fatal(Diagnosis::IPC_ERROR, "enqueue without context"),
        };
        let mut q = *self.wait_queue(obj);
        {
            let Kernel {
                ipc_links, threads, ..
            } = self;
            let key = |i: usize| threads[i].as_ref().map_or(PRIO_MAX, |tcb| tcb.priority);
            if opt.contains(IpcOption::USE_AUXILIARY) {
                if q.property.contains(QueueProperty::AUXILIARY_PRIO) {
                    q.auxiliary.push_sorted(ipc_links, t.0, key);
                } else {
                    q.auxiliary.push_tail(ipc_links, t.0);
                }
                q.property |= QueueProperty::AUXILIARY_AVAIL;
            } else {
                if q.property.contains(QueueProperty::PRIMARY_PRIO) {
                    q.primary.push_sorted(ipc_links, t.0, key);
                } else {
                    q.primary.push_tail(ipc_links, t.0);
                }
                q.property |= QueueProperty::PRIMARY_AVAIL;
            }
        }
        *self.wait_queue_mut(obj) = q;
    }

    /// Unlink `t` from the object's wait queue, dropping the occupancy
    /// flag when the sub-queue empties.
    pub(crate) fn ipc_dequeue(&mut self, obj: ObjectId, t: ThreadId, opt: IpcOption) {
        let mut q = *self.wait_queue(obj);
        if opt.contains(IpcOption::USE_AUXILIARY) {
            q.auxiliary.remove(&mut self.ipc_links, t.0);
            if q.auxiliary.is_empty() {
                q.property -= QueueProperty::AUXILIARY_AVAIL;
            }
        } else {
            q.primary.remove(&mut self.ipc_links, t.0);
            if q.primary.is_empty() {
                q.property -= QueueProperty::PRIMARY_AVAIL;
            }
        }
        *self.wait_queue_mut(obj) = q;
    }

    /// Park the running thread on `obj`'s wait queue.
    ///
    /// Only the running thread, in thread context, may block itself;
    /// anything else is a programmer error and stops the kernel.
    pub(crate) fn ipc_block_current(
        &mut self,
        obj: ObjectId,
        option: IpcOption,
        data: u32,
        ticks: Tick,
    ) {
        if self.context == ExecContext::Isr {
            self.fatal(Diagnosis::IPC_ERROR, "blocking call from an ISR");
        }
        let Some(cur) = self.current else {
            self.fatal(Diagnosis::IPC_ERROR, "blocking call with no current thread");
        };
        if self.tcb(cur).state != ThreadState::Running {
            self.diagnosis |= Diagnosis::THREAD_ERROR;
            self.fatal(Diagnosis::IPC_ERROR, "blocking a thread that is not running");
        }

        self.leave_ready(cur);
        self.blocked.push_tail(&mut self.sched_links, cur.0);
        let tcb = self.tcb_mut(cur);
        tcb.state = ThreadState::Blocked;
        // out-parameters are primed pessimistic; the unblocker overwrites
        tcb.ipc = Some(IpcContext {
            object: obj,
            option,
            data,
            state: IpcState::Failure,
            error: IpcError::Fault,
        });
        self.ipc_enqueue(obj, cur);
        if option.contains(IpcOption::TIMED) && ticks > 0 {
            self.timer_arm(cur, ticks);
        }
        self.reschedule();
    }

    /// Wake the blocked thread `t`, writing `state` and `error` into its
    /// context and setting `hirp` when the wakeup outranks the current
    /// thread. `hirp` is only meaningful in thread context; ISR callers
    /// ignore it and decide at the handler tail instead.
    pub(crate) fn ipc_unblock_one(
        &mut self,
        t: ThreadId,
        state: IpcState,
        error: IpcError,
        hirp: &mut bool,
    ) {
        if self.tcb(t).state != ThreadState::Blocked {
            self.diagnosis |= Diagnosis::THREAD_ERROR;
            self.fatal(Diagnosis::IPC_ERROR, "unblocking a thread that is not blocked");
        }
        let Some(ctx) = self.tcb(t).ipc else {
            self.fatal(Diagnosis::IPC_ERROR, "unblocking a thread with no context");
        };

        self.blocked.remove(&mut self.sched_links, t.0);
        if self.current == Some(t) {
            // only reachable when an ISR preempted the block path between
            // queue transfer and context switch: the thread gets its head
            // slot back and simply keeps running
            self.diag_assert(
                self.context == ExecContext::Isr,
                Diagnosis::IPC_ERROR,
                "current thread unblocked outside an ISR",
            );
            self.enter_ready(t, QueuePos::Head);
            self.tcb_mut(t).state = ThreadState::Running;
        } else {
            self.enter_ready(t, QueuePos::Tail);
            self.tcb_mut(t).state = ThreadState::Ready;
        }

        self.ipc_dequeue(ctx.object, t, ctx.option);

        let tcb = self.tcb_mut(t);
        if let Some(out) = tcb.ipc.as_mut() {
            out.state = state;
            out.error = error;
        }
        if ctx.option.contains(IpcOption::TIMED) {
            self.timer_cancel(t);
        }
        if let Some(cur) = self.current {
            if t != cur && self.tcb(t).priority < self.tcb(cur).priority {
                *hirp = true;
            }
        }
    }

    /// Flush the whole queue: auxiliary waiters first, then primary, each
    /// sub-queue in its standing order. `data`, when given, is copied into
    /// every context that registered itself as a sink.
    pub(crate) fn ipc_unblock_all(
        &mut self,
        obj: ObjectId,
        state: IpcState,
        error: IpcError,
        data: Option<u32>,
        hirp: &mut bool,
    ) {
        loop {
            let Some(h) = self.wait_queue(obj).auxiliary.front() else {
                break;
            };
            self.flush_one(ThreadId(h), state, error, data, hirp);
        }
        loop {
            let Some(h) = self.wait_queue(obj).primary.front() else {
                break;
            };
            self.flush_one(ThreadId(h), state, error, data, hirp);
        }
    }

    fn flush_one(
        &mut self,
        t: ThreadId,
        state: IpcState,
        error: IpcError,
        data: Option<u32>,
        hirp: &mut bool,
    ) {
        let sink = self
            .tcb(t)
            .ipc
            .is_some_and(|ctx| ctx.option.contains(IpcOption::DATA_SINK));
        self.ipc_unblock_one(t, state, error, hirp);
        if let (Some(d), true) = (data, sink) {
            if let Some(ctx) = self.tcb_mut(t).ipc.as_mut() {
                ctx.data = d;
            }
        }
    }

    /// Re-sort `t` within its sub-queue after a priority change. FIFO
    /// sub-queues keep their order.
    pub(crate) fn ipc_requeue(&mut self, t: ThreadId) {
        let Some(ctx) = self.tcb(t).ipc else {
            return;
        };
        let use_aux = ctx.option.contains(IpcOption::USE_AUXILIARY);
        let mut q = *self.wait_queue(ctx.object);
        let sorted = if use_aux {
            q.property.contains(QueueProperty::AUXILIARY_PRIO)
        } else {
            q.property.contains(QueueProperty::PRIMARY_PRIO)
        };
        if !sorted {
            return;
        }
        {
            let Kernel {
                ipc_links, threads, ..
            } = self;
            let key = |i: usize| threads[i].as_ref().map_or(PRIO_MAX, |tcb| tcb.priority);
            let sub = if use_aux { &mut q.auxiliary } else { &mut q.primary };
            sub.remove(ipc_links, t.0);
            sub.push_sorted(ipc_links, t.0, key);
        }
        *self.wait_queue_mut(ctx.object) = q;
    }

    /// Consume the context of a wait that just finished, returning the
    /// (state, error, datum) triple its unblocker left behind.
    pub(crate) fn ipc_take_result(&mut self, t: ThreadId) -> (IpcState, IpcError, u32) {
        let Some(ctx) = self.tcb_mut(t).ipc.take() else {
            self.fatal(Diagnosis::IPC_ERROR, "wait finished without a context");
        };
        (ctx.state, ctx.error, ctx.data)
    }
}

/// Tail of every blocking primitive call: executed when the thread resumes
/// after its wait was resolved. Translates the context's out-parameter pair
/// into the Result the caller sees.
pub(crate) fn finish_wait() -> Result<u32, IpcError> {
    crate::kernel::with_kernel(|k| {
        let Some(cur) = k.current else {
            k.fatal(Diagnosis::IPC_ERROR, "wait finished with no current thread");
        };
        if k.tcb(cur).state == ThreadState::Blocked {
            // resuming a still-blocked thread means the port's switch hook
            // never actually suspended the caller
            k.fatal(Diagnosis::STATE_ERROR, "resumed while still blocked");
        }
        let (state, error, data) = k.ipc_take_result(cur);
        match state {
            IpcState::Success => Ok(data),
            IpcState::Failure => Err(error),
        }
    })
}
