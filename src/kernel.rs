/*
 * Kernel State and Bootstrap
 *
 * This module owns the single process-wide kernel structure: the thread
 * table with its link arenas, the ready queue, the blocked list, the timer
 * list, the synchronization object pools and the bookkeeping that tells the
 * rest of the core which execution context it is running in.
 *
 * All of it sits behind one spin lock. Callers never take the lock
 * directly; `with_kernel` masks interrupts through the port hooks first and
 * only then locks, which keeps the single-core critical-section discipline
 * intact: an ISR can never spin on a lock its own CPU is holding.
 *
 * Module bring-up order is fixed: kernel state, then the interrupt layer,
 * then IPC, threads and finally the clock. `init` performs it; `start`
 * hands the CPU to the highest-priority ready thread and never returns.
 */

use bitflags::bitflags;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{
    MAILBOX_NUM, MUTEX_NUM, SEMAPHORE_NUM, THREAD_NUM,
};
use crate::ipc::mailbox::Mailbox;
use crate::ipc::mutex::MutexCb;
use crate::ipc::semaphore::Semaphore;
use crate::irq;
use crate::list::{Link, ListHead};
use crate::port::{self, CpuPort};
use crate::sched::ReadyQueue;
use crate::sched::thread::{Tcb, ThreadId, ThreadState};
use crate::sched::timer::TimerList;

/// Execution context the kernel is currently running in.
///
/// `Origin` covers everything before the first thread is dispatched. The
/// kernel refuses operations that make no sense for the active context,
/// such as a blocking call from an ISR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    Origin,
    Thread,
    Isr,
}

bitflags! {
    /// Sticky record of detected invariant violations. Purely diagnostic;
    /// every setter also takes the fatal path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Diagnosis: u32 {
        const THREAD_ERROR = 1 << 0;
        const LIST_ERROR   = 1 << 1;
        const IPC_ERROR    = 1 << 2;
        const IRQ_ERROR    = 1 << 3;
        const STATE_ERROR  = 1 << 4;
    }
}

/// The process-wide kernel structure. Zero dynamic allocation: every table
/// is sized by `config` and lives inside this one static.
pub(crate) struct Kernel {
    pub context: ExecContext,
    pub isr_nesting: u32,
    pub sched_locked: u32,
    pub current: Option<ThreadId>,
    pub jiffies: u64,
    pub diagnosis: Diagnosis,
    pub port: CpuPort,

    pub threads: [Option<Tcb>; THREAD_NUM],
    /// Links for the ready queue and the blocked list. A thread occupies at
    /// most one of the two at any time, so they share an arena.
    pub sched_links: [Link; THREAD_NUM],
    pub timer_links: [Link; THREAD_NUM],
    pub ipc_links: [Link; THREAD_NUM],

    pub ready: ReadyQueue,
    /// Kernel-wide list of all currently blocked threads.
    pub blocked: ListHead,
    pub timer: TimerList,

    pub daemon: Option<ThreadId>,

    pub mailboxes: [Option<Mailbox>; MAILBOX_NUM],
    pub semaphores: [Option<Semaphore>; SEMAPHORE_NUM],
    pub mutexes: [Option<MutexCb>; MUTEX_NUM],
}

impl Kernel {
    fn new(port: CpuPort) -> Self {
        Kernel {
            context: ExecContext::Origin,
            isr_nesting: 0,
            sched_locked: 0,
            current: None,
            jiffies: 0,
            diagnosis: Diagnosis::empty(),
            port,
            threads: [None; THREAD_NUM],
            sched_links: [Link::DETACHED; THREAD_NUM],
            timer_links: [Link::DETACHED; THREAD_NUM],
            ipc_links: [Link::DETACHED; THREAD_NUM],
            ready: ReadyQueue::new(),
            blocked: ListHead::EMPTY,
            timer: TimerList::new(),
            daemon: None,
            mailboxes: [None; MAILBOX_NUM],
            semaphores: [None; SEMAPHORE_NUM],
            mutexes: [None; MUTEX_NUM],
        }
    }

    /// Record a violated invariant and stop. Reserved for programmer
    /// errors; runtime contention outcomes are reported through error
    /// codes instead.
    pub(crate) fn fatal(&mut self, diag: Diagnosis, msg: &str) -> ! {
        self.diagnosis |= diag;
        log::error!("kernel fatal ({:?}): {}", diag, msg);
        panic!("kernel fatal: {}", msg);
    }

    pub(crate) fn diag_assert(&mut self, cond: bool, diag: Diagnosis, msg: &str) {
        if crate::config::DIAG_ASSERT_ENABLE && !cond {
            self.fatal(diag, msg);
        }
    }
}

lazy_static! {
    static ref KERNEL: Mutex<Kernel> = Mutex::new(Kernel::new(CpuPort::noop()));
}

/// Run `f` with the kernel locked, inside the port's interrupt mask.
pub(crate) fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let hooks = port::current();
    let mask = (hooks.enter_critical)();
    let r = f(&mut KERNEL.lock());
    (hooks.leave_critical)(mask);
    r
}

/// Run `f` with the kernel locked but without touching the interrupt mask.
/// For callers that already hold the port's critical section and must keep
/// it across several lock acquisitions.
pub(crate) fn with_kernel_unmasked<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    f(&mut KERNEL.lock())
}

/// Initialize the kernel core. Performs the fixed module bring-up order:
/// kernel state, interrupt layer, IPC pools, thread table, clock. Calling
/// it again resets everything, which the host-side tests rely on.
pub fn init(cpu: CpuPort) {
    port::install(cpu);
    with_kernel(|k| {
        *k = Kernel::new(cpu);
    });
    irq::module_init();
    log::info!("kernel core initialized");
}

/// Dispatch the first thread. The port's `load_root_thread` hook must not
/// return; the trailing loop only guards against a misbehaving port.
pub fn start() -> ! {
    let hooks = port::current();
    with_kernel(|k| launch(k));
    (hooks.load_root_thread)();
    loop {
        core::hint::spin_loop();
    }
}

/// Pick the first thread and flip the kernel into thread context.
pub(crate) fn launch(k: &mut Kernel) {
    if k.context != ExecContext::Origin {
        k.fatal(Diagnosis::STATE_ERROR, "start called twice");
    }
    let Some(first) = k.select_next() else {
        k.fatal(Diagnosis::STATE_ERROR, "start with no ready thread");
    };
    k.tcb_mut(first).state = ThreadState::Running;
    k.current = Some(first);
    k.context = ExecContext::Thread;
    log::info!("dispatching root thread {}", first);
}

/// Periodic clock entry, called by the port once per tick. Safe from both
/// thread context and the timer ISR; in the latter case the preemption
/// decision is deferred to the tail of `irq::enter_isr`.
pub fn tick() {
    with_kernel(|k| k.tick_handler());
}

/// Ticks elapsed since `start`.
pub fn jiffies() -> u64 {
    with_kernel(|k| k.jiffies)
}

/// Execution context the caller is running in.
pub fn context() -> ExecContext {
    with_kernel(|k| k.context)
}

/// Accumulated diagnosis word.
pub fn diagnosis() -> Diagnosis {
    with_kernel(|k| k.diagnosis)
}

/// Mark entry into an ISR. Called by the interrupt layer only.
pub(crate) fn isr_enter(k: &mut Kernel) {
    k.diag_assert(
        k.context != ExecContext::Origin,
        Diagnosis::STATE_ERROR,
        "interrupt before first dispatch",
    );
    k.isr_nesting += 1;
    k.context = ExecContext::Isr;
}

/// Mark exit from an ISR; restores thread context once the outermost
/// handler is done.
pub(crate) fn isr_exit(k: &mut Kernel) {
    k.diag_assert(k.isr_nesting > 0, Diagnosis::STATE_ERROR, "isr exit underflow");
    k.isr_nesting -= 1;
    if k.isr_nesting == 0 {
        k.context = ExecContext::Thread;
    }
}

/// Disable preemption until the matching `sched_unlock`. Nests.
pub fn sched_lock() {
    with_kernel(|k| k.sched_locked += 1);
}

/// Re-enable preemption and reschedule if anything became ready meanwhile.
pub fn sched_unlock() {
    with_kernel(|k| {
        k.diag_assert(k.sched_locked > 0, Diagnosis::STATE_ERROR, "sched unlock underflow");
        k.sched_locked -= 1;
        if k.sched_locked == 0 {
            k.reschedule();
        }
    });
}
