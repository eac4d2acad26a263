/*
 * Interrupt Layer
 *
 * Two-tier interrupt handling. The first tier is the ISR proper: the
 * port's raw vector shim calls `enter_isr` with the hardware IRQ number,
 * which resolves the registered vector through the IRQ map and runs the
 * handler with interrupts enabled. The handler's return mask decides the
 * second tier: when it asks for deferred work, the kernel's daemon thread
 * is woken to drain a priority-ordered request list in thread context.
 *
 * This bounds time spent in interrupt context to the minimum hardware work
 * plus one list insertion, and lets overlapping deferred handlers be
 * ranked against each other through the request priority.
 *
 * A vector is flagged Locked for the duration of its own ISR; mutating a
 * vector that is currently executing is refused rather than raced.
 */

use core::cell::UnsafeCell;
use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use crate::config::{
    CPU_IRQ_NUM, DAEMON_PRIORITY, DAEMON_SLICE, DAEMON_STACK_BYTES, IRQ_DAEMON_ENABLE,
    IRQ_REQUEST_NUM, IRQ_VECTOR_NUM, Priority,
};
use crate::kernel::{self, Diagnosis};
use crate::list::{Link, ListHead};
use crate::port;
use crate::sched::thread::{self, StackRegion, ThreadState};

bitflags! {
    /// Verdict returned by an ISR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IsrReturn: u32 {
        /// Hand the rest of the work to the IRQ daemon.
        const CALL_DAEMON = 1 << 0;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct VectorProperty: u32 {
        const READY  = 1 << 0;
        const LOCKED = 1 << 1;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct RequestProperty: u32 {
        const READY = 1 << 0;
    }
}

/// First-tier handler, called in interrupt context.
pub type Isr = fn(usize) -> IsrReturn;

/// Second-tier handler, called by the daemon in thread context.
pub type IrqEntry = fn(usize);

/// Errors surfaced by the interrupt layer API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// Vector is executing its own ISR right now.
    Locked,
    /// Vector or request is not in an operable state.
    Unready,
    /// Generic precondition failure: bad number, exhausted table,
    /// duplicate post.
    Fault,
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrqError::Locked => write!(f, "vector locked"),
            IrqError::Unready => write!(f, "not ready"),
            IrqError::Fault => write!(f, "precondition failure"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IrqVector {
    irqn: usize,
    isr: Isr,
    arg: usize,
    property: VectorProperty,
}

/// Fixed vector table plus the hardware-IRQ-number-to-vector map.
struct VectorTable {
    table: [Option<IrqVector>; IRQ_VECTOR_NUM],
    map: [Option<usize>; CPU_IRQ_NUM],
}

impl VectorTable {
    const fn new() -> Self {
        VectorTable {
            table: [None; IRQ_VECTOR_NUM],
            map: [None; CPU_IRQ_NUM],
        }
    }
}

static VECTORS: Mutex<VectorTable> = Mutex::new(VectorTable::new());

/// Handle naming a slot in the deferred request pool. The caller picks its
/// slot the same way it would dedicate a static request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub usize);

#[derive(Debug, Clone, Copy)]
struct IrqRequest {
    entry: IrqEntry,
    arg: usize,
    priority: Priority,
    property: RequestProperty,
}

struct RequestPool {
    slots: [Option<IrqRequest>; IRQ_REQUEST_NUM],
    links: [Link; IRQ_REQUEST_NUM],
    list: ListHead,
}

impl RequestPool {
    const fn new() -> Self {
        RequestPool {
            slots: [None; IRQ_REQUEST_NUM],
            links: [Link::DETACHED; IRQ_REQUEST_NUM],
            list: ListHead::EMPTY,
        }
    }
}

static REQUESTS: Mutex<RequestPool> = Mutex::new(RequestPool::new());

#[repr(align(16))]
struct DaemonStack(UnsafeCell<[u8; DAEMON_STACK_BYTES]>);

// The stack is only ever executed on by the daemon thread itself.
unsafe impl Sync for DaemonStack {}

static DAEMON_STACK: DaemonStack = DaemonStack(UnsafeCell::new([0; DAEMON_STACK_BYTES]));

/// Interrupt entry point, called by the port's raw vector shim.
pub fn enter_isr(irqn: usize) {
    kernel::with_kernel(|k| {
        k.diag_assert(
            irqn < CPU_IRQ_NUM,
            Diagnosis::IRQ_ERROR,
            "irq number out of range",
        );
        kernel::isr_enter(k);
    });

    // resolve the vector and pin it for the duration of the handler
    let vector = {
        let mut vt = VECTORS.lock();
        match vt.map[irqn].and_then(|slot| vt.table[slot].map(|v| (slot, v))) {
            Some((slot, v)) if v.property.contains(VectorProperty::READY) => {
                if let Some(live) = vt.table[slot].as_mut() {
                    live.property |= VectorProperty::LOCKED;
                }
                Some((slot, v.isr, v.arg))
            }
            _ => None,
        }
    };

    if let Some((slot, isr, arg)) = vector {
        let verdict = isr(arg);
        if verdict.contains(IsrReturn::CALL_DAEMON) && IRQ_DAEMON_ENABLE {
            kernel::with_kernel(|k| {
                if let Some(d) = k.daemon {
                    k.resume_from_isr(d);
                }
            });
        }
        let mut vt = VECTORS.lock();
        if let Some(v) = vt.table[slot].as_mut() {
            v.property -= VectorProperty::LOCKED;
        }
    }

    // leaving the outermost handler is a preemption point
    kernel::with_kernel(|k| {
        kernel::isr_exit(k);
        k.reschedule();
    });
}

/// Register or update the handler for a hardware IRQ number.
pub fn set_vector(irqn: usize, isr: Isr, arg: usize) -> Result<(), IrqError> {
    if irqn >= CPU_IRQ_NUM {
        return Err(IrqError::Fault);
    }
    let mut vt = VECTORS.lock();
    if let Some(slot) = vt.map[irqn] {
        let Some(v) = vt.table[slot].as_mut() else {
            return Err(IrqError::Fault);
        };
        if v.property.contains(VectorProperty::LOCKED) {
            return Err(IrqError::Locked);
        }
        v.isr = isr;
        v.arg = arg;
        return Ok(());
    }
    // first registration for this IRQ number: claim a free vector slot
    let Some(slot) = vt.table.iter().position(|v| v.is_none()) else {
        return Err(IrqError::Fault);
    };
    vt.table[slot] = Some(IrqVector {
        irqn,
        isr,
        arg,
        property: VectorProperty::READY,
    });
    vt.map[irqn] = Some(slot);
    log::debug!("irq {} vectored to slot {}", irqn, slot);
    Ok(())
}

/// Drop the handler registration for a hardware IRQ number.
pub fn clear_vector(irqn: usize) -> Result<(), IrqError> {
    if irqn >= CPU_IRQ_NUM {
        return Err(IrqError::Fault);
    }
    let mut vt = VECTORS.lock();
    let Some(slot) = vt.map[irqn] else {
        return Err(IrqError::Fault);
    };
    let Some(v) = vt.table[slot] else {
        return Err(IrqError::Fault);
    };
    if !v.property.contains(VectorProperty::READY) || v.irqn != irqn {
        return Err(IrqError::Fault);
    }
    if v.property.contains(VectorProperty::LOCKED) {
        return Err(IrqError::Locked);
    }
    vt.map[irqn] = None;
    vt.table[slot] = None;
    Ok(())
}

/// Queue a prioritized thread-context callback from an ISR. The slot must
/// be idle; posting a request that is already pending is refused.
pub fn post_request(
    req: RequestId,
    entry: IrqEntry,
    arg: usize,
    priority: Priority,
) -> Result<(), IrqError> {
    if req.0 >= IRQ_REQUEST_NUM {
        return Err(IrqError::Fault);
    }
    let mut rp = REQUESTS.lock();
    let RequestPool { slots, links, list } = &mut *rp;
    if slots[req.0].is_some() {
        return Err(IrqError::Fault);
    }
    slots[req.0] = Some(IrqRequest {
        entry,
        arg,
        priority,
        property: RequestProperty::READY,
    });
    list.push_sorted(links, req.0, |i| {
        slots[i].map_or(u8::MAX, |r| r.priority)
    });
    Ok(())
}

/// Withdraw a pending request.
pub fn cancel_request(req: RequestId) -> Result<(), IrqError> {
    if req.0 >= IRQ_REQUEST_NUM {
        return Err(IrqError::Fault);
    }
    let mut rp = REQUESTS.lock();
    let RequestPool { slots, links, list } = &mut *rp;
    match slots[req.0] {
        Some(r) if r.property.contains(RequestProperty::READY) => {
            if !links[req.0].is_attached() {
                drop(rp);
                kernel::with_kernel(|k| {
                    k.fatal(Diagnosis::IRQ_ERROR, "request marked ready but not queued");
                });
            }
            list.remove(links, req.0);
            slots[req.0] = None;
            Ok(())
        }
        _ => Err(IrqError::Unready),
    }
}

/// Pop the most urgent pending request, clearing its slot.
pub(crate) fn poll_request() -> Option<(IrqEntry, usize)> {
    let mut rp = REQUESTS.lock();
    let RequestPool { slots, links, list } = &mut *rp;
    let i = list.pop_front(links)?;
    let r = slots[i].take()?;
    Some((r.entry, r.arg))
}

/// One turn of the daemon: pop a request, or park until the next wakeup.
/// The emptiness check and the suspension sit inside one interrupt mask so
/// a wakeup posted in between cannot be lost.
fn daemon_step() -> Option<(IrqEntry, usize)> {
    let hooks = port::current();
    let mask = (hooks.enter_critical)();
    let popped = poll_request();
    if popped.is_none() {
        kernel::with_kernel_unmasked(|k| {
            let Some(cur) = k.current else {
                k.fatal(Diagnosis::IRQ_ERROR, "daemon loop with no current thread");
            };
            k.leave_ready(cur);
            k.tcb_mut(cur).state = ThreadState::Suspended;
            k.reschedule();
        });
    }
    (hooks.leave_critical)(mask);
    popped
}

/// Body of the IRQ daemon thread. Never exits.
fn daemon_entry(_arg: usize) {
    loop {
        if let Some((entry, arg)) = daemon_step() {
            entry(arg);
        }
    }
}

/// Bring up the interrupt layer: clear both tables and create the daemon
/// thread in its parked state.
pub(crate) fn module_init() {
    *VECTORS.lock() = VectorTable::new();
    *REQUESTS.lock() = RequestPool::new();

    if IRQ_DAEMON_ENABLE {
        let stack = StackRegion {
            base: DAEMON_STACK.0.get() as usize,
            size: DAEMON_STACK_BYTES,
        };
        match thread::create(
            "irq-daemon",
            daemon_entry,
            0,
            stack,
            DAEMON_PRIORITY,
            DAEMON_SLICE,
        ) {
            Ok(id) => {
                kernel::with_kernel(|k| k.daemon = Some(id));
                log::info!("irq daemon created as {}", id);
            }
            Err(_) => {
                kernel::with_kernel(|k| {
                    k.fatal(Diagnosis::IRQ_ERROR, "irq daemon creation failed");
                });
            }
        }
    }
}
