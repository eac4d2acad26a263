/*
 * Test Fixtures
 *
 * The harness every test file shares: a serializing guard that resets the
 * kernel, helpers to mint threads, and substrate-level shortcuts for
 * parking and flushing waiters.
 */

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::{PRIORITY_NUM, Priority, Tick};
use crate::ipc::{IpcError, IpcOption, IpcState, ObjectId};
use crate::kernel::{self, with_kernel};
use crate::port::CpuPort;
use crate::sched::thread::{self, StackRegion, ThreadId};

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialized, freshly initialized kernel for the duration of one test.
pub struct TestEnv {
    _guard: MutexGuard<'static, ()>,
}

impl TestEnv {
    pub fn new() -> Self {
        let guard = TEST_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        kernel::init(CpuPort::noop());
        TestEnv { _guard: guard }
    }

    /// Dispatch the first thread, as `kernel::start` would.
    pub fn start(&self) {
        with_kernel(|k| kernel::launch(k));
    }
}

pub fn noop_entry(_arg: usize) {}

pub fn dummy_stack() -> StackRegion {
    StackRegion {
        base: 0x2000_0000,
        size: 1024,
    }
}

/// Create a thread and make it ready.
pub fn spawn(name: &'static str, prio: Priority) -> ThreadId {
    let t = thread::create(name, noop_entry, 0, dummy_stack(), prio, 0).unwrap();
    thread::activate(t).unwrap();
    t
}

/// Create a thread but leave it suspended.
pub fn spawn_suspended(name: &'static str, prio: Priority) -> ThreadId {
    thread::create(name, noop_entry, 0, dummy_stack(), prio, 0).unwrap()
}

/// Park the current thread on `obj` through the blocking substrate.
pub fn block_on(obj: ObjectId, option: IpcOption, data: u32, ticks: Tick) {
    with_kernel(|k| k.ipc_block_current(obj, option, data, ticks));
}

/// Flush `obj` and report the wake order of the affected threads, read off
/// their arrival order in the ready queue. Exact only while all waiters
/// share one priority level, which is how the flush scenarios are built.
pub fn flush_collect(obj: ObjectId) -> Vec<ThreadId> {
    with_kernel(|k| {
        let mut waiting: Vec<usize> = k.wait_queue(obj).auxiliary.iter(&k.ipc_links).collect();
        waiting.extend(k.wait_queue(obj).primary.iter(&k.ipc_links));
        let mut hirp = false;
        k.ipc_unblock_all(obj, IpcState::Failure, IpcError::Flush, None, &mut hirp);
        let mut order = Vec::new();
        for p in 0..PRIORITY_NUM {
            for n in k.ready.lists[p].iter(&k.sched_links) {
                if waiting.contains(&n) {
                    order.push(ThreadId(n));
                }
            }
        }
        order
    })
}
