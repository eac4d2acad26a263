/*
 * End-to-End Scheduling and IPC Scenarios
 *
 * Whole-kernel sequences: flush ordering across a mailbox full of timed
 * receivers, timeout delivery and retry, ISR-driven preemption through the
 * daemon, a priority inheritance chain across two mutexes, and the
 * cross-list bookkeeping audits.
 */

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ipc::{IpcError, IpcOption, IpcState, ObjectId, mailbox, mutex, semaphore};
use crate::irq::{self, IsrReturn, RequestId};
use crate::kernel::{self, ExecContext, with_kernel};
use crate::sched::thread::{self, ThreadId, ThreadState};
use crate::tests::support::{TestEnv, block_on, flush_collect, spawn, spawn_suspended};

/// The bookkeeping `mutex::lock` performs on contention, followed by the
/// park itself. Scenario threads drive the kernel layer directly so the
/// test harness can keep executing on their behalf.
fn contend(m: mutex::MutexId) {
    with_kernel(|k| {
        let cur = k.current.unwrap();
        let my = k.tcb(cur).priority;
        let holder = k.mutexes[m.0].unwrap().holder.unwrap();
        {
            let mc = k.mutexes[m.0].as_mut().unwrap();
            if my < mc.ceiling {
                mc.ceiling = my;
            }
        }
        k.boost_chain(holder, my);
    });
    block_on(ObjectId::Mutex(m.0), IpcOption::WAIT, 0, 0);
}

#[test]
fn flush_wakes_every_receiver_in_arrival_order() {
    let env = TestEnv::new();
    let t1 = spawn("t1", 5);
    let t2 = spawn("t2", 5);
    let t3 = spawn("t3", 5);
    let t4 = spawn("t4", 4);
    let _idle = spawn("idle", 31);
    env.start();

    // t4 outranks the receivers; put it to sleep so they get to run
    assert_eq!(thread::current(), Some(t4));
    thread::delay(500).unwrap();

    let mb = mailbox::create(mailbox::WaitPolicy::Fifo).unwrap();
    let obj = ObjectId::Mailbox(mb.0);
    for _ in 0..3 {
        // t1, t2, t3 each start a receive bounded by 1000 ticks
        block_on(
            obj,
            IpcOption::WAIT | IpcOption::TIMED | IpcOption::DATA_SINK,
            0,
            1000,
        );
    }

    for _ in 0..500 {
        kernel::tick();
    }
    assert_eq!(thread::current(), Some(t4));

    // t4 flushes the mailbox well before any receive times out
    let woken = flush_collect(obj);
    assert_eq!(woken, vec![t1, t2, t3]);
    with_kernel(|k| {
        for t in [t1, t2, t3] {
            let (state, error, _) = k.ipc_take_result(t);
            assert_eq!(state, IpcState::Failure);
            assert_eq!(error, IpcError::Flush);
            // timeout timers were cancelled by the wakeup
            assert!(!k.tcb(t).timer_active);
        }
    });
}

#[test]
fn timed_out_wait_reports_timeout_and_a_retry_succeeds() {
    let env = TestEnv::new();
    let ta = spawn("waiter", 5);
    let _idle = spawn("idle", 31);
    env.start();

    let sem = semaphore::create(0, 1, mailbox::WaitPolicy::Fifo).unwrap();
    let obj = ObjectId::Semaphore(sem.0);
    block_on(obj, IpcOption::WAIT | IpcOption::TIMED, 0, 50);

    for _ in 0..49 {
        kernel::tick();
    }
    with_kernel(|k| assert_eq!(k.tcb(ta).state, ThreadState::Blocked));
    kernel::tick();

    // woken at tick 50 with the timeout verdict and dispatched again
    assert_eq!(thread::current(), Some(ta));
    with_kernel(|k| {
        let (state, error, _) = k.ipc_take_result(ta);
        assert_eq!(state, IpcState::Failure);
        assert_eq!(error, IpcError::Timeout);
    });

    // a signal within the next few ticks satisfies the retry cleanly
    block_on(obj, IpcOption::WAIT | IpcOption::TIMED, 0, 10);
    semaphore::release(sem).unwrap();
    with_kernel(|k| {
        let (state, error, _) = k.ipc_take_result(ta);
        assert_eq!(state, IpcState::Success);
        assert_eq!(error, IpcError::None);
    });
}

static WAKE_TARGET: AtomicUsize = AtomicUsize::new(0);

fn wake_entry(arg: usize) {
    thread::activate(ThreadId(arg)).unwrap();
}

fn posting_isr(_arg: usize) -> IsrReturn {
    let target = WAKE_TARGET.load(Ordering::SeqCst);
    irq::post_request(RequestId(0), wake_entry, target, 1).unwrap();
    IsrReturn::CALL_DAEMON
}

#[test]
fn isr_deferred_wakeup_runs_the_urgent_thread_before_the_interrupted_one() {
    let env = TestEnv::new();
    let t_lo = spawn("lo", 10);
    let _idle = spawn("idle", 31);
    let t_hi = spawn_suspended("hi", 3);
    env.start();

    assert_eq!(thread::current(), Some(t_lo));
    WAKE_TARGET.store(t_hi.0, Ordering::SeqCst);
    irq::set_vector(5, posting_isr, 0).unwrap();
    irq::enter_isr(5);

    // the resumed daemon outranks everything at the handler tail
    let daemon = with_kernel(|k| k.daemon.unwrap());
    assert_eq!(thread::current(), Some(daemon));

    // daemon turn: drain the request, readying t_hi, then park again
    let (entry, arg) = irq::poll_request().unwrap();
    entry(arg);
    thread::suspend_self();

    // t_hi runs strictly before t_lo gets the CPU back
    assert_eq!(thread::current(), Some(t_hi));
    thread::suspend_self();
    assert_eq!(thread::current(), Some(t_lo));
}

fn ticking_isr(_arg: usize) -> IsrReturn {
    kernel::tick();
    IsrReturn::empty()
}

#[test]
fn timer_wakeup_inside_an_isr_preempts_only_at_the_handler_tail() {
    let env = TestEnv::new();
    let t_hi = spawn("hi", 3);
    let t_lo = spawn("lo", 10);
    let _idle = spawn("idle", 31);
    env.start();

    // hi sleeps one tick; lo takes over
    assert_eq!(thread::current(), Some(t_hi));
    thread::delay(1).unwrap();
    assert_eq!(thread::current(), Some(t_lo));

    irq::set_vector(6, ticking_isr, 0).unwrap();
    irq::enter_isr(6);

    // the tick expired hi's delay inside the handler; the switch waited
    // for the handler tail
    assert_eq!(thread::current(), Some(t_hi));
    with_kernel(|k| assert_eq!(k.context, ExecContext::Thread));
}

#[test]
fn priority_inheritance_chains_and_unwinds() {
    let env = TestEnv::new();
    let t_lo = spawn("lo", 10);
    let _idle = spawn("idle", 31);
    let t_mid = spawn_suspended("mid", 5);
    let t_hi = spawn_suspended("hi", 3);
    env.start();

    let a = mutex::create().unwrap();
    let b = mutex::create().unwrap();

    // lo owns A
    assert_eq!(thread::current(), Some(t_lo));
    mutex::lock(a, Some(0)).unwrap();

    // mid preempts, takes B, then contends on A: lo inherits mid's urgency
    thread::activate(t_mid).unwrap();
    assert_eq!(thread::current(), Some(t_mid));
    mutex::lock(b, Some(0)).unwrap();
    contend(a);
    with_kernel(|k| assert_eq!(k.tcb(t_lo).priority, 5));

    // hi preempts and contends on B: the boost rides the chain to lo
    thread::activate(t_hi).unwrap();
    assert_eq!(thread::current(), Some(t_hi));
    contend(b);
    with_kernel(|k| {
        assert_eq!(k.tcb(t_mid).priority, 3);
        assert_eq!(k.tcb(t_lo).priority, 3);
    });

    // the doubly boosted lo is the one running; releasing A hands the
    // mutex to mid and drops lo back to base
    assert_eq!(thread::current(), Some(t_lo));
    mutex::unlock(a).unwrap();
    with_kernel(|k| {
        assert_eq!(k.tcb(t_lo).priority, 10);
        assert_eq!(k.tcb(t_lo).base_priority, 10);
        assert_eq!(k.mutexes[a.0].unwrap().holder, Some(t_mid));
    });

    // mid finishes with B; hi finally takes it
    assert_eq!(thread::current(), Some(t_mid));
    mutex::unlock(b).unwrap();
    with_kernel(|k| {
        assert_eq!(k.tcb(t_mid).priority, 5);
        assert_eq!(k.mutexes[b.0].unwrap().holder, Some(t_hi));
    });
    assert_eq!(thread::current(), Some(t_hi));
}

#[test]
fn isr_wakeup_of_the_interrupted_blocker_restores_its_slot() {
    let env = TestEnv::new();
    let ta = spawn("a", 5);
    let idle = spawn("idle", 31);
    env.start();

    let mb = mailbox::create(mailbox::WaitPolicy::Fifo).unwrap();
    let obj = ObjectId::Mailbox(mb.0);
    block_on(obj, IpcOption::WAIT, 0, 0);

    with_kernel(|k| {
        // restage the window where an interrupt lands between the queue
        // transfer and the context switch: the blocker is still current
        k.tcb_mut(idle).state = ThreadState::Ready;
        k.current = Some(ta);
        kernel::isr_enter(k);

        let mut hirp = false;
        k.ipc_unblock_one(ta, IpcState::Success, IpcError::None, &mut hirp);
        // the interrupted thread keeps running from the head of its level
        assert_eq!(k.tcb(ta).state, ThreadState::Running);
        assert_eq!(k.ready.lists[5].front(), Some(ta.0));

        kernel::isr_exit(k);
        k.reschedule();
        assert_eq!(k.current, Some(ta));
    });
}

#[test]
fn thread_status_matches_kernel_list_membership() {
    let env = TestEnv::new();
    let run = spawn("run", 5);
    let ready = spawn("ready", 6);
    let sleeper = spawn("sleeper", 4);
    let parked = spawn_suspended("parked", 7);
    let _idle = spawn("idle", 31);
    env.start();

    // sleeper is the most urgent; it blocks itself first
    assert_eq!(thread::current(), Some(sleeper));
    thread::delay(100).unwrap();

    with_kernel(|k| {
        let in_blocked: Vec<usize> = k.blocked.iter(&k.sched_links).collect();

        assert_eq!(k.tcb(run).state, ThreadState::Running);
        assert!(k.sched_links[run.0].is_attached());
        assert_eq!(k.ready.lists[5].front(), Some(run.0));

        assert_eq!(k.tcb(ready).state, ThreadState::Ready);
        assert!(k.sched_links[ready.0].is_attached());

        assert_eq!(k.tcb(sleeper).state, ThreadState::Blocked);
        assert!(in_blocked.contains(&sleeper.0));
        assert!(k.tcb(sleeper).timer_active);

        assert_eq!(k.tcb(parked).state, ThreadState::Suspended);
        assert!(!k.sched_links[parked.0].is_attached());
        assert!(!k.timer_links[parked.0].is_attached());
    });
}

#[test]
fn priority_change_repositions_and_preempts() {
    let env = TestEnv::new();
    let ta = spawn("a", 10);
    let tb = spawn("b", 20);
    env.start();

    assert_eq!(thread::current(), Some(ta));
    thread::set_priority(tb, 1).unwrap();
    // b moved levels and immediately outranks a
    assert_eq!(thread::current(), Some(tb));
    with_kernel(|k| {
        assert_eq!(k.tcb(tb).priority, 1);
        assert!(k.ready.lists[20].is_empty());
        assert_eq!(k.ready.lists[1].front(), Some(tb.0));
    });
}
