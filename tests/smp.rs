#![cfg(all(target_arch = "x86_64", not(target_os = "none")))]

mod common;

use common::{
    CALLEE_SAVED, boot, callee_saved_across_yield, config, create, recv, shutdown, start_cpus,
    wait_until,
};
use nimloth_sched::idle::idle_loop;
use nimloth_sched::sched::yield_now;
use nimloth_sched::{
    CpuMask, PerCpuState, SchedError, Scheduler, Spinlock, ThreadOptions, ThreadState,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;

#[test]
fn no_thread_runs_on_two_cpus_at_once() {
    let sched = boot(config(4));
    let threads: Vec<_> = (0..12)
        .map(|i| {
            sched
                .spawn("spinner", ThreadOptions::with_priority(i % 3), move || {
                    for _ in 0..200 {
                        yield_now();
                    }
                    0
                })
                .unwrap()
        })
        .collect();

    while !threads.iter().all(|t| t.state() == ThreadState::Dead) {
        let snapshot = sched.snapshot();
        assert_eq!(snapshot.check_invariants(), Ok(()), "{:?}", snapshot);
    }
    shutdown(sched);
}

#[test]
fn spinlock_protected_counter_is_exact() {
    let sched = boot(config(4));
    let counter = Arc::new(Spinlock::new(0u64));
    let (tx, rx) = channel();
    for _ in 0..8 {
        let counter = counter.clone();
        let tx = tx.clone();
        sched
            .spawn("adder", ThreadOptions::default(), move || {
                for i in 0..500 {
                    *counter.lock() += 1;
                    if i % 10 == 0 {
                        yield_now();
                    }
                }
                tx.send(()).unwrap();
                0
            })
            .unwrap();
    }
    for _ in 0..8 {
        recv(&rx);
    }
    assert_eq!(*counter.lock(), 4000);
    shutdown(sched);
}

#[test]
fn pinned_thread_never_leaves_its_cpu() {
    let sched = boot(config(4));
    let (tx, rx) = channel();
    for _ in 0..3 {
        sched
            .spawn("noise", ThreadOptions::default(), move || {
                for _ in 0..100 {
                    yield_now();
                }
                0
            })
            .unwrap();
    }
    sched
        .spawn(
            "pinned",
            ThreadOptions::default().affinity(CpuMask::only(2)),
            move || {
                let mut seen = BTreeSet::new();
                for _ in 0..100 {
                    seen.insert(PerCpuState::current_id());
                    yield_now();
                }
                tx.send(seen).unwrap();
                0
            },
        )
        .unwrap();
    let seen = recv(&rx);
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), [Some(2)]);
    shutdown(sched);
}

#[test]
fn registers_survive_migration() {
    let sched = boot(config(4));
    let (tx, rx) = channel();
    for _ in 0..8 {
        let tx = tx.clone();
        sched
            .spawn("saver", ThreadOptions::default(), move || {
                let mut intact = true;
                let mut critical_ok = true;
                for _ in 0..50 {
                    intact &= callee_saved_across_yield() == CALLEE_SAVED;
                    critical_ok &= PerCpuState::current().is_some_and(|cpu| cpu.in_critical() == 0);
                }
                tx.send((intact, critical_ok)).unwrap();
                0
            })
            .unwrap();
    }
    for _ in 0..8 {
        assert_eq!(recv(&rx), (true, true));
    }
    shutdown(sched);
}

#[test]
fn idle_cpus_pick_up_new_work() {
    let sched = boot(config(2));
    wait_until(|| {
        (0..2).all(|id| sched.cpu(id).is_some_and(|cpu| cpu.is_initialized()))
    });
    let (tx, rx) = channel();
    for _ in 0..4 {
        let tx = tx.clone();
        sched
            .spawn("late", ThreadOptions::default(), move || {
                tx.send(PerCpuState::current_id()).unwrap();
                0
            })
            .unwrap();
    }
    for _ in 0..4 {
        assert!(recv(&rx).is_some());
    }
    let snapshot = sched.snapshot();
    assert_eq!(snapshot.running.len(), 2);
    assert!(snapshot.threads.iter().filter(|t| t.idle).count() == 2);
    shutdown(sched);
}

static CUSTOM_IDLE_ENTRIES: AtomicUsize = AtomicUsize::new(0);

extern "C" fn counting_idle(arg: usize) -> ! {
    CUSTOM_IDLE_ENTRIES.fetch_add(1, Ordering::SeqCst);
    idle_loop(unsafe { &*(arg as *const Scheduler) })
}

#[test]
fn only_idle_threads_pinned_to_the_cpu_can_be_registered() {
    let sched = create(config(2));
    let normal = sched.spawn("normal", ThreadOptions::default(), || 0).unwrap();
    assert_eq!(
        sched.set_idle_thread(0, normal.clone()),
        Err(SchedError::NotIdleThread(normal.tid()))
    );

    let arg = sched as *const Scheduler as usize;
    let idle = sched.create_idle_thread(0, counting_idle, arg).unwrap();
    assert!(idle.is_idle());
    assert_eq!(idle.affinity(), CpuMask::only(0));
    assert_eq!(
        sched.set_idle_thread(1, idle.clone()),
        Err(SchedError::NotIdleThread(idle.tid()))
    );
    assert_eq!(sched.set_idle_thread(0, idle.clone()), Ok(()));
    assert!(matches!(
        sched.create_idle_thread(2, counting_idle, arg),
        Err(SchedError::InvalidCpu(2))
    ));

    let snapshot = sched.snapshot();
    assert_eq!(snapshot.check_invariants(), Ok(()), "{:?}", snapshot);
    assert_eq!(snapshot.run_queue.concat(), vec![normal.tid()]);

    start_cpus(sched);
    wait_until(|| CUSTOM_IDLE_ENTRIES.load(Ordering::SeqCst) == 1);
    wait_until(|| normal.state() == ThreadState::Dead);
    assert!(sched.cpu(0).is_some_and(|cpu| {
        cpu.idle_thread().is_some_and(|t| Arc::ptr_eq(t, &idle))
    }));
    let snapshot = sched.snapshot();
    assert_eq!(snapshot.threads.iter().filter(|t| t.idle).count(), 2);
    assert_eq!(snapshot.check_invariants(), Ok(()), "{:?}", snapshot);
    shutdown(sched);
}
