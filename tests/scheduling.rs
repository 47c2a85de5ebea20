#![cfg(all(target_arch = "x86_64", not(target_os = "none")))]

mod common;

use common::{config, create, recv, shutdown, start_cpus};
use nimloth_sched::arch::{self, TrapRegisters};
use nimloth_sched::sched::yield_now;
use nimloth_sched::trap::{TrapFrame, enter_trap, exit_trap};
use nimloth_sched::{
    CpuMask, PerCpuState, SchedError, Scheduler, SchedulerConfig, ScopedCritical, ThreadOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};

type Trace = Arc<Mutex<Vec<&'static str>>>;

fn record(trace: &Trace, event: &'static str) {
    trace.lock().unwrap().push(event);
}

fn current_critical() -> usize {
    PerCpuState::current().map_or(usize::MAX, |cpu| cpu.in_critical())
}

#[test]
fn round_robin_is_fifo_within_a_class() {
    let sched = create(config(1));
    let trace: Trace = Arc::default();
    let (tx, rx) = channel();
    for name in ["a", "b", "c"] {
        let trace = trace.clone();
        let tx = tx.clone();
        sched
            .spawn(name, ThreadOptions::default(), move || {
                for _ in 0..3 {
                    record(&trace, name);
                    yield_now();
                }
                tx.send(()).unwrap();
                0
            })
            .unwrap();
    }
    start_cpus(sched);
    for _ in 0..3 {
        recv(&rx);
    }
    assert_eq!(
        *trace.lock().unwrap(),
        ["a", "b", "c", "a", "b", "c", "a", "b", "c"]
    );
    shutdown(sched);
}

#[test]
fn higher_class_runs_first() {
    let sched = create(config(1));
    let trace: Trace = Arc::default();
    let (tx, rx) = channel();
    for (name, priority) in [("low", 3), ("normal", 1), ("high", 0)] {
        let trace = trace.clone();
        let tx = tx.clone();
        sched
            .spawn(name, ThreadOptions::with_priority(priority), move || {
                record(&trace, name);
                tx.send(()).unwrap();
                0
            })
            .unwrap();
    }
    start_cpus(sched);
    for _ in 0..3 {
        recv(&rx);
    }
    assert_eq!(*trace.lock().unwrap(), ["high", "normal", "low"]);
    shutdown(sched);
}

#[test]
fn waking_a_higher_class_thread_preempts_at_the_next_safe_point() {
    let sched = create(config(1));
    let trace: Trace = Arc::default();
    let (tx, rx) = channel();
    let outer = trace.clone();
    sched
        .spawn("low", ThreadOptions::with_priority(2), move || {
            let inner = outer.clone();
            let done = tx.clone();
            record(&outer, "low: spawning");
            sched
                .spawn("high", ThreadOptions::with_priority(0), move || {
                    record(&inner, "high");
                    done.send(()).unwrap();
                    0
                })
                .unwrap();
            record(&outer, "low: resumed");
            tx.send(()).unwrap();
            0
        })
        .unwrap();
    start_cpus(sched);
    recv(&rx);
    recv(&rx);
    assert_eq!(
        *trace.lock().unwrap(),
        ["low: spawning", "high", "low: resumed"]
    );
    shutdown(sched);
}

#[test]
fn expired_time_slice_preempts_on_trap_exit() {
    // 第 0 级时间片为 2 个时钟周期
    let sched = create(SchedulerConfig {
        base_time_slice: 2,
        ..config(1)
    });
    let trace: Trace = Arc::default();
    let (tx, rx) = channel();
    for name in ["x", "y"] {
        let trace = trace.clone();
        let tx = tx.clone();
        sched
            .spawn(name, ThreadOptions::with_priority(0), move || {
                for _ in 0..3 {
                    record(&trace, name);
                    arch::timer_interrupt();
                    arch::timer_interrupt();
                }
                tx.send(()).unwrap();
                0
            })
            .unwrap();
    }
    start_cpus(sched);
    recv(&rx);
    recv(&rx);
    assert_eq!(*trace.lock().unwrap(), ["x", "y", "x", "y", "x", "y"]);
    shutdown(sched);
}

#[test]
fn preemption_waits_for_the_critical_section_to_end() {
    let sched = create(SchedulerConfig {
        base_time_slice: 1,
        ..config(1)
    });
    let trace: Trace = Arc::default();
    let (tx, rx) = channel::<usize>();

    let first = trace.clone();
    let report = tx.clone();
    sched
        .spawn("critical", ThreadOptions::with_priority(0), move || {
            let guard = ScopedCritical::new();
            report.send(current_critical()).unwrap();
            arch::timer_interrupt();
            arch::timer_interrupt();
            record(&first, "critical: done");
            drop(guard);
            record(&first, "critical: after");
            report.send(current_critical()).unwrap();
            0
        })
        .unwrap();
    let second = trace.clone();
    sched
        .spawn("other", ThreadOptions::with_priority(0), move || {
            record(&second, "other");
            tx.send(current_critical()).unwrap();
            0
        })
        .unwrap();
    start_cpus(sched);

    let levels = [recv(&rx), recv(&rx), recv(&rx)];
    assert_eq!(levels, [1, 0, 0]);
    assert_eq!(
        *trace.lock().unwrap(),
        ["critical: done", "other", "critical: after"]
    );
    shutdown(sched);
}

static DRAINED: AtomicUsize = AtomicUsize::new(0);

fn drain_hit(arg: usize) {
    DRAINED.fetch_add(arg, Ordering::SeqCst);
}

#[test]
fn deferred_calls_run_once_when_the_outermost_section_ends() {
    let sched = create(config(1));
    let (tx, rx) = channel::<(usize, usize)>();
    sched
        .spawn("deferrer", ThreadOptions::default(), move || {
            let Some(cpu) = PerCpuState::current() else {
                return -1;
            };
            let outer = ScopedCritical::new();
            let inner = ScopedCritical::new();
            for _ in 0..3 {
                cpu.deferred().queue(drain_hit, 1).unwrap();
            }
            drop(inner);
            let pending = cpu.deferred().len();
            drop(outer);
            // 离开临界区后线程可能迁移，重新读取当前 CPU
            let remaining = PerCpuState::current().map_or(usize::MAX, |cpu| cpu.deferred().len());
            tx.send((pending, remaining)).unwrap();
            0
        })
        .unwrap();
    start_cpus(sched);
    assert_eq!(recv(&rx), (3, 0));
    assert_eq!(DRAINED.load(Ordering::SeqCst), 3);
    shutdown(sched);
}

#[test]
fn releasing_a_thread_id_switches_only_after_the_allocator_is_unlocked() {
    let sched = create(config(1));
    let trace: Trace = Arc::default();
    let (tx, rx) = channel::<usize>();
    let outer = trace.clone();
    sched
        .spawn("owner", ThreadOptions::default(), move || {
            let finished = sched.spawn("finished", ThreadOptions::default(), || 7).unwrap();
            let code = finished.join();
            let inner = outer.clone();
            let done = tx.clone();
            sched
                .spawn("allocator", ThreadOptions::default(), move || {
                    let event = match sched.spawn("late", ThreadOptions::default(), || 0) {
                        Ok(_) => "allocator: spawned",
                        Err(_) => "allocator: failed",
                    };
                    record(&inner, event);
                    done.send(0).unwrap();
                    0
                })
                .unwrap();
            let holders = Arc::strong_count(&finished);
            record(&outer, "owner: releasing");
            if let Some(cpu) = PerCpuState::current() {
                cpu.invoke_scheduler_async();
            }
            // 最后一个引用：析构时归还线程 ID
            drop(finished);
            record(&outer, "owner: released");
            tx.send(holders * 100 + code as usize).unwrap();
            0
        })
        .unwrap();
    start_cpus(sched);
    let mut reports = [recv(&rx), recv(&rx)];
    reports.sort();
    assert_eq!(reports, [0, 107]);
    assert_eq!(
        *trace.lock().unwrap(),
        ["owner: releasing", "allocator: spawned", "owner: released"]
    );
    shutdown(sched);
}

#[test]
fn yield_inside_a_critical_section_only_requests_a_reschedule() {
    let sched = create(config(1));
    let trace: Trace = Arc::default();
    let (tx, rx) = channel::<(bool, bool)>();

    let first = trace.clone();
    sched
        .spawn("yielder", ThreadOptions::default(), move || {
            let Some(cpu) = PerCpuState::current() else {
                return -1;
            };
            let section = ScopedCritical::new();
            yield_now();
            record(&first, "yielder: still running");
            let pending = cpu.reschedule_pending();
            drop(section);
            record(&first, "yielder: resumed");
            let after = PerCpuState::current().is_some_and(|cpu| cpu.reschedule_pending());
            tx.send((pending, after)).unwrap();
            0
        })
        .unwrap();
    let second = trace.clone();
    sched
        .spawn("other", ThreadOptions::default(), move || {
            record(&second, "other");
            0
        })
        .unwrap();
    start_cpus(sched);

    assert_eq!(recv(&rx), (true, false));
    assert_eq!(
        *trace.lock().unwrap(),
        ["yielder: still running", "other", "yielder: resumed"]
    );
    shutdown(sched);
}

#[test]
fn yield_from_an_interrupt_handler_switches_on_trap_exit() {
    let sched = create(config(1));
    let trace: Trace = Arc::default();
    let (tx, rx) = channel::<(usize, bool)>();

    let first = trace.clone();
    sched
        .spawn("interrupted", ThreadOptions::default(), move || {
            let Some(cpu) = PerCpuState::current() else {
                return -1;
            };
            arch::disable_interrupts();
            let mut regs = arch::RegisterState::default();
            regs.set_return_mode(arch::ExecutionMode::Kernel);
            let mut frame = TrapFrame::new(&mut regs);
            enter_trap(&mut frame, true);
            let level = cpu.in_irq();
            yield_now();
            record(&first, "handler: still running");
            let pending = cpu.reschedule_pending();
            exit_trap(&mut frame);
            arch::prepare_return(frame.regs());
            record(&first, "interrupted: resumed");
            tx.send((level, pending)).unwrap();
            0
        })
        .unwrap();
    let second = trace.clone();
    sched
        .spawn("other", ThreadOptions::default(), move || {
            record(&second, "other");
            0
        })
        .unwrap();
    start_cpus(sched);

    assert_eq!(recv(&rx), (1, true));
    assert_eq!(
        *trace.lock().unwrap(),
        ["handler: still running", "other", "interrupted: resumed"]
    );
    shutdown(sched);
}

static ORDERED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn push_ordered(arg: usize) {
    ORDERED.lock().unwrap().push(arg);
}

#[test]
fn deferred_calls_drain_in_order_before_the_tick_reschedules() {
    let sched = create(SchedulerConfig {
        base_time_slice: 1,
        ..config(1)
    });
    let (tx, rx) = channel::<Vec<usize>>();

    sched
        .spawn("ticker", ThreadOptions::with_priority(0), move || {
            let Some(cpu) = PerCpuState::current() else {
                return -1;
            };
            for i in 1..=4 {
                cpu.deferred().queue(push_ordered, i).unwrap();
            }
            arch::timer_interrupt();
            push_ordered(100);
            0
        })
        .unwrap();
    sched
        .spawn("other", ThreadOptions::with_priority(0), move || {
            tx.send(ORDERED.lock().unwrap().clone()).unwrap();
            0
        })
        .unwrap();
    start_cpus(sched);

    assert_eq!(recv(&rx), [1, 2, 3, 4]);
    shutdown(sched);
    assert_eq!(*ORDERED.lock().unwrap(), [1, 2, 3, 4, 100]);
}

fn report_invariants(sched: &'static Scheduler, tx: &Sender<Result<(), String>>) {
    tx.send(sched.snapshot().check_invariants()).unwrap();
}

#[test]
fn snapshot_partitions_threads_at_safe_points() {
    let sched = create(config(1));
    let (tx, rx) = channel();
    for i in 0..3 {
        let tx = tx.clone();
        sched
            .spawn("worker", ThreadOptions::with_priority(i), move || {
                for _ in 0..4 {
                    report_invariants(sched, &tx);
                    yield_now();
                }
                0
            })
            .unwrap();
    }
    drop(tx);
    start_cpus(sched);
    let mut reports = 0;
    while let Ok(result) = rx.recv_timeout(common::TIMEOUT) {
        assert_eq!(result, Ok(()));
        reports += 1;
    }
    assert_eq!(reports, 12);
    let snapshot = sched.snapshot();
    assert!(snapshot.run_queue.iter().all(|class| class.is_empty()));
    shutdown(sched);
}

extern "C" fn nothing(_: usize) {}

#[test]
fn creation_errors_are_reported() {
    assert_eq!(
        Scheduler::new(config(0)).err(),
        Some(SchedError::InvalidCpu(0))
    );
    assert_eq!(
        Scheduler::new(SchedulerConfig {
            max_threads: 0,
            ..config(1)
        })
        .err(),
        Some(SchedError::ThreadLimit)
    );

    let sched = create(SchedulerConfig {
        max_threads: 2,
        ..config(2)
    });
    assert_eq!(
        sched
            .create_thread("bad", ThreadOptions::with_priority(9), nothing, 0)
            .err(),
        Some(SchedError::InvalidPriority(9))
    );
    assert_eq!(
        sched
            .create_thread(
                "pinned",
                ThreadOptions::default().affinity(CpuMask::only(5)),
                nothing,
                0
            )
            .err(),
        Some(SchedError::EmptyAffinity)
    );
    let a = sched.create_thread("a", ThreadOptions::default(), nothing, 0);
    let b = sched.create_thread("b", ThreadOptions::default(), nothing, 0);
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(
        sched
            .spawn("c", ThreadOptions::default(), || 0)
            .err(),
        Some(SchedError::ThreadLimit)
    );
    let extra = sched.create_thread("extra", ThreadOptions::default(), nothing, 0);
    assert_eq!(extra.err(), Some(SchedError::ThreadLimit));
    assert_eq!(sched.runnable_count(), 2);
    assert!(sched.snapshot().check_invariants().is_ok());
}
