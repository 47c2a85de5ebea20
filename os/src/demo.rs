//! # 演示负载
//!
//! 启动 hart 在进入调度之前创建的一组内核线程，覆盖调度核心的主要
//! 路径：多优先级时间片轮转、跨核迁移、睡眠、等待队列上的交替唤醒以及
//! join。主线程回收全部工作线程后打印统计信息并请求停机。

use crate::config::WORKER_COUNT;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, error, info};
use nimloth_sched::config::PRIORITY_CLASSES;
use nimloth_sched::{Scheduler, Spinlock, ThreadOptions, WaitQueue};

const ROUNDS: usize = 200;
const PING_PONG_ROUNDS: usize = 50;

pub fn spawn_workload(sched: &'static Scheduler) {
    if let Err(e) = sched.spawn("main", ThreadOptions::with_priority(0), move || {
        main_thread(sched)
    }) {
        error!("failed to spawn main thread: {}", e);
        sched.halt();
    }
}

fn main_thread(sched: &'static Scheduler) -> i32 {
    let counter = Arc::new(Spinlock::new(0usize));
    let mut threads = Vec::new();
    for index in 0..WORKER_COUNT {
        let counter = counter.clone();
        let options = ThreadOptions::with_priority(1 + index % (PRIORITY_CLASSES - 1));
        match sched.spawn(&format!("worker{}", index), options, move || {
            worker(sched, index, &counter)
        }) {
            Ok(thread) => threads.push(thread),
            Err(e) => error!("failed to spawn worker{}: {}", index, e),
        }
    }

    let turn = Arc::new((AtomicUsize::new(0), WaitQueue::new()));
    for side in 0..2 {
        let turn = turn.clone();
        match sched.spawn(&format!("ping{}", side), ThreadOptions::default(), move || {
            ping_pong(side, &turn.0, &turn.1)
        }) {
            Ok(thread) => threads.push(thread),
            Err(e) => error!("failed to spawn ping{}: {}", side, e),
        }
    }

    let started = sched.ticks();
    let exit_sum: i32 = threads.iter().map(|thread| thread.join()).sum();
    info!(
        "{} threads joined after {} ticks: counter = {}, exit code sum = {}",
        threads.len(),
        sched.ticks() - started,
        *counter.lock(),
        exit_sum
    );

    match sched.snapshot().check_invariants() {
        Ok(()) => info!("scheduler state is consistent"),
        Err(e) => error!("scheduler state is inconsistent: {}", e),
    }
    for id in 0..sched.cpu_count() {
        if let Some(cpu) = sched.cpu(id) {
            let stats = cpu.stats();
            info!(
                "cpu {}: {} context switches, {} deferred calls",
                id,
                stats.context_switches.load(Ordering::Relaxed),
                stats.deferred_calls.load(Ordering::Relaxed)
            );
        }
    }
    sched.halt();
    0
}

fn worker(sched: &'static Scheduler, index: usize, counter: &Spinlock<usize>) -> i32 {
    for round in 0..ROUNDS {
        *counter.lock() += 1;
        if round % 32 == index % 32 {
            sched.sleep_ticks(1 + (index % 3) as u64);
        } else if round % 4 == 0 {
            sched.yield_now();
        }
    }
    debug!("worker{} finished", index);
    index as i32
}

/// 两个线程在同一等待队列上轮流推进 `turn`
fn ping_pong(side: usize, turn: &AtomicUsize, queue: &WaitQueue) -> i32 {
    for _ in 0..PING_PONG_ROUNDS {
        queue.wait_while(|| turn.load(Ordering::SeqCst) % 2 != side);
        turn.fetch_add(1, Ordering::SeqCst);
        queue.wake_all();
    }
    0
}
