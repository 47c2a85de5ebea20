//! 宿主环境下的测试机：每个宿主线程扮演一个 CPU。
//!
//! 内核线程里的 panic 无法穿过 `extern "C"` 入口回卷，会直接中止测试
//! 进程，所以内核线程只通过通道上报数据，断言都在测试线程里做。

#![allow(dead_code)]

use core::arch::asm;
use nimloth_sched::sched::yield_now;
use nimloth_sched::{Scheduler, SchedulerConfig, StackOffset};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn config(cpus: usize) -> SchedulerConfig {
    SchedulerConfig {
        cpu_count: cpus,
        stack_offset: StackOffset::Disabled,
        ..SchedulerConfig::default()
    }
}

/// 创建调度器但不启动任何 CPU
pub fn create(config: SchedulerConfig) -> &'static Scheduler {
    nimloth_sched::logging::init_with_level(log::LevelFilter::Warn);
    Scheduler::new(config).expect("failed to create scheduler")
}

/// 为每个 CPU 启动一个宿主线程并进入调度
pub fn start_cpus(sched: &'static Scheduler) {
    for id in 0..sched.cpu_count() {
        std::thread::Builder::new()
            .name(format!("cpu{}", id))
            .spawn(move || {
                sched.initialize(id).expect("failed to initialize cpu");
                sched.start();
            })
            .expect("failed to spawn cpu thread");
    }
}

pub fn boot(config: SchedulerConfig) -> &'static Scheduler {
    let sched = create(config);
    start_cpus(sched);
    sched
}

pub fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(TIMEOUT)
        .expect("kernel thread did not report in time")
}

pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// 等待所有工作线程结束后让各 CPU 停下
pub fn shutdown(sched: &'static Scheduler) {
    wait_until(|| sched.runnable_count() == 0);
    sched.halt();
}

pub const CALLEE_SAVED: [u64; 5] = [
    0x1111_1111_1111_1111,
    0x2222_2222_2222_2222,
    0x3333_3333_3333_3333,
    0x4444_4444_4444_4444,
    0x5555_5555_5555_5555,
];

extern "C" fn yield_from_asm() {
    yield_now();
}

/// 在 rbx、r12-r15 中放入已知值，经过一次让出后读回
pub fn callee_saved_across_yield() -> [u64; 5] {
    let mut out = [0u64; 5];
    unsafe {
        asm!(
            "push rbx",
            "push rbp",
            "mov rbp, rsp",
            "and rsp, -16",
            "push {out}",
            "sub rsp, 8",
            "mov rbx, 0x1111111111111111",
            "mov r12, 0x2222222222222222",
            "mov r13, 0x3333333333333333",
            "mov r14, 0x4444444444444444",
            "mov r15, 0x5555555555555555",
            "call {f}",
            "add rsp, 8",
            "pop rax",
            "mov [rax], rbx",
            "mov [rax + 8], r12",
            "mov [rax + 16], r13",
            "mov [rax + 24], r14",
            "mov [rax + 32], r15",
            "mov rsp, rbp",
            "pop rbp",
            "pop rbx",
            out = in(reg) out.as_mut_ptr(),
            f = sym yield_from_asm,
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
            clobber_abi("C"),
        );
    }
    out
}
