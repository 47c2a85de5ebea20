//! # 空闲线程
//!
//! 每个 CPU 一个，优先级最低且从不进入运行队列。循环让出 CPU，没有
//! 工作时开中断等待下一次中断；调度器请求停机且没有就绪线程时停下
//! 本核。

use crate::arch;
use crate::processor::PerCpuState;
use crate::sched::Scheduler;
use log::info;

/// 空闲线程入口，`arg` 为调度器地址
pub(crate) extern "C" fn idle_entry(arg: usize) -> ! {
    let sched = unsafe { &*(arg as *const Scheduler) };
    idle_loop(sched)
}

pub fn idle_loop(sched: &'static Scheduler) -> ! {
    loop {
        sched.yield_now();
        if sched.is_halted() && sched.runnable_count() == 0 {
            let cpu = PerCpuState::current_id().unwrap_or(0);
            info!("cpu {} halted", cpu);
            arch::halt(cpu);
        }
        arch::enable_interrupts();
        arch::wait_for_interrupt();
    }
}
