//! # 宿主 x86_64 后端
//!
//! 在普通用户进程里模拟多核内核：每个宿主线程扮演一个 CPU，
//! 当前 CPU 指针、中断开关与地址空间保存在宿主线程的 TLS 中。
//! 栈切换是真实的，线程在宿主线程之间迁移与内核线程在 hart 之间迁移
//! 完全对应，因此所有访问当前 CPU 的代码都必须在切换后重新读取指针。

mod context;

pub use context::{FpuState, RFlags, RegisterState};

use super::{ContextSwitchEngine, ThreadRegisters, TrapRegisters};
use crate::processor::PerCpuState;
use crate::sched::Scheduler;
use crate::trap::{TrapFrame, enter_trap, exit_trap};
use core::arch::global_asm;
use core::cell::Cell;
use core::ptr;
use std::io::Write;

global_asm!(include_str!("switch.S"));

unsafe extern "C" {
    fn __switch_context(from: *mut ThreadRegisters, to: *const ThreadRegisters);
    fn __initialize_context_switching(to: *const ThreadRegisters) -> !;
    fn __thread_first_enter();
    fn __thread_exit_trampoline();
}

std::thread_local! {
    static CURRENT_CPU: Cell<*const PerCpuState> = const { Cell::new(ptr::null()) };
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(false) };
    static ADDRESS_SPACE: Cell<usize> = const { Cell::new(0) };
}

pub struct Engine;

impl ContextSwitchEngine for Engine {
    unsafe fn initialize_context_switching(initial: *const ThreadRegisters) -> ! {
        unsafe { __initialize_context_switching(initial) }
    }

    unsafe fn switch_context(from: *mut ThreadRegisters, to: *const ThreadRegisters) {
        unsafe { __switch_context(from, to) }
    }

    unsafe fn assume_context(thread: *const ThreadRegisters) -> ! {
        unsafe { __initialize_context_switching(thread) }
    }

    fn first_enter_address() -> usize {
        __thread_first_enter as usize
    }

    fn exit_trampoline_address() -> usize {
        __thread_exit_trampoline as usize
    }
}

/// 读取当前 CPU 的每核状态指针
///
/// 不能内联：线程可能在两次调用之间迁移到另一个宿主线程。
#[inline(never)]
pub fn current_cpu_ptr() -> *const PerCpuState {
    CURRENT_CPU.with(|cpu| cpu.get())
}

/// 把每核状态安装到当前 CPU
#[inline(never)]
pub fn install_current_cpu(cpu: *const PerCpuState) {
    CURRENT_CPU.with(|slot| slot.set(cpu));
}

#[inline(never)]
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(|flag| flag.get())
}

#[inline(never)]
pub fn disable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(false));
}

#[inline(never)]
pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.with(|flag| flag.set(true));
}

/// 空闲等待
///
/// 宿主上没有真正的中断源：睡眠一小段时间后在此处投递一次时钟中断。
pub fn wait_for_interrupt() {
    std::thread::sleep(std::time::Duration::from_micros(TIMER_PERIOD_US));
    timer_interrupt();
}

/// 空闲等待时模拟的时钟周期（微秒）
const TIMER_PERIOD_US: u64 = 200;

/// 在当前执行点模拟一次时钟中断
///
/// 中断关闭时什么也不做。否则构造一个陷入帧，走与真实陷入相同的
/// 入口与返回路径；返回路径上可能发生抢占，返回时可能已在另一个 CPU 上。
pub fn timer_interrupt() {
    if !interrupts_enabled() {
        return;
    }
    disable_interrupts();
    let mut regs = RegisterState::default();
    regs.set_return_mode(super::ExecutionMode::Kernel);
    let mut trap = TrapFrame::new(&mut regs);
    enter_trap(&mut trap, true);
    if let Some(sched) = Scheduler::current() {
        sched.timer_tick();
    }
    exit_trap(&mut trap);
    prepare_return(trap.regs());
}

/// 停下当前 CPU：宿主线程永久休眠
pub fn halt(_cpu: usize) -> ! {
    disable_interrupts();
    loop {
        std::thread::park();
    }
}

/// 切换到 `asid` 标识的地址空间
#[inline(never)]
pub fn activate_address_space(asid: usize) {
    ADDRESS_SPACE.with(|space| space.set(asid));
}

/// 当前 CPU 上生效的地址空间
#[inline(never)]
pub fn active_address_space() -> usize {
    ADDRESS_SPACE.with(|space| space.get())
}

/// 陷入返回前的最后一步：模拟 `sret` 按保存的状态恢复中断开关
#[inline(never)]
pub fn prepare_return(regs: &RegisterState) {
    INTERRUPTS_ENABLED.with(|flag| flag.set(regs.interrupts_enabled_on_return()));
}

pub fn console_write(s: &str) {
    let _ = std::io::stderr().write_all(s.as_bytes());
}

/// 时间戳（纳秒），用作随机数种子与诊断
pub fn timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
