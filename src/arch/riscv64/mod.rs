//! # RISC-V 64 后端
//!
//! 每个 hart 的 `tp` 寄存器保存该 hart 的 [`PerCpuState`] 指针。`tp` 属于
//! CPU 而不属于线程：线程切换不保存也不恢复它，从用户态陷入时由入口
//! 汇编从内核入口槽取回。

mod context;
pub mod sbi;
mod trap;

pub use context::{FpuState, RegisterState, SStatus};
pub use trap::{init_trap, trap_handler};

use super::{ContextSwitchEngine, ThreadRegisters};
use crate::config::{CLOCK_FREQ, TICKS_PER_SEC};
use crate::processor::PerCpuState;
use core::arch::{asm, global_asm};
use riscv::register::{satp, sie, sstatus, time};

global_asm!(include_str!("switch.S"));

unsafe extern "C" {
    fn __switch_context(from: *mut ThreadRegisters, to: *const ThreadRegisters);
    fn __initialize_context_switching(to: *const ThreadRegisters) -> !;
    fn __thread_first_enter();
    fn __thread_exit_trampoline();
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

#[inline(always)]
pub fn current_cpu_ptr() -> *const PerCpuState {
    let ptr: usize;
    unsafe { asm!("mv {}, tp", out(reg) ptr, options(nomem, nostack, preserves_flags)) };
    ptr as *const PerCpuState
}

pub fn install_current_cpu(cpu: *const PerCpuState) {
    unsafe { asm!("mv tp, {}", in(reg) cpu as usize, options(nomem, nostack, preserves_flags)) };
}

pub fn interrupts_enabled() -> bool {
    sstatus::read().sie()
}

pub fn disable_interrupts() {
    unsafe { sstatus::clear_sie() };
}

pub fn enable_interrupts() {
    unsafe { sstatus::set_sie() };
}

pub fn wait_for_interrupt() {
    unsafe { riscv::asm::wfi() };
}

/// 写入 `satp` 并刷新 TLB
///
/// 地址空间令牌即 `satp` 的值；内核地址空间为 0（Bare 模式）。
pub fn activate_address_space(token: usize) {
    unsafe {
        satp::write(token);
        asm!("sfence.vma");
    }
}

pub fn active_address_space() -> usize {
    satp::read().bits()
}

/// `sret` 会按保存的 `sstatus` 恢复中断开关，这里无需额外处理
pub fn prepare_return(_regs: &RegisterState) {}

pub fn console_write(s: &str) {
    for c in s.bytes() {
        sbi::console_putchar(c as usize);
    }
}

pub fn timestamp() -> u64 {
    time::read() as u64
}

/// 设置下一次时钟中断
pub fn set_next_trigger() {
    sbi::set_timer(time::read() + CLOCK_FREQ / TICKS_PER_SEC);
}

/// 打开 S 态时钟中断
pub fn enable_timer_interrupt() {
    unsafe { sie::set_stimer() };
}

/// 打开浮点单元（`sstatus.FS = Initial`）
pub fn enable_fpu() {
    unsafe { sstatus::set_fs(sstatus::FS::Initial) };
}

/// 停下当前 hart
///
/// 0 号 hart 通过 SBI 关机，其余 hart 关中断后停在 `wfi`。
pub fn halt(cpu: usize) -> ! {
    if cpu == 0 {
        sbi::shutdown(false);
    }
    disable_interrupts();
    loop {
        unsafe { riscv::asm::wfi() };
    }
}
