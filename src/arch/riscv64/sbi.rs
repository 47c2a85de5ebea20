#![allow(unused)]
//! # SBI (Supervisor Binary Interface) 封装
//!
//! 基于 `sbi-rt` 提供与 RISC-V SBI 固件的交互接口：控制台输出、
//! 定时器、多核启动与系统复位。

/// 控制台输出单个字符
///
/// ## Arguments
/// * `c` - 要输出的字符（ASCII 码）
pub fn console_putchar(c: usize) {
    #[allow(deprecated)]
    sbi_rt::legacy::console_putchar(c);
}

/// 设置时钟中断触发时间（绝对时间，以 timebase 计数为单位）
pub fn set_timer(timer: usize) {
    sbi_rt::set_timer(timer as _);
}

/// 启动一个处于停止状态的 hart
///
/// 目标 hart 从 `start_addr` 开始以 S 态执行，`a0 = hartid`，`a1 = opaque`。
///
/// ## Returns
/// 固件接受请求时返回 `true`
pub fn hart_start(hartid: usize, start_addr: usize, opaque: usize) -> bool {
    sbi_rt::hart_start(hartid, start_addr, opaque).is_ok()
}

/// 关闭系统
///
/// ## Arguments
/// * `failure` - 是否因为系统故障而关闭
pub fn shutdown(failure: bool) -> ! {
    use sbi_rt::{NoReason, Shutdown, SystemFailure, system_reset};
    if !failure {
        system_reset(Shutdown, NoReason);
    } else {
        system_reset(Shutdown, SystemFailure);
    }
    unreachable!()
}
