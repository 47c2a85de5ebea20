//! # 控制台输出
//!
//! 提供 `kprint!` 与 `kprintln!` 宏。输出经由体系结构层写到控制台
//! （内核目标为 SBI，宿主环境为标准错误）。整行输出在关中断的锁内完成，
//! 多个 CPU 的输出不会交错。

use crate::arch::{self, InterruptDisabler};
use core::fmt::{self, Write};
use spin::Mutex;

struct Stdout;

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        arch::console_write(s);
        Ok(())
    }
}

static STDOUT: Mutex<Stdout> = Mutex::new(Stdout);

/// 格式化输出，`kprint!` 与 `kprintln!` 的底层实现
pub fn print(args: fmt::Arguments) {
    let _irq = InterruptDisabler::new();
    // 控制台写入不会失败
    let _ = STDOUT.lock().write_fmt(args);
}

/// 格式化打印（不换行）
#[macro_export]
macro_rules! kprint {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?))
    }
}

/// 格式化打印（带换行）
#[macro_export]
macro_rules! kprintln {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?))
    }
}
