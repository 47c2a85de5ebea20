//! # 语言项实现模块
//!
//! panic 时打印位置与消息，然后通过 SBI 以故障原因关机。

use core::panic::PanicInfo;
use nimloth_sched::PerCpuState;
use nimloth_sched::arch::{disable_interrupts, sbi::shutdown};
use nimloth_sched::kprintln;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    disable_interrupts();
    let cpu = PerCpuState::current_id();
    if let Some(location) = info.location() {
        kprintln!(
            "Paniced on cpu {:?} at {}:{}:{}: {}",
            cpu,
            location.file(),
            location.line(),
            location.column(),
            info.message()
        );
    } else {
        kprintln!("Paniced on cpu {:?}: {}", cpu, info.message());
    }
    shutdown(true);
}
