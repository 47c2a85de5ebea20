//! # 陷入分发
//!
//! `__trap_entry` 把寄存器压栈后调用 [`trap_handler`]。时钟中断与软件
//! 中断按中断上下文处理（提升 `in_irq`），其余异常在内核里都是致命的。

use super::set_next_trigger;
use crate::processor::PerCpuState;
use crate::sched::Scheduler;
use crate::trap::{TrapFrame, enter_trap, exit_trap};
use core::arch::global_asm;
use log::error;
use riscv::register::{
    mtvec::TrapMode,
    scause::{self, Interrupt, Trap},
    stval, stvec,
};

global_asm!(include_str!("trap.S"));

/// 安装陷入入口
///
/// 每个 hart 启动时调用一次；同时把 `sscratch` 清零，表示当前处于内核态。
pub fn init_trap() {
    unsafe extern "C" {
        fn __trap_entry();
    }
    unsafe {
        stvec::write(__trap_entry as usize, TrapMode::Direct);
        core::arch::asm!("csrw sscratch, zero");
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn trap_handler(trap: &mut TrapFrame) {
    let scause = scause::read();
    match scause.cause() {
        Trap::Interrupt(Interrupt::SupervisorTimer) => {
            enter_trap(trap, true);
            set_next_trigger();
            if let Some(sched) = Scheduler::current() {
                sched.timer_tick();
            }
            exit_trap(trap);
        }
        Trap::Interrupt(Interrupt::SupervisorSoft) => {
            enter_trap(trap, true);
            unsafe { core::arch::asm!("csrci sip, 2") };
            exit_trap(trap);
        }
        cause => {
            enter_trap(trap, false);
            let regs = trap.regs();
            error!(
                "unhandled trap {:?} on cpu {:?}: sepc={:#x} stval={:#x} sstatus={:#x}",
                cause,
                PerCpuState::current_id(),
                regs.sepc,
                stval::read(),
                regs.sstatus
            );
            panic!("unhandled kernel trap");
        }
    }
}
