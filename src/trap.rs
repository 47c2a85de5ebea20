//! # 陷入帧与陷入返回路径
//!
//! 每次陷入在线程的内核栈上压入一个 [`TrapFrame`]，它指向本次保存的
//! 寄存器快照，并链接到外层陷入帧，构成每线程一条的侵入式单链表：
//!
//! ```text
//! 高地址   ┌──────────────────┐
//!          │ 内核入口槽 (16B)   │
//!          ├──────────────────┤ ◄─ Thread::current_trap
//!          │ TrapFrame (32B)   │──┐ next_trap
//!          ├──────────────────┤  │
//!          │ RegisterState     │◄─┘ regs
//!          ├──────────────────┤
//!          │ ...               │
//!          ├──────────────────┤
//!          │ TrapFrame         │──► 外层陷入帧
//!          │ RegisterState     │
//! 低地址   └──────────────────┘
//! ```
//!
//! 栈内存的生命周期长于所有指向它的陷入帧：陷入帧只在压入它的那次
//! 调用返回前有效，并严格按后进先出弹出。

use crate::arch::{ExecutionMode, RegisterState, TrapRegisters};
use crate::processor::PerCpuState;
use core::ptr;

/// 陷入帧
///
/// 布局被陷入入口汇编直接使用：`regs` 位于偏移 16。
#[repr(C)]
pub struct TrapFrame {
    /// 进入本次陷入前的 `in_irq`
    pub prev_irq_level: usize,
    /// 外层陷入帧
    pub next_trap: *mut TrapFrame,
    /// 本次陷入保存的寄存器
    pub regs: *mut RegisterState,
    _reserved: usize,
}

impl TrapFrame {
    pub fn new(regs: *mut RegisterState) -> Self {
        Self {
            prev_irq_level: 0,
            next_trap: ptr::null_mut(),
            regs,
            _reserved: 0,
        }
    }

    pub fn regs(&self) -> &RegisterState {
        unsafe { &*self.regs }
    }

    pub fn regs_mut(&mut self) -> &mut RegisterState {
        unsafe { &mut *self.regs }
    }
}

/// 陷入入口的公共部分
///
/// 记录进入前的中断嵌套深度（`raise_irq` 时加一），并把 `trap` 压入当前
/// 线程的陷入帧链。调用时中断必须是关闭的。
pub fn enter_trap(trap: &mut TrapFrame, raise_irq: bool) {
    let Some(cpu) = PerCpuState::current() else {
        trap.next_trap = ptr::null_mut();
        return;
    };
    let level = cpu.in_irq();
    trap.prev_irq_level = level;
    if raise_irq {
        cpu.set_in_irq(level + 1);
    }
    match cpu.current_thread() {
        Some(thread) => {
            let ctx = unsafe { &mut *thread.context_ptr() };
            trap.next_trap = ctx.current_trap;
            ctx.current_trap = trap;
            ctx.previous_mode = trap.regs().previous_mode();
        }
        None => trap.next_trap = ptr::null_mut(),
    }
}

/// 统一的陷入返回路径
///
/// 1. 临时进入临界区，防止延迟调用里的临界区提前触发调度
/// 2. 恢复 `in_irq`；嵌套退到零时执行延迟调用
/// 3. 弹出陷入帧，按外层陷入帧重新计算先前模式（没有外层时为内核态）
/// 4. 静默离开临时临界区
/// 5. `in_irq` 与 `in_critical` 都为零时检查挂起的调度请求
pub fn exit_trap(trap: &mut TrapFrame) {
    let Some(cpu) = PerCpuState::current() else {
        return;
    };
    cpu.enter_critical();
    cpu.set_in_irq(trap.prev_irq_level);
    if cpu.in_irq() == 0 {
        cpu.execute_deferred();
    }

    if let Some(thread) = cpu.current_thread() {
        let ctx = unsafe { &mut *thread.context_ptr() };
        if ctx.current_trap != trap as *mut TrapFrame {
            cpu.fatal("exit_trap: trap frame is not the innermost one");
        }
        ctx.current_trap = trap.next_trap;
        ctx.previous_mode = if trap.next_trap.is_null() {
            ExecutionMode::Kernel
        } else {
            unsafe { (*trap.next_trap).regs().previous_mode() }
        };
    }

    cpu.leave_critical_silently();
    if cpu.in_irq() == 0 && cpu.in_critical() == 0 {
        cpu.check_invoke_scheduler();
    }
}

/// 陷入返回汇编在恢复寄存器前调用
#[unsafe(no_mangle)]
pub extern "C" fn trap_exit_entry(trap: &mut TrapFrame) {
    exit_trap(trap);
    crate::arch::prepare_return(trap.regs());
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn trap_frame_layout_matches_entry_code() {
        assert_eq!(size_of::<TrapFrame>(), 32);
        assert_eq!(offset_of!(TrapFrame, prev_irq_level), 0);
        assert_eq!(offset_of!(TrapFrame, next_trap), 8);
        assert_eq!(offset_of!(TrapFrame, regs), 16);
    }

    #[test]
    fn register_block_keeps_frames_aligned() {
        assert_eq!(crate::arch::REGISTER_STATE_SIZE % 16, 0);
        assert_eq!((crate::arch::REGISTER_STATE_SIZE + size_of::<TrapFrame>()) % 16, 0);
    }
}
