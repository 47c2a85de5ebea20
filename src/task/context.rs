use crate::arch::{ExecutionMode, RegisterState, ThreadRegisters, TrapRegisters};
use crate::trap::TrapFrame;
use core::ptr;

/// 线程的寄存器相关状态
///
/// 只由正在以该线程身份执行的 CPU 访问：线程运行时属于它所在的 CPU，
/// 换出后属于下一个换入它的 CPU。
#[repr(C)]
pub struct ThreadContext {
    /// 切换时保存的栈指针、恢复点与浮点状态
    pub regs: ThreadRegisters,
    /// 入口寄存器映像，`init_context` 据此构造首次调度的合成帧
    pub entry: RegisterState,
    /// 换出时的临界区深度
    pub saved_critical: usize,
    /// 最内层陷入帧
    pub current_trap: *mut TrapFrame,
    pub previous_mode: ExecutionMode,
    /// 地址空间令牌
    pub address_space: usize,
    /// 初始帧相对栈顶的偏移（16 字节对齐）
    pub frame_offset: usize,
}

impl ThreadContext {
    /// 内核线程的初始上下文：从 `entry(arg)` 开始执行
    pub fn kernel(entry: usize, arg: usize, address_space: usize, frame_offset: usize) -> Self {
        let mut regs = RegisterState::default();
        regs.set_ip(entry);
        regs.set_arg(arg);
        regs.set_return_mode(ExecutionMode::Kernel);
        Self {
            regs: ThreadRegisters::new(),
            entry: regs,
            saved_critical: 1,
            current_trap: ptr::null_mut(),
            previous_mode: ExecutionMode::Kernel,
            address_space,
            frame_offset,
        }
    }
}
