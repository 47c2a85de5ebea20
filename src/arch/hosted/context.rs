use crate::arch::{ExecutionMode, TrapRegisters};
use bitflags::bitflags;

bitflags! {
    /// RFLAGS 中与线程恢复相关的位
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RFlags: u64 {
        const RESERVED_1 = 1 << 1;
        const INTERRUPT_ENABLE = 1 << 9;
    }
}

/// 陷入寄存器快照（宿主 x86_64）
///
/// 布局与 `switch.S` 中的 `__restore_previous_context` 一致。`ra` 模拟
/// 链接寄存器：恢复时作为返回地址压在目标栈上；`mode` 模拟特权级。
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct RegisterState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ra: u64,
    pub mode: u64,
}

const _: () = assert!(core::mem::size_of::<RegisterState>() == 160);
const _: () = assert!(core::mem::offset_of!(RegisterState, rip) == 120);
const _: () = assert!(core::mem::offset_of!(RegisterState, ra) == 144);

impl TrapRegisters for RegisterState {
    fn ip(&self) -> usize {
        self.rip as usize
    }

    fn set_ip(&mut self, ip: usize) {
        self.rip = ip as u64;
    }

    fn sp(&self) -> usize {
        self.rsp as usize
    }

    fn set_sp(&mut self, sp: usize) {
        self.rsp = sp as u64;
    }

    fn return_address(&self) -> usize {
        self.ra as usize
    }

    fn set_return_address(&mut self, ra: usize) {
        self.ra = ra as u64;
    }

    fn set_arg(&mut self, arg: usize) {
        self.rdi = arg as u64;
    }

    fn arg(&self) -> usize {
        self.rdi as usize
    }

    fn previous_mode(&self) -> ExecutionMode {
        if self.mode == 0 {
            ExecutionMode::Kernel
        } else {
            ExecutionMode::User
        }
    }

    fn set_return_mode(&mut self, mode: ExecutionMode) {
        self.mode = match mode {
            ExecutionMode::Kernel => 0,
            ExecutionMode::User => 3,
        };
        self.rflags = (RFlags::RESERVED_1 | RFlags::INTERRUPT_ENABLE).bits();
    }

    fn interrupts_enabled_on_return(&self) -> bool {
        RFlags::from_bits_truncate(self.rflags).contains(RFlags::INTERRUPT_ENABLE)
    }
}

/// 浮点状态：`fxsave64` 的 512 字节保存区
#[repr(C, align(16))]
pub struct FpuState {
    area: [u8; 512],
}

impl FpuState {
    /// 复位后的默认浮点环境：x87 控制字 0x037F，MXCSR 0x1F80（全部异常屏蔽）
    pub fn new() -> Self {
        let mut area = [0u8; 512];
        area[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
        area[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        Self { area }
    }

    pub fn mxcsr(&self) -> u32 {
        u32::from_le_bytes([self.area[24], self.area[25], self.area[26], self.area[27]])
    }
}
