use crate::arch::{ExecutionMode, TrapRegisters};
use bitflags::bitflags;

bitflags! {
    /// `sstatus` 中陷入返回用到的位
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct SStatus: usize {
        const SIE = 1 << 1;
        const SPIE = 1 << 5;
        const SPP = 1 << 8;
        const FS_INITIAL = 1 << 13;
        const FS_DIRTY = 3 << 13;
        const SUM = 1 << 18;
    }
}

/// 陷入寄存器快照
///
/// `x[i]` 保存通用寄存器 `xi`（`x[0]` 不使用），之后依次是 `sstatus`、
/// `sepc`、`scause`、`stval`。布局被 `trap.S` 直接使用。
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct RegisterState {
    pub x: [usize; 32],
    pub sstatus: usize,
    pub sepc: usize,
    pub scause: usize,
    pub stval: usize,
}

const _: () = assert!(core::mem::size_of::<RegisterState>() == 288);

impl Default for RegisterState {
    fn default() -> Self {
        Self {
            x: [0; 32],
            sstatus: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
        }
    }
}

impl TrapRegisters for RegisterState {
    fn ip(&self) -> usize {
        self.sepc
    }

    fn set_ip(&mut self, ip: usize) {
        self.sepc = ip;
    }

    fn sp(&self) -> usize {
        self.x[2]
    }

    fn set_sp(&mut self, sp: usize) {
        self.x[2] = sp;
    }

    fn return_address(&self) -> usize {
        self.x[1]
    }

    fn set_return_address(&mut self, ra: usize) {
        self.x[1] = ra;
    }

    fn set_arg(&mut self, arg: usize) {
        self.x[10] = arg;
    }

    fn arg(&self) -> usize {
        self.x[10]
    }

    fn previous_mode(&self) -> ExecutionMode {
        if SStatus::from_bits_truncate(self.sstatus).contains(SStatus::SPP) {
            ExecutionMode::Kernel
        } else {
            ExecutionMode::User
        }
    }

    fn set_return_mode(&mut self, mode: ExecutionMode) {
        let mut status = SStatus::SPIE | SStatus::FS_INITIAL;
        if mode == ExecutionMode::Kernel {
            status |= SStatus::SPP;
        }
        self.sstatus = status.bits();
    }

    fn interrupts_enabled_on_return(&self) -> bool {
        SStatus::from_bits_truncate(self.sstatus).contains(SStatus::SPIE)
    }
}

/// 浮点寄存器 `f0`-`f31` 与 `fcsr`
#[repr(C)]
pub struct FpuState {
    pub f: [u64; 32],
    pub fcsr: u64,
}

impl FpuState {
    pub fn new() -> Self {
        Self { f: [0; 32], fcsr: 0 }
    }
}
