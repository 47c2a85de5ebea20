//! # 线程与进程
//!
//! - [`Thread`]：线程控制块与调度状态
//! - [`Process`]：持有线程的最小进程模型
//! - [`TidAllocator`] / [`StackArena`]：线程 ID 与按 ID 索引的内核栈

mod context;
mod process;
mod stack;
mod thread;
mod tid;

pub use context::ThreadContext;
pub use process::Process;
pub use stack::{KernelStack, STACK_CANARY, StackArena};
pub use thread::{BlockReason, Thread, ThreadInner};
pub use tid::{TidAllocator, TidHandle};

/// 线程调度状态
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// 在运行队列中等待被选中（空闲线程不进队列）
    Runnable,
    /// 是某个 CPU 的当前线程
    Running,
    /// 在某个阻塞列表中等待
    Blocked,
    /// 已退出，等待换入一侧回收
    Dying,
    /// 已回收
    Dead,
}

/// CPU 亲和性掩码，第 `i` 位表示允许在 CPU `i` 上运行
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn all() -> Self {
        CpuMask(u64::MAX)
    }

    pub const fn only(cpu: usize) -> Self {
        CpuMask(1 << cpu)
    }

    pub const fn from_bits(bits: u64) -> Self {
        CpuMask(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn contains(&self, cpu: usize) -> bool {
        cpu < 64 && self.0 & (1 << cpu) != 0
    }

    /// 限制到前 `cpu_count` 个 CPU
    pub const fn within(&self, cpu_count: usize) -> Self {
        if cpu_count >= 64 {
            *self
        } else {
            CpuMask(self.0 & ((1 << cpu_count) - 1))
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_is_clamped_to_configured_cpus() {
        assert_eq!(CpuMask::all().within(2).bits(), 0b11);
        assert!(CpuMask::only(3).within(2).is_empty());
        assert!(CpuMask::only(1).contains(1));
        assert!(!CpuMask::only(1).contains(0));
        assert!(!CpuMask::all().contains(64));
    }
}
