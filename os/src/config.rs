//! # 内核镜像配置常量
//!
//! 调度相关的参数见 [`nimloth_sched::config`]，这里只有启动与内存布局
//! 相关的常量。

/// 内核堆大小 (3MB)
pub const KERNEL_HEAP_SIZE: usize = 0x30_0000;

/// 参与调度的 hart 数量，需与 QEMU 的 `-smp` 参数一致
pub const HART_COUNT: usize = 4;

/// 演示负载中的工作线程数量
pub const WORKER_COUNT: usize = 8;
