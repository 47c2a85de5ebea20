//! # 调度器配置常量
//!
//! 定义调度核心使用的各种配置参数，包括 CPU 与线程上限、内核栈大小、
//! 优先级队列数量、时间片长度以及栈偏移随机化等。
//!
//! 编译期常量给出默认值，运行期通过 [`SchedulerConfig`] 覆盖。

/// 支持的最大逻辑 CPU 数量
pub const MAX_CPUS: usize = 8;

/// 同时存活的最大线程数（同时也是内核栈槽位数）
pub const MAX_THREADS: usize = 64;

/// 内核栈大小
///
/// 内核目标上为 16KB；宿主环境下线程体会执行格式化、断言等较重的
/// 标准库代码，因此放大到 128KB。
#[cfg(target_os = "none")]
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;
#[cfg(not(target_os = "none"))]
pub const KERNEL_STACK_SIZE: usize = 4096 * 32;

/// 优先级队列数量，索引 0 为最高优先级
pub const PRIORITY_CLASSES: usize = 4;

/// 新建线程的默认优先级
pub const DEFAULT_PRIORITY: usize = 1;

/// 基础时间片（时钟周期数）
///
/// 第 `i` 级队列的时间片为 `BASE_TIME_SLICE << i`。
pub const BASE_TIME_SLICE: usize = 2;

/// 延迟调用池容量
pub const DEFERRED_CALL_POOL_SIZE: usize = 64;

/// 初始栈顶随机偏移上限（字节）
pub const STACK_OFFSET_LIMIT: usize = 256;

/// 每秒时钟中断次数
pub const TICKS_PER_SEC: usize = 100;

/// QEMU virt 平台的 timebase 频率
pub const CLOCK_FREQ: usize = 10_000_000;

/// 初始栈顶偏移策略
///
/// 在构造新线程的初始帧之前，从栈顶向下偏移一段 16 字节对齐的距离。
/// 这只是尽力而为的栈布局扰动，不构成安全保证。
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackOffset {
    /// 不偏移，帧总是紧贴栈顶
    Disabled,
    /// 偏移量在 `[0, limit)` 内随机选取并向下对齐到 16 字节
    Random { limit: usize },
}

/// 运行期调度器配置
#[derive(Copy, Clone, Debug)]
pub struct SchedulerConfig {
    /// 参与调度的 CPU 数量
    pub cpu_count: usize,
    /// 最高优先级队列的时间片
    pub base_time_slice: usize,
    /// 初始栈顶偏移策略
    pub stack_offset: StackOffset,
    /// 线程数上限，不超过 [`MAX_THREADS`]
    pub max_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            base_time_slice: BASE_TIME_SLICE,
            stack_offset: StackOffset::Random {
                limit: STACK_OFFSET_LIMIT,
            },
            max_threads: MAX_THREADS,
        }
    }
}

impl SchedulerConfig {
    pub fn with_cpus(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            ..Self::default()
        }
    }

    /// 指定优先级队列的时间片长度
    pub fn time_slice(&self, priority: usize) -> usize {
        let class = priority.min(PRIORITY_CLASSES - 1);
        self.base_time_slice << class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_slice_doubles_per_class() {
        let config = SchedulerConfig::default();
        assert_eq!(config.time_slice(0), BASE_TIME_SLICE);
        assert_eq!(config.time_slice(1), BASE_TIME_SLICE * 2);
        assert_eq!(config.time_slice(3), BASE_TIME_SLICE * 8);
        // 越界的优先级按最低一级计算
        assert_eq!(config.time_slice(42), BASE_TIME_SLICE * 8);
    }

    #[test]
    fn stack_offset_limit_keeps_frame_alignment() {
        assert_eq!(STACK_OFFSET_LIMIT % 16, 0);
        assert_eq!(KERNEL_STACK_SIZE % 16, 0);
    }
}
