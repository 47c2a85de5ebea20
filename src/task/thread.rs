//! # 线程控制块
//!
//! [`Thread`] 由所属进程强引用持有；运行队列、阻塞列表和 CPU 的当前线程
//! 槽位各自持有一份 `Arc`。可变状态分两部分：
//!
//! - [`ThreadInner`]：调度状态、优先级、亲和性等，受线程自己的关中断
//!   自旋锁保护，且只在持有调度锁时发生状态迁移
//! - [`ThreadContext`]：寄存器相关状态，不加锁，只由以该线程身份执行的
//!   CPU 访问
//!
//! ## 状态机
//!
//! ```text
//!              pick                     exit
//! Runnable ─────────► Running ──────────────────► Dying ──► Dead
//!    ▲                 │   │                        (换入一侧回收)
//!    │   yield/tick    │   │ block
//!    └─────────────────┘   ▼
//!    ◄──────────────── Blocked
//!          unblock
//! ```

use super::context::ThreadContext;
use super::process::Process;
use super::stack::KernelStack;
use super::tid::TidHandle;
use super::{CpuMask, ThreadState};
use crate::sync::{Spinlock, SpinlockGuard, WaitQueue};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::cell::UnsafeCell;

/// 阻塞原因
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockReason {
    /// 在等待队列上等待条件成立；`queue` 为队列地址
    Wait { queue: usize },
    /// 睡眠到指定时钟周期
    Sleep { deadline: u64 },
}

pub struct ThreadInner {
    pub state: ThreadState,
    pub priority: usize,
    pub affinity: CpuMask,
    /// 最近一次运行所在的 CPU
    pub cpu: Option<usize>,
    /// 剩余时间片
    pub time_slice: usize,
    pub exit_code: Option<i32>,
    pub block_reason: Option<BlockReason>,
    /// 经由首次调度路径进入的次数，正常情况下恒为 1
    pub first_dispatches: usize,
    /// 被选中运行的次数
    pub dispatches: usize,
}

pub struct Thread {
    tid: TidHandle,
    name: String,
    idle: bool,
    process: Weak<Process>,
    kstack: KernelStack,
    inner: Spinlock<ThreadInner>,
    context: UnsafeCell<ThreadContext>,
    exit_waiters: WaitQueue,
}

// ThreadContext 只由以该线程身份执行的 CPU 访问，见模块文档。
unsafe impl Sync for Thread {}
unsafe impl Send for Thread {}

impl Thread {
    pub(crate) fn new(
        tid: TidHandle,
        name: &str,
        idle: bool,
        process: &Arc<Process>,
        kstack: KernelStack,
        inner: ThreadInner,
        context: ThreadContext,
    ) -> Self {
        Self {
            tid,
            name: String::from(name),
            idle,
            process: Arc::downgrade(process),
            kstack,
            inner: Spinlock::new(inner),
            context: UnsafeCell::new(context),
            exit_waiters: WaitQueue::new(),
        }
    }

    pub fn tid(&self) -> usize {
        self.tid.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kstack
    }

    pub fn inner_exclusive_access(&self) -> SpinlockGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    pub fn priority(&self) -> usize {
        self.inner.lock().priority
    }

    pub fn affinity(&self) -> CpuMask {
        self.inner.lock().affinity
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().exit_code
    }

    /// 首次调度路径被执行的次数
    pub fn first_dispatch_count(&self) -> usize {
        self.inner.lock().first_dispatches
    }

    pub fn dispatch_count(&self) -> usize {
        self.inner.lock().dispatches
    }

    pub(crate) fn context_ptr(&self) -> *mut ThreadContext {
        self.context.get()
    }

    /// 当前保存的临界区深度与地址空间令牌
    pub fn saved_critical(&self) -> usize {
        unsafe { (*self.context.get()).saved_critical }
    }

    pub fn address_space(&self) -> usize {
        unsafe { (*self.context.get()).address_space }
    }

    pub(crate) fn exit_waiters(&self) -> &WaitQueue {
        &self.exit_waiters
    }

    /// 等待线程结束并取得退出码
    ///
    /// ## Panics
    ///
    /// 线程等待自己时 panic
    pub fn join(self: &Arc<Self>) -> i32 {
        if let Some(current) = crate::sched::current_thread() {
            assert!(
                !Arc::ptr_eq(&current, self),
                "thread {} cannot join itself",
                self.tid()
            );
        }
        self.exit_waiters
            .wait_while(|| self.state() != ThreadState::Dead);
        self.exit_code().unwrap_or(0)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Thread({} '{}')", self.tid(), self.name)
    }
}
