//! # 延迟调用池
//!
//! 中断处理程序不直接做耗时或会触发调度的工作（例如唤醒线程），而是把
//! 回调放进当前 CPU 的延迟调用池，等中断嵌套退到零、重新调度判断之前
//! 统一执行。
//!
//! ## 执行时机
//!
//! ```text
//! trap entry ─► handler ─► queue(..) ─► exit_trap
//!                                          │ in_irq == 0
//!                                          ▼
//!                                   execute_pending()   FIFO，每项一次
//!                                          │
//!                                          ▼
//!                                 check_invoke_scheduler()
//! ```
//!
//! 入队无锁（`crossbeam_queue::ArrayQueue`），中断上下文里可以安全调用。
//! 不分配内存的 [`DeferredCallPool::queue`] 是中断上下文的首选；
//! [`DeferredCallPool::queue_boxed`] 接受任意闭包，但需要堆分配。

use crate::config::DEFERRED_CALL_POOL_SIZE;
use crate::error::{SchedError, SchedResult};
use alloc::boxed::Box;
use crossbeam_queue::ArrayQueue;

/// 一个待执行的延迟调用
pub enum DeferredCall {
    /// 函数指针加一个字长的参数，入队时不分配内存
    Inline { func: fn(usize), arg: usize },
    /// 任意一次性闭包
    Boxed(Box<dyn FnOnce() + Send>),
}

impl DeferredCall {
    fn invoke(self) {
        match self {
            DeferredCall::Inline { func, arg } => func(arg),
            DeferredCall::Boxed(f) => f(),
        }
    }
}

pub struct DeferredCallPool {
    pending: ArrayQueue<DeferredCall>,
}

impl DeferredCallPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFERRED_CALL_POOL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: ArrayQueue::new(capacity),
        }
    }

    /// 入队一个不分配内存的调用
    ///
    /// ## Returns
    ///
    /// 池满时返回 [`SchedError::DeferredPoolFull`]，调用被丢弃
    pub fn queue(&self, func: fn(usize), arg: usize) -> SchedResult<()> {
        self.pending
            .push(DeferredCall::Inline { func, arg })
            .map_err(|_| SchedError::DeferredPoolFull)
    }

    /// 入队一个闭包
    pub fn queue_boxed<F>(&self, f: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending
            .push(DeferredCall::Boxed(Box::new(f)))
            .map_err(|_| SchedError::DeferredPoolFull)
    }

    /// 按入队顺序执行当前所有待执行的调用
    ///
    /// 执行过程中新入队的调用也会在本次被执行，返回时池为空。
    ///
    /// ## Returns
    ///
    /// 本次执行的调用数量
    pub fn execute_pending(&self) -> usize {
        let mut executed = 0;
        while let Some(call) = self.pending.pop() {
            call.invoke();
            executed += 1;
        }
        executed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for DeferredCallPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use spin::Mutex;

    static INLINE_HITS: AtomicUsize = AtomicUsize::new(0);

    fn bump(arg: usize) {
        INLINE_HITS.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn drains_in_enqueue_order_exactly_once() {
        let pool = DeferredCallPool::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            pool.queue_boxed(move || log.lock().push(i)).unwrap();
        }
        assert_eq!(pool.len(), 5);
        assert_eq!(pool.execute_pending(), 5);
        assert!(pool.is_empty());
        assert_eq!(*log.lock(), [0, 1, 2, 3, 4]);
        // 再次执行不会重复调用
        assert_eq!(pool.execute_pending(), 0);
        assert_eq!(log.lock().len(), 5);
    }

    #[test]
    fn inline_calls_receive_their_argument() {
        let pool = DeferredCallPool::new();
        pool.queue(bump, 3).unwrap();
        pool.queue(bump, 4).unwrap();
        pool.execute_pending();
        assert_eq!(INLINE_HITS.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn full_pool_rejects_new_calls() {
        let pool = DeferredCallPool::with_capacity(2);
        pool.queue_boxed(|| {}).unwrap();
        pool.queue_boxed(|| {}).unwrap();
        assert_eq!(pool.queue_boxed(|| {}), Err(SchedError::DeferredPoolFull));
        assert_eq!(pool.execute_pending(), 2);
        assert!(pool.queue_boxed(|| {}).is_ok());
    }
}
