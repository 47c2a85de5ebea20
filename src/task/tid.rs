//! # 线程标识符分配
//!
//! 线程 ID 同时是内核栈槽位的下标，因此有固定上限并且回收复用。
//! [`TidHandle`] 以 RAII 方式持有一个 ID，析构时归还给分配器。
//!
//! 分配器由关中断自旋锁保护，分配与回收都计入临界区：回收会在任意
//! 线程上下文里发生（最后一个 `Arc<Thread>` 被释放时），持锁期间不能被
//! 调度出去，锁释放之后才是安全点。

use crate::error::{SchedError, SchedResult};
use crate::sync::Spinlock;
use alloc::vec::Vec;

/// 线程 ID 分配器
///
/// 先复用回收的 ID，回收池为空时再递增分配新 ID。
pub struct TidAllocator {
    current: usize,
    limit: usize,
    recycled: Vec<usize>,
}

impl TidAllocator {
    pub fn new(limit: usize) -> Self {
        TidAllocator {
            current: 0,
            limit,
            recycled: Vec::new(),
        }
    }

    pub fn alloc(&mut self) -> SchedResult<usize> {
        if let Some(tid) = self.recycled.pop() {
            Ok(tid)
        } else if self.current < self.limit {
            self.current += 1;
            Ok(self.current - 1)
        } else {
            Err(SchedError::ThreadLimit)
        }
    }

    /// 回收一个 ID
    ///
    /// ## Panics
    ///
    /// 回收从未分配或已经回收过的 ID 时 panic
    pub fn dealloc(&mut self, tid: usize) {
        assert!(tid < self.current, "tid {} was never allocated", tid);
        assert!(
            !self.recycled.iter().any(|t| *t == tid),
            "tid {} has been deallocated!",
            tid
        );
        self.recycled.push(tid);
    }

    /// 当前在用的 ID 数量
    pub fn in_use(&self) -> usize {
        self.current - self.recycled.len()
    }
}

/// 线程 ID 句柄
pub struct TidHandle {
    tid: usize,
    allocator: &'static Spinlock<TidAllocator>,
}

impl TidHandle {
    pub fn alloc(allocator: &'static Spinlock<TidAllocator>) -> SchedResult<Self> {
        let tid = allocator.lock().alloc()?;
        Ok(Self { tid, allocator })
    }

    pub fn get(&self) -> usize {
        self.tid
    }
}

impl Drop for TidHandle {
    fn drop(&mut self) {
        self.allocator.lock().dealloc(self.tid);
    }
}
