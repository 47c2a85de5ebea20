//! # 运行队列
//!
//! 每个优先级一个 FIFO 队列，索引 0 为最高优先级。选取时从高到低扫描，
//! 在同一优先级内取第一个亲和性允许在目标 CPU 上运行的线程：
//!
//! ```text
//! class 0  │ A │ B │          ◄── 先扫描
//! class 1  │ C │ D │ E │
//! class 2  │
//! class 3  │ F │              ◄── 最后扫描
//! ```
//!
//! 优先级是静态的：用完时间片的线程回到同一优先级的队尾，不降级，
//! 也没有老化提升。

use crate::config::PRIORITY_CLASSES;
use crate::task::Thread;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub struct RunQueue {
    classes: Vec<VecDeque<Arc<Thread>>>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            classes: (0..PRIORITY_CLASSES).map(|_| VecDeque::new()).collect(),
        }
    }

    /// 放到 `priority` 队列的队尾
    pub fn push(&mut self, thread: Arc<Thread>, priority: usize) {
        let class = priority.min(PRIORITY_CLASSES - 1);
        self.classes[class].push_back(thread);
    }

    /// 取出最高优先级中第一个满足 `eligible` 的线程
    pub fn pop_first<F>(&mut self, mut eligible: F) -> Option<Arc<Thread>>
    where
        F: FnMut(&Thread) -> bool,
    {
        for queue in self.classes.iter_mut() {
            if let Some(index) = queue.iter().position(|t| eligible(t)) {
                return queue.remove(index);
            }
        }
        None
    }

    pub fn contains(&self, tid: usize) -> bool {
        self.classes
            .iter()
            .any(|queue| queue.iter().any(|t| t.tid() == tid))
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(|queue| queue.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(|queue| queue.is_empty())
    }

    /// 各优先级队列中的线程 ID，按出队顺序
    pub fn tids(&self) -> Vec<Vec<usize>> {
        self.classes
            .iter()
            .map(|queue| queue.iter().map(|t| t.tid()).collect())
            .collect()
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{
        CpuMask, Process, StackArena, ThreadContext, ThreadInner, ThreadState, TidAllocator,
        TidHandle,
    };
    use crate::sync::Spinlock;
    use alloc::boxed::Box;

    struct Fixture {
        tids: &'static Spinlock<TidAllocator>,
        stacks: &'static StackArena,
        process: Arc<Process>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tids: Box::leak(Box::new(Spinlock::new(TidAllocator::new(8)))),
                stacks: Box::leak(Box::new(StackArena::new(8))),
                process: Arc::new(Process::new(0, "test", 0)),
            }
        }

        fn thread(&self, affinity: CpuMask) -> Arc<Thread> {
            let tid = TidHandle::alloc(self.tids).unwrap();
            let stack = self.stacks.stack(tid.get());
            let inner = ThreadInner {
                state: ThreadState::Runnable,
                priority: 0,
                affinity,
                cpu: None,
                time_slice: 0,
                exit_code: None,
                block_reason: None,
                first_dispatches: 0,
                dispatches: 0,
            };
            Arc::new(Thread::new(
                tid,
                "t",
                false,
                &self.process,
                stack,
                inner,
                ThreadContext::kernel(0, 0, 0, 0),
            ))
        }
    }

    #[test]
    fn fifo_within_a_class() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new();
        let threads: Vec<_> = (0..3).map(|_| fx.thread(CpuMask::all())).collect();
        for t in &threads {
            rq.push(t.clone(), 2);
        }
        let order: Vec<_> = (0..3)
            .map(|_| rq.pop_first(|_| true).unwrap().tid())
            .collect();
        let expected: Vec<_> = threads.iter().map(|t| t.tid()).collect();
        assert_eq!(order, expected);
        assert!(rq.is_empty());
    }

    #[test]
    fn higher_class_always_wins() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new();
        let low = fx.thread(CpuMask::all());
        let high = fx.thread(CpuMask::all());
        rq.push(low.clone(), 3);
        rq.push(high.clone(), 0);
        assert_eq!(rq.pop_first(|_| true).unwrap().tid(), high.tid());
        assert_eq!(rq.pop_first(|_| true).unwrap().tid(), low.tid());
    }

    #[test]
    fn affinity_skips_ineligible_threads_without_reordering() {
        let fx = Fixture::new();
        let mut rq = RunQueue::new();
        let pinned = fx.thread(CpuMask::only(1));
        let free = fx.thread(CpuMask::all());
        rq.push(pinned.clone(), 1);
        rq.push(free.clone(), 1);
        let picked = rq.pop_first(|t| t.affinity().contains(0)).unwrap();
        assert_eq!(picked.tid(), free.tid());
        assert_eq!(rq.tids()[1], [pinned.tid()]);
        assert!(rq.contains(pinned.tid()));
        assert!(!rq.contains(free.tid()));
        assert_eq!(rq.len(), 1);
    }
}
