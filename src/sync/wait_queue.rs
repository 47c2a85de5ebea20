//! # 等待队列
//!
//! 建立在调度器阻塞/唤醒原语之上的阻塞列表。条件检查、入队和切换都
//! 在调度锁内完成，唤醒方先改变条件再调用 `wake_*`，因此不会丢失唤醒。

use super::Spinlock;
use crate::sched::Scheduler;
use crate::task::Thread;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

pub struct WaitQueue {
    waiters: Spinlock<VecDeque<Arc<Thread>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Spinlock::new(VecDeque::new()),
        }
    }

    /// 在 `cond` 为真期间阻塞当前线程
    ///
    /// 每次被唤醒后重新检查条件。`cond` 在调度锁内求值，不能阻塞，
    /// 也不能再获取调度锁。
    ///
    /// ## Panics
    ///
    /// 在临界区或中断上下文中调用时 panic
    pub fn wait_while<F>(&self, mut cond: F)
    where
        F: FnMut() -> bool,
    {
        loop {
            let Some(sched) = Scheduler::current() else {
                panic!("wait_while called before the scheduler was initialized");
            };
            if !sched.block_on(self, &mut cond) {
                return;
            }
        }
    }

    /// 阻塞当前线程直到被唤醒
    ///
    /// 也可能被 [`Scheduler::unblock`] 直接唤醒。
    pub fn wait(&self) {
        let Some(sched) = Scheduler::current() else {
            panic!("wait called before the scheduler was initialized");
        };
        let mut first = true;
        sched.block_on(self, &mut || core::mem::replace(&mut first, false));
    }

    /// 唤醒最早等待的一个线程
    ///
    /// 不在任何 CPU 上时不做任何事；此时应使用 [`Scheduler::wake_one`]。
    ///
    /// ## Returns
    ///
    /// 是否有线程被唤醒
    pub fn wake_one(&self) -> bool {
        match Scheduler::current() {
            Some(sched) => sched.wake_one(self),
            None => false,
        }
    }

    /// 唤醒所有等待者，返回被唤醒的数量
    pub fn wake_all(&self) -> usize {
        match Scheduler::current() {
            Some(sched) => sched.wake_all(self),
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    pub(crate) fn waiters(&self) -> &Spinlock<VecDeque<Arc<Thread>>> {
        &self.waiters
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
