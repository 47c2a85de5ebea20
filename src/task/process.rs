//! # 进程
//!
//! 调度核心只需要进程的最小模型：标识、名字、地址空间令牌以及它强引用
//! 持有的线程列表。内核进程在调度器创建时建立，持有所有空闲线程和内核
//! 线程。线程列表在回收路径上（关中断、持有调度锁）被修改，因此使用
//! 关中断自旋锁。

use super::thread::Thread;
use crate::sync::Spinlock;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub struct Process {
    pid: usize,
    name: String,
    address_space: usize,
    threads: Spinlock<Vec<Arc<Thread>>>,
}

impl Process {
    pub fn new(pid: usize, name: &str, address_space: usize) -> Self {
        Self {
            pid,
            name: String::from(name),
            address_space,
            threads: Spinlock::new(Vec::new()),
        }
    }

    pub fn getpid(&self) -> usize {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_space(&self) -> usize {
        self.address_space
    }

    pub(crate) fn add_thread(&self, thread: Arc<Thread>) {
        self.threads.lock().push(thread);
    }

    /// 移除并返回线程的强引用
    pub(crate) fn remove_thread(&self, tid: usize) -> Option<Arc<Thread>> {
        let mut threads = self.threads.lock();
        let index = threads.iter().position(|t| t.tid() == tid)?;
        Some(threads.swap_remove(index))
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}
