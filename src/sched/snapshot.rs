//! # 调度状态快照
//!
//! 在调度锁内一次性采集各 CPU 的当前线程、运行队列、睡眠列表、阻塞
//! 线程所在的等待队列以及全部存活线程的状态，用于诊断与一致性检查。

use super::Scheduler;
use crate::sync::WaitQueue;
use crate::task::{BlockReason, ThreadState};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

#[derive(Clone, Debug)]
pub struct ThreadInfo {
    pub tid: usize,
    pub name: String,
    pub state: ThreadState,
    pub priority: usize,
    pub idle: bool,
    /// 最近一次运行所在的 CPU
    pub cpu: Option<usize>,
    pub block_reason: Option<BlockReason>,
}

#[derive(Clone, Debug)]
pub struct SchedSnapshot {
    pub ticks: u64,
    /// 每个 CPU 的当前线程
    pub running: Vec<Option<usize>>,
    /// 各优先级队列中的线程，按出队顺序
    pub run_queue: Vec<Vec<usize>>,
    /// 睡眠线程，按截止时间排序
    pub sleeping: Vec<usize>,
    /// 阻塞线程所在的等待队列：(队列地址, 按等待顺序排列的线程)
    pub waiting: Vec<(usize, Vec<usize>)>,
    pub threads: Vec<ThreadInfo>,
}

impl SchedSnapshot {
    pub fn thread(&self, tid: usize) -> Option<&ThreadInfo> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    /// 检查线程状态与所在位置是否一致
    ///
    /// - 一个线程至多是一个 CPU 的当前线程
    /// - `Running` 的线程恰好是一个 CPU 的当前线程且不在运行队列中
    /// - `Runnable` 的普通线程恰好在运行队列中出现一次；空闲线程从不入队
    /// - `Blocked` 的线程既不运行也不在运行队列中，并且恰好在它的阻塞
    ///   原因所指的一个阻塞列表（睡眠列表或等待队列）中出现一次
    /// - 非阻塞线程不在任何阻塞列表中
    /// - 安全点上不存在 `Dying` 的线程
    pub fn check_invariants(&self) -> Result<(), String> {
        for (cpu, tid) in self.running.iter().enumerate() {
            let Some(tid) = tid else {
                continue;
            };
            if self.thread(*tid).is_none() {
                return Err(format!("cpu {} runs unknown thread {}", cpu, tid));
            }
        }
        for tid in self.run_queue.iter().flatten() {
            if self.thread(*tid).is_none() {
                return Err(format!("run queue holds unknown thread {}", tid));
            }
        }
        let blocked_lists = self
            .sleeping
            .iter()
            .chain(self.waiting.iter().flat_map(|(_, tids)| tids.iter()));
        for tid in blocked_lists {
            if self.thread(*tid).is_none() {
                return Err(format!("block list holds unknown thread {}", tid));
            }
        }
        for info in &self.threads {
            let running = self
                .running
                .iter()
                .filter(|t| **t == Some(info.tid))
                .count();
            let queued = self
                .run_queue
                .iter()
                .flatten()
                .filter(|t| **t == info.tid)
                .count();
            let ok = match info.state {
                ThreadState::Running => running == 1 && queued == 0,
                ThreadState::Runnable if info.idle => running == 0 && queued == 0,
                ThreadState::Runnable => running == 0 && queued == 1,
                ThreadState::Blocked => running == 0 && queued == 0,
                ThreadState::Dying | ThreadState::Dead => false,
            };
            if !ok {
                return Err(format!(
                    "thread {} '{}' is {:?} but runs on {} cpus and is queued {} times",
                    info.tid, info.name, info.state, running, queued
                ));
            }
            self.check_block_lists(info)?;
        }
        Ok(())
    }

    fn check_block_lists(&self, info: &ThreadInfo) -> Result<(), String> {
        let sleeping = self.sleeping.iter().filter(|t| **t == info.tid).count();
        let waiting: Vec<usize> = self
            .waiting
            .iter()
            .filter(|(_, tids)| tids.contains(&info.tid))
            .map(|(queue, _)| *queue)
            .collect();
        let waiting_times: usize = self
            .waiting
            .iter()
            .map(|(_, tids)| tids.iter().filter(|t| **t == info.tid).count())
            .sum();
        let ok = match (info.state, info.block_reason) {
            (ThreadState::Blocked, Some(BlockReason::Sleep { .. })) => {
                sleeping == 1 && waiting_times == 0
            }
            (ThreadState::Blocked, Some(BlockReason::Wait { queue })) => {
                sleeping == 0 && waiting_times == 1 && waiting == [queue]
            }
            (ThreadState::Blocked, None) => false,
            (_, Some(_)) => false,
            (_, None) => sleeping == 0 && waiting_times == 0,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "thread {} '{}' is {:?} ({:?}) but sleeps {} times and waits {} times",
                info.tid, info.name, info.state, info.block_reason, sleeping, waiting_times
            ))
        }
    }
}

impl Scheduler {
    /// 采集调度状态快照
    pub fn snapshot(&self) -> SchedSnapshot {
        let state = self.state.lock();
        let threads = state
            .registry
            .values()
            .filter_map(|weak| weak.upgrade())
            .map(|thread| {
                let inner = thread.inner_exclusive_access();
                ThreadInfo {
                    tid: thread.tid(),
                    name: String::from(thread.name()),
                    state: inner.state,
                    priority: inner.priority,
                    idle: thread.is_idle(),
                    cpu: inner.cpu,
                    block_reason: inner.block_reason,
                }
            })
            .collect::<Vec<_>>();
        let mut queues: Vec<usize> = threads
            .iter()
            .filter_map(|info| match info.block_reason {
                Some(BlockReason::Wait { queue }) => Some(queue),
                _ => None,
            })
            .collect();
        queues.sort_unstable();
        queues.dedup();
        let waiting = queues
            .into_iter()
            .map(|queue| {
                // 阻塞原因在调度锁内设置与清除，等待方的调用帧一直借用着该队列
                let queue_ref = unsafe { &*(queue as *const WaitQueue) };
                let tids = queue_ref.waiters().lock().iter().map(|t| t.tid()).collect();
                (queue, tids)
            })
            .collect();
        SchedSnapshot {
            ticks: self.ticks(),
            running: self
                .cpus
                .iter()
                .map(|cpu| {
                    if cpu.is_initialized() {
                        cpu.current_thread().map(|t| t.tid())
                    } else {
                        None
                    }
                })
                .collect(),
            run_queue: state.run_queue.tids(),
            sleeping: state.sleepers.keys().map(|(_, tid)| *tid).collect(),
            waiting,
            threads,
        }
    }
}
