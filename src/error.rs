//! # 调度器错误类型
//!
//! 只有初始化与资源分配类操作会返回错误；核心调度操作（切换、阻塞、
//! 唤醒、让出）不返回错误，违反不变量时直接 panic。

use core::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedError {
    /// 线程 ID（以及对应的内核栈槽位）已耗尽
    ThreadLimit,
    /// 优先级超出队列范围
    InvalidPriority(usize),
    /// CPU 编号超出配置范围
    InvalidCpu(usize),
    /// 亲和性掩码不包含任何已配置的 CPU
    EmptyAffinity,
    /// 该 CPU 已经登记过空闲线程
    IdleThreadExists(usize),
    /// 线程不能充当该 CPU 的空闲线程
    NotIdleThread(usize),
    /// 延迟调用池已满
    DeferredPoolFull,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::ThreadLimit => write!(f, "thread limit reached"),
            SchedError::InvalidPriority(p) => write!(f, "invalid priority class {}", p),
            SchedError::InvalidCpu(cpu) => write!(f, "invalid cpu id {}", cpu),
            SchedError::EmptyAffinity => write!(f, "affinity mask selects no cpu"),
            SchedError::IdleThreadExists(cpu) => {
                write!(f, "cpu {} already has an idle thread", cpu)
            }
            SchedError::NotIdleThread(tid) => {
                write!(f, "thread {} cannot serve as an idle thread", tid)
            }
            SchedError::DeferredPoolFull => write!(f, "deferred call pool is full"),
        }
    }
}

pub type SchedResult<T> = Result<T, SchedError>;
