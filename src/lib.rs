//! # nimloth-sched
//!
//! NimlothOS 的抢占式多核内核线程调度器与上下文切换核心。
//!
//! ## 模块
//!
//! - [`arch`]：上下文切换引擎与寄存器布局（riscv64 内核 / x86_64 宿主）
//! - [`processor`]：每核状态、临界区与延迟调度请求
//! - [`deferred`]：每核延迟调用池
//! - [`trap`]：陷入帧链与统一的陷入返回路径
//! - [`sched`]：运行队列、状态迁移、切换、睡眠与诊断快照
//! - [`task`]：线程、进程、线程 ID 与内核栈
//! - [`sync`]：关中断自旋锁与等待队列
//!
//! ## 启动顺序
//!
//! ```text
//! Scheduler::new(config)
//!     └─► 每个 CPU: initialize(cpu_id) ─► start()  (不返回)
//! ```

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
pub mod console;

pub mod arch;
pub mod config;
pub mod deferred;
pub mod error;
pub mod idle;
pub mod logging;
pub mod processor;
pub mod sched;
pub mod sync;
pub mod task;
pub mod trap;

pub use config::{SchedulerConfig, StackOffset};
pub use error::{SchedError, SchedResult};
pub use processor::{PerCpuState, ScopedCritical};
pub use sched::{SchedSnapshot, Scheduler, ThreadInfo, ThreadOptions};
pub use sync::{Spinlock, WaitQueue};
pub use task::{CpuMask, Process, Thread, ThreadState};
