//! # 同步原语
//!
//! - [`Spinlock`]：关中断并计入临界区的自旋锁，调度锁与线程状态锁都基于它
//! - [`WaitQueue`]：阻塞式等待队列

mod spinlock;
mod wait_queue;

pub use spinlock::{Spinlock, SpinlockGuard};
pub use wait_queue::WaitQueue;
