//! # 关中断自旋锁
//!
//! 持锁期间关闭本地中断，并把持锁区间计入当前 CPU 的临界区深度。
//! 释放时先放锁，再离开临界区（可能在此处触发延迟的调度），最后恢复
//! 加锁前的中断状态。
//!
//! 调度锁会跨越上下文切换：换出线程栈上的守卫保持存活，锁由换入一侧
//! 释放；换出线程日后恢复时，它的守卫析构会释放那时持有的锁。

use crate::arch::InterruptDisabler;
use crate::processor::PerCpuState;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    critical: bool,
    _irq: InterruptDisabler,
}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// 加锁
    ///
    /// 先关中断并进入临界区，再自旋等待锁。
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let irq = InterruptDisabler::new();
        let critical = match PerCpuState::current() {
            Some(cpu) => {
                cpu.enter_critical();
                true
            }
            None => false,
        };
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinlockGuard {
            lock: self,
            critical,
            _irq: irq,
        }
    }

    /// 尝试加锁，失败时恢复临界区深度与中断状态
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let irq = InterruptDisabler::new();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let critical = match PerCpuState::current() {
            Some(cpu) => {
                cpu.enter_critical();
                true
            }
            None => false,
        };
        Some(SpinlockGuard {
            lock: self,
            critical,
            _irq: irq,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// 释放一个没有守卫的锁
    ///
    /// ## Safety
    ///
    /// 只用于锁的所有权跨越上下文切换交接的场合：加锁一方的守卫已被
    /// `forget`，或留在一个不会再恢复的线程栈上。
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// 不加锁访问数据
    ///
    /// ## Safety
    ///
    /// 调用者必须已经以交接的方式持有该锁。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        // 守卫可能在另一个 CPU 上析构，重新读取当前 CPU
        if self.critical {
            if let Some(cpu) = PerCpuState::current() {
                cpu.leave_critical();
            }
        }
    }
}
