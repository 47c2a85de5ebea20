//! # 睡眠
//!
//! 睡眠线程按截止时钟周期登记在调度状态中。时钟中断只比较
//! `next_deadline`，到期时排入一个延迟调用，真正的唤醒在陷入返回路径
//! 上、中断嵌套退到零之后执行。

use super::{SchedState, Scheduler};
use crate::arch::InterruptDisabler;
use crate::task::{BlockReason, ThreadState};
use core::sync::atomic::Ordering;
use log::trace;

impl Scheduler {
    /// 全局时钟周期计数
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// 睡眠 `ticks` 个时钟周期
    pub fn sleep_ticks(&'static self, ticks: u64) {
        self.sleep_until(self.ticks().saturating_add(ticks));
    }

    /// 睡眠到全局时钟达到 `deadline`，已经过期时立即返回
    ///
    /// ## Panics
    ///
    /// 在临界区、中断上下文或空闲线程中调用时停机
    pub fn sleep_until(&'static self, deadline: u64) {
        let _irq = InterruptDisabler::new();
        self.check_may_block();
        let mut state = self.state.lock();
        if deadline <= self.ticks() {
            return;
        }
        let cpu = self.this_cpu();
        let current = self.blockable_current(cpu);
        {
            let mut inner = current.inner_exclusive_access();
            inner.state = ThreadState::Blocked;
            inner.block_reason = Some(BlockReason::Sleep { deadline });
        }
        state.sleepers.insert((deadline, current.tid()), current.clone());
        self.update_next_deadline(&state);
        trace!("thread {} sleeps until tick {}", current.tid(), deadline);
        self.switch_away(&mut state, cpu, current);
    }

    /// 唤醒所有已到期的睡眠线程
    pub(crate) fn wake_sleepers(&'static self) -> usize {
        let mut state = self.state.lock();
        let now = self.ticks();
        let mut woken = 0;
        while state
            .sleepers
            .first_key_value()
            .is_some_and(|(&(deadline, _), _)| deadline <= now)
        {
            let Some((_, thread)) = state.sleepers.pop_first() else {
                break;
            };
            if self.unblock_locked(&mut state, &thread) {
                woken += 1;
            }
        }
        self.update_next_deadline(&state);
        woken
    }

    pub(super) fn update_next_deadline(&self, state: &SchedState) {
        let next = state
            .sleepers
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
            .unwrap_or(u64::MAX);
        self.next_deadline.store(next, Ordering::SeqCst);
    }
}

/// 时钟中断排入的延迟调用，`arg` 为调度器地址
pub(super) fn wake_sleepers_deferred(arg: usize) {
    let sched = unsafe { &*(arg as *const Scheduler) };
    sched.wake_sleepers();
}
