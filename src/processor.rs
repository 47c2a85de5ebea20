//! # 每核状态
//!
//! 每个逻辑 CPU 一个 [`PerCpuState`]，在 CPU 启动时创建，此后一直存活。
//! 它记录当前运行的线程、中断嵌套深度 `in_irq`、临界区嵌套深度
//! `in_critical`、空闲线程、延迟调用池以及调度器是否已在本核启动。
//!
//! ## 访问规则
//!
//! - 计数器只由所属 CPU 读写，不加锁
//! - `current` 只在持有调度锁时改写；所属 CPU 可以不加锁读取
//! - 通过 [`PerCpuState::current`] 取得的引用在任何可能发生上下文切换的
//!   调用之后都会失效（线程可能在别的 CPU 上恢复），必须重新读取
//!
//! ## 临界区
//!
//! ```text
//! enter_critical ─► in_critical += 1
//! leave_critical ─► in_critical == 1 且 in_irq == 0 ?
//!                     ├─ 是：执行延迟调用，归零，check_invoke_scheduler
//!                     └─ 否：in_critical -= 1
//! ```

use crate::arch::{self, ContextSwitchEngine, Engine, InterruptDisabler};
use crate::deferred::DeferredCallPool;
use crate::sched::Scheduler;
use crate::task::Thread;
use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use log::{error, trace};

/// 无当前线程时 `current_tid` 的取值
pub const NO_THREAD: usize = usize::MAX;

/// 每核统计
#[derive(Default)]
pub struct CpuStats {
    pub context_switches: AtomicU64,
    pub address_space_switches: AtomicU64,
    pub deferred_calls: AtomicU64,
}

pub struct PerCpuState {
    id: usize,
    scheduler: AtomicPtr<Scheduler>,
    in_critical: Cell<usize>,
    in_irq: Cell<usize>,
    invoke_scheduler_async: Cell<bool>,
    initialized: AtomicBool,
    current: UnsafeCell<Option<Arc<Thread>>>,
    current_tid: AtomicUsize,
    /// 刚被换出的线程，由换入一侧在切换完成后取走
    previous: UnsafeCell<Option<Arc<Thread>>>,
    idle: spin::Once<Arc<Thread>>,
    deferred: DeferredCallPool,
    stats: CpuStats,
}

// 计数器与 previous 只由所属 CPU 访问；current 的写入受调度锁保护。
unsafe impl Sync for PerCpuState {}
unsafe impl Send for PerCpuState {}

impl PerCpuState {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            scheduler: AtomicPtr::new(ptr::null_mut()),
            in_critical: Cell::new(0),
            in_irq: Cell::new(0),
            invoke_scheduler_async: Cell::new(false),
            initialized: AtomicBool::new(false),
            current: UnsafeCell::new(None),
            current_tid: AtomicUsize::new(NO_THREAD),
            previous: UnsafeCell::new(None),
            idle: spin::Once::new(),
            deferred: DeferredCallPool::new(),
            stats: CpuStats::default(),
        }
    }

    /// 当前 CPU 的每核状态
    ///
    /// 尚未执行 [`Scheduler::initialize`] 的 CPU 返回 `None`。
    #[inline]
    pub fn current() -> Option<&'static PerCpuState> {
        let ptr = arch::current_cpu_ptr();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// 当前 CPU 编号，未初始化时为 `None`
    pub fn current_id() -> Option<usize> {
        let _irq = InterruptDisabler::new();
        Self::current().map(|cpu| cpu.id)
    }

    /// 当前 CPU 上运行的线程 ID，用于日志
    pub fn current_thread_id() -> Option<usize> {
        let _irq = InterruptDisabler::new();
        Self::current()
            .map(|cpu| cpu.current_tid.load(Ordering::Relaxed))
            .filter(|tid| *tid != NO_THREAD)
    }

    pub(crate) fn attach(&'static self, sched: &'static Scheduler) {
        self.scheduler
            .store(sched as *const Scheduler as *mut Scheduler, Ordering::Release);
        arch::install_current_cpu(self);
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn scheduler(&self) -> Option<&'static Scheduler> {
        let ptr = self.scheduler.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn in_critical(&self) -> usize {
        self.in_critical.get()
    }

    pub fn in_irq(&self) -> usize {
        self.in_irq.get()
    }

    pub(crate) fn set_in_irq(&self, level: usize) {
        self.in_irq.set(level);
    }

    pub fn enter_critical(&self) {
        self.in_critical.set(self.in_critical.get() + 1);
    }

    /// 离开一层临界区
    ///
    /// 最外层且不在中断上下文时，先执行延迟调用，再检查是否有挂起的
    /// 调度请求；此处可能同步发生上下文切换。
    pub fn leave_critical(&self) {
        let _irq = InterruptDisabler::new();
        let depth = self.in_critical.get();
        if depth == 0 {
            self.fatal("leave_critical without matching enter_critical");
        }
        if depth == 1 {
            if self.in_irq.get() == 0 {
                self.execute_deferred();
                if self.in_critical.get() != 1 {
                    self.fatal("deferred call left critical section unbalanced");
                }
            }
            self.in_critical.set(0);
            if self.in_irq.get() == 0 {
                self.check_invoke_scheduler();
            }
        } else {
            self.in_critical.set(depth - 1);
        }
    }

    /// 离开一层临界区但不触发任何动作
    pub(crate) fn leave_critical_silently(&self) {
        let depth = self.in_critical.get();
        if depth == 0 {
            self.fatal("leave_critical without matching enter_critical");
        }
        self.in_critical.set(depth - 1);
    }

    pub(crate) fn restore_critical(&self, depth: usize) {
        self.in_critical.set(depth);
    }

    /// 请求在下一个安全点重新调度
    pub fn invoke_scheduler_async(&self) {
        self.invoke_scheduler_async.set(true);
    }

    pub fn reschedule_pending(&self) -> bool {
        self.invoke_scheduler_async.get()
    }

    /// 安全点：临界区与中断嵌套都已退到零
    pub(crate) fn check_invoke_scheduler(&self) {
        if self.in_irq.get() != 0 || self.in_critical.get() != 0 {
            self.fatal("check_invoke_scheduler outside a safe point");
        }
        if self.invoke_scheduler_async.get() && self.is_initialized() {
            self.invoke_scheduler_async.set(false);
            if let Some(sched) = self.scheduler() {
                // 之后不能再使用 self：可能已经在别的 CPU 上恢复
                sched.invoke_async();
            }
        }
    }

    pub fn deferred(&self) -> &DeferredCallPool {
        &self.deferred
    }

    pub(crate) fn execute_deferred(&self) {
        let executed = self.deferred.execute_pending();
        if executed > 0 {
            self.stats
                .deferred_calls
                .fetch_add(executed as u64, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &CpuStats {
        &self.stats
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        unsafe { (*self.current.get()).clone() }
    }

    pub(crate) fn set_current_thread(&self, thread: Arc<Thread>) {
        self.current_tid.store(thread.tid(), Ordering::Relaxed);
        unsafe { *self.current.get() = Some(thread) };
    }

    pub(crate) fn take_previous(&self) -> Option<Arc<Thread>> {
        unsafe { (*self.previous.get()).take() }
    }

    pub fn idle_thread(&self) -> Option<&Arc<Thread>> {
        self.idle.get()
    }

    /// 登记空闲线程，只能成功一次
    pub(crate) fn set_idle_thread(&self, thread: Arc<Thread>) -> bool {
        let mut installed = false;
        self.idle.call_once(|| {
            installed = true;
            thread
        });
        installed
    }

    /// 热切换到 `to`
    ///
    /// 调用者持有调度锁且该锁是唯一的临界区。`from` 的寄存器压入它自己的
    /// 内核栈，`to` 成为本核当前线程并恢复它换出时的临界区深度；两者的
    /// 地址空间不同时才切换地址空间（并刷新 TLB）。
    ///
    /// `from` 日后恢复时本函数返回，此时可能已在另一个 CPU 上。
    ///
    /// ## Safety
    ///
    /// `to` 必须处于换出状态（不是任何 CPU 的当前线程）。
    pub(crate) unsafe fn switch_context(&self, from: Arc<Thread>, to: Arc<Thread>) {
        if self.in_critical.get() != 1 {
            self.fatal("switch_context requires exactly one critical section");
        }
        if self.in_irq.get() != 0 {
            self.fatal("switch_context in interrupt context");
        }
        if arch::interrupts_enabled() {
            self.fatal("switch_context with interrupts enabled");
        }
        trace!("cpu {} switch {} -> {}", self.id, from.tid(), to.tid());

        let from_ctx = from.context_ptr();
        let to_ctx = to.context_ptr();
        let (from_regs, to_regs) = unsafe {
            (*from_ctx).saved_critical = self.in_critical.get();
            self.in_critical.set((*to_ctx).saved_critical);
            let to_space = (*to_ctx).address_space;
            if arch::active_address_space() != to_space {
                arch::activate_address_space(to_space);
                self.stats
                    .address_space_switches
                    .fetch_add(1, Ordering::Relaxed);
            }
            (
                &raw mut (*from_ctx).regs,
                &raw const (*to_ctx).regs,
            )
        };
        self.stats.context_switches.fetch_add(1, Ordering::Relaxed);

        unsafe { *self.previous.get() = Some(from) };
        self.set_current_thread(to);
        unsafe { Engine::switch_context(from_regs, to_regs) };
    }

    /// 输出诊断信息后停机
    pub fn fatal(&self, msg: &str) -> ! {
        let current = unsafe { (*self.current.get()).as_ref() };
        match current {
            Some(thread) => error!(
                "FATAL on cpu {}: {} (thread {} '{}' {:?}, in_critical={}, in_irq={})",
                self.id,
                msg,
                thread.tid(),
                thread.name(),
                thread.state(),
                self.in_critical.get(),
                self.in_irq.get()
            ),
            None => error!(
                "FATAL on cpu {}: {} (no current thread, in_critical={}, in_irq={})",
                self.id,
                msg,
                self.in_critical.get(),
                self.in_irq.get()
            ),
        }
        panic!("{}", msg);
    }
}

/// 在当前 CPU 上进入临界区
pub fn enter_critical() {
    let _irq = InterruptDisabler::new();
    if let Some(cpu) = PerCpuState::current() {
        cpu.enter_critical();
    }
}

/// 在当前 CPU 上离开临界区
pub fn leave_critical() {
    let _irq = InterruptDisabler::new();
    if let Some(cpu) = PerCpuState::current() {
        cpu.leave_critical();
    }
}

/// 作用域临界区
pub struct ScopedCritical {
    _private: (),
}

impl ScopedCritical {
    pub fn new() -> Self {
        enter_critical();
        Self { _private: () }
    }
}

impl Default for ScopedCritical {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedCritical {
    fn drop(&mut self) {
        leave_critical();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Spinlock;
    use crate::task::{
        CpuMask, Process, StackArena, ThreadContext, ThreadInner, ThreadState, TidAllocator,
        TidHandle,
    };
    use alloc::boxed::Box;
    use core::sync::atomic::AtomicUsize;

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn hit(_: usize) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn nested_critical_sections_balance() {
        let cpu = PerCpuState::new(0);
        for _ in 0..4 {
            cpu.enter_critical();
        }
        assert_eq!(cpu.in_critical(), 4);
        for _ in 0..4 {
            cpu.leave_critical();
        }
        assert_eq!(cpu.in_critical(), 0);
    }

    #[test]
    fn outermost_leave_drains_deferred_calls() {
        let cpu = PerCpuState::new(0);
        cpu.enter_critical();
        cpu.enter_critical();
        cpu.deferred().queue(hit, 0).unwrap();
        cpu.leave_critical();
        assert_eq!(cpu.deferred().len(), 1);
        cpu.leave_critical();
        assert!(cpu.deferred().is_empty());
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn leave_in_irq_context_keeps_deferred_calls_queued() {
        let cpu = PerCpuState::new(0);
        cpu.set_in_irq(1);
        cpu.enter_critical();
        cpu.deferred().queue_boxed(|| {}).unwrap();
        cpu.leave_critical();
        assert_eq!(cpu.in_critical(), 0);
        assert_eq!(cpu.deferred().len(), 1);
    }

    #[test]
    fn async_reschedule_flag_waits_for_initialization() {
        let cpu = PerCpuState::new(0);
        cpu.invoke_scheduler_async();
        cpu.enter_critical();
        cpu.leave_critical();
        // 调度器未在本核启动，请求保持挂起
        assert!(cpu.reschedule_pending());
    }

    #[test]
    #[should_panic(expected = "leave_critical without matching enter_critical")]
    fn unbalanced_leave_is_fatal() {
        let cpu = PerCpuState::new(0);
        cpu.leave_critical();
    }

    /// 两个从未运行过的线程，作为切换的两端
    fn switch_pair() -> (Arc<Thread>, Arc<Thread>) {
        let tids: &'static Spinlock<TidAllocator> =
            Box::leak(Box::new(Spinlock::new(TidAllocator::new(2))));
        let stacks: &'static StackArena = Box::leak(Box::new(StackArena::new(2)));
        let process = Arc::new(Process::new(0, "switch", 0));
        let make = || {
            let tid = TidHandle::alloc(tids).unwrap();
            let stack = stacks.stack(tid.get());
            let inner = ThreadInner {
                state: ThreadState::Runnable,
                priority: 0,
                affinity: CpuMask::all(),
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
                &process,
                stack,
                inner,
                ThreadContext::kernel(0, 0, 0, 0),
            ))
        };
        (make(), make())
    }

    #[test]
    #[should_panic(expected = "switch_context requires exactly one critical section")]
    fn switch_outside_the_scheduler_lock_is_fatal() {
        let cpu = PerCpuState::new(0);
        let (from, to) = switch_pair();
        arch::disable_interrupts();
        unsafe { cpu.switch_context(from, to) };
    }

    #[test]
    #[should_panic(expected = "switch_context requires exactly one critical section")]
    fn switch_inside_a_nested_critical_section_is_fatal() {
        let cpu = PerCpuState::new(0);
        let (from, to) = switch_pair();
        arch::disable_interrupts();
        cpu.enter_critical();
        cpu.enter_critical();
        unsafe { cpu.switch_context(from, to) };
    }

    #[test]
    #[should_panic(expected = "switch_context in interrupt context")]
    fn switch_in_interrupt_context_is_fatal() {
        let cpu = PerCpuState::new(0);
        let (from, to) = switch_pair();
        arch::disable_interrupts();
        cpu.enter_critical();
        cpu.set_in_irq(1);
        unsafe { cpu.switch_context(from, to) };
    }

    #[test]
    #[should_panic(expected = "switch_context with interrupts enabled")]
    fn switch_with_interrupts_enabled_is_fatal() {
        let cpu = PerCpuState::new(0);
        let (from, to) = switch_pair();
        cpu.enter_critical();
        arch::enable_interrupts();
        unsafe { cpu.switch_context(from, to) };
    }
}
