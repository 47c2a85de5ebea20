//! # 调度器
//!
//! 全局调度锁保护运行队列、线程注册表、睡眠列表以及所有线程状态迁移；
//! 上下文切换总是在持有该锁时发起，锁由换入一侧释放。
//!
//! ## 调度流程
//!
//! ```text
//! timer tick ──► time slice 用完 ──► invoke_scheduler_async
//!                                          │
//! yield_now ─────────────┐                 ▼ exit_trap / leave_critical
//!                        ▼
//!                   pick_next ──► 当前线程回到队尾 ──► 选出下一个线程
//!                                                        │
//!                                     同一线程 ◄──────────┤
//!                                                        ▼
//!                                                 context_switch
//! ```
//!
//! ## 策略
//!
//! 静态优先级，数值越小越优先；同一优先级内严格 FIFO。没有可运行线程时
//! 选择本核的空闲线程。见 [`run_queue`]。

mod run_queue;
mod sleep;
mod snapshot;
mod switch;

pub use run_queue::RunQueue;
pub use snapshot::{SchedSnapshot, ThreadInfo};

use crate::arch::{self, InterruptDisabler, RegisterState, TrapRegisters};
use crate::config::{
    MAX_CPUS, MAX_THREADS, PRIORITY_CLASSES, STACK_OFFSET_LIMIT, SchedulerConfig, StackOffset,
};
use crate::error::{SchedError, SchedResult};
use crate::idle::idle_entry;
use crate::processor::PerCpuState;
use crate::sync::{Spinlock, WaitQueue};
use crate::task::{
    BlockReason, CpuMask, Process, StackArena, Thread, ThreadContext, ThreadInner, ThreadState,
    TidAllocator, TidHandle,
};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use log::{debug, error, info, trace};

/// 受调度锁保护的状态
pub(crate) struct SchedState {
    run_queue: RunQueue,
    registry: BTreeMap<usize, Weak<Thread>>,
    /// 按 (截止时钟周期, tid) 排序的睡眠线程
    sleepers: BTreeMap<(u64, usize), Arc<Thread>>,
}

/// 创建线程的选项
#[derive(Clone)]
pub struct ThreadOptions {
    pub priority: usize,
    pub affinity: CpuMask,
    /// 所属进程，缺省为内核进程
    pub process: Option<Arc<Process>>,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            priority: crate::config::DEFAULT_PRIORITY,
            affinity: CpuMask::all(),
            process: None,
        }
    }
}

impl ThreadOptions {
    pub fn with_priority(priority: usize) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn affinity(mut self, affinity: CpuMask) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn process(mut self, process: Arc<Process>) -> Self {
        self.process = Some(process);
        self
    }
}

type ThreadBody = Box<dyn FnOnce() -> i32 + Send>;

pub struct Scheduler {
    config: SchedulerConfig,
    state: Spinlock<SchedState>,
    cpus: Box<[PerCpuState]>,
    tids: Spinlock<TidAllocator>,
    stacks: StackArena,
    kernel_process: Arc<Process>,
    /// 单调时钟周期计数，由 0 号 CPU 的时钟中断推进
    ticks: AtomicU64,
    /// 最早的睡眠截止时间，无睡眠线程时为 `u64::MAX`
    next_deadline: AtomicU64,
    /// 运行队列长度的无锁副本，供中断上下文查询
    runnable: AtomicUsize,
    rng: AtomicU64,
    next_pid: AtomicUsize,
    halted: AtomicBool,
}

impl Scheduler {
    /// 创建调度器
    ///
    /// 调度器在系统运行期间一直存活，因此直接返回 `'static` 引用。
    ///
    /// ## Arguments
    ///
    /// * `config` - 运行期配置
    ///
    /// ## Returns
    ///
    /// CPU 数量或线程上限超出编译期上限时返回错误
    pub fn new(config: SchedulerConfig) -> SchedResult<&'static Scheduler> {
        if config.cpu_count == 0 || config.cpu_count > MAX_CPUS {
            return Err(SchedError::InvalidCpu(config.cpu_count));
        }
        if config.max_threads == 0 || config.max_threads > MAX_THREADS {
            return Err(SchedError::ThreadLimit);
        }
        let cpus: Vec<PerCpuState> = (0..config.cpu_count).map(PerCpuState::new).collect();
        let sched = Box::leak(Box::new(Scheduler {
            config,
            state: Spinlock::new(SchedState {
                run_queue: RunQueue::new(),
                registry: BTreeMap::new(),
                sleepers: BTreeMap::new(),
            }),
            cpus: cpus.into_boxed_slice(),
            tids: Spinlock::new(TidAllocator::new(config.max_threads)),
            stacks: StackArena::new(config.max_threads),
            kernel_process: Arc::new(Process::new(0, "kernel", 0)),
            ticks: AtomicU64::new(0),
            next_deadline: AtomicU64::new(u64::MAX),
            runnable: AtomicUsize::new(0),
            rng: AtomicU64::new(arch::timestamp() | 1),
            next_pid: AtomicUsize::new(1),
            halted: AtomicBool::new(false),
        }));
        info!(
            "scheduler created: {} cpus, {} thread slots",
            config.cpu_count, config.max_threads
        );
        Ok(sched)
    }

    /// 当前 CPU 所属的调度器
    pub fn current() -> Option<&'static Scheduler> {
        let _irq = InterruptDisabler::new();
        PerCpuState::current().and_then(|cpu| cpu.scheduler())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, id: usize) -> Option<&PerCpuState> {
        self.cpus.get(id)
    }

    pub fn kernel_process(&self) -> &Arc<Process> {
        &self.kernel_process
    }

    /// 创建一个使用 `address_space` 地址空间的进程
    pub fn create_process(&self, name: &str, address_space: usize) -> Arc<Process> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        Arc::new(Process::new(pid, name, address_space))
    }

    /// 在当前 CPU 上初始化调度
    ///
    /// 安装每核状态指针；本核还没有登记空闲线程时创建一个运行
    /// [`idle_loop`](crate::idle::idle_loop) 的默认空闲线程。每个 CPU 启动时
    /// 调用一次，之后才能调用 [`Scheduler::start`]。
    pub fn initialize(&'static self, cpu_id: usize) -> SchedResult<()> {
        let cpu = self.cpus.get(cpu_id).ok_or(SchedError::InvalidCpu(cpu_id))?;
        cpu.attach(self);
        if cpu.idle_thread().is_none() {
            let idle = self.create_idle_thread(
                cpu_id,
                idle_entry,
                self as *const Scheduler as usize,
            )?;
            self.set_idle_thread(cpu_id, idle)?;
        }
        info!("cpu {} initialized", cpu_id);
        Ok(())
    }

    /// 为 `cpu_id` 创建一个空闲线程，但不登记
    ///
    /// 线程固定在该 CPU 上、优先级最低，且不进入运行队列。`entry` 不能
    /// 返回、阻塞或退出；通常在做完本核的准备工作后调用
    /// [`idle_loop`](crate::idle::idle_loop)。
    pub fn create_idle_thread(
        &'static self,
        cpu_id: usize,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> SchedResult<Arc<Thread>> {
        if cpu_id >= self.cpus.len() {
            return Err(SchedError::InvalidCpu(cpu_id));
        }
        let options = ThreadOptions {
            priority: PRIORITY_CLASSES - 1,
            affinity: CpuMask::only(cpu_id),
            process: None,
        };
        self.build_thread("idle", options, entry_registers(entry as usize, arg), true)
    }

    /// 登记 `cpu_id` 的空闲线程
    ///
    /// 空闲线程从不进入运行队列，也从不阻塞或退出。
    ///
    /// ## Returns
    ///
    /// `thread` 不是由 [`Scheduler::create_idle_thread`] 为该 CPU 创建的，
    /// 或者已经进入过运行队列时返回 [`SchedError::NotIdleThread`]
    pub fn set_idle_thread(&self, cpu_id: usize, thread: Arc<Thread>) -> SchedResult<()> {
        let cpu = self.cpus.get(cpu_id).ok_or(SchedError::InvalidCpu(cpu_id))?;
        let tid = thread.tid();
        let mut state = self.state.lock();
        if !thread.is_idle()
            || thread.affinity() != CpuMask::only(cpu_id)
            || state.run_queue.contains(tid)
        {
            return Err(SchedError::NotIdleThread(tid));
        }
        let weak = Arc::downgrade(&thread);
        if !cpu.set_idle_thread(thread) {
            return Err(SchedError::IdleThreadExists(cpu_id));
        }
        state.registry.insert(tid, weak);
        debug!("cpu {} idle thread is {}", cpu_id, tid);
        Ok(())
    }

    /// 创建一个执行闭包的内核线程
    ///
    /// 闭包的返回值作为线程退出码。
    pub fn spawn<F>(&'static self, name: &str, options: ThreadOptions, f: F) -> SchedResult<Arc<Thread>>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let body: ThreadBody = Box::new(f);
        let arg = Box::into_raw(Box::new(body)) as usize;
        self.create_thread(name, options, spawn_entry, arg)
            .inspect_err(|_| drop(unsafe { Box::from_raw(arg as *mut ThreadBody) }))
    }

    /// 创建一个从 `entry(arg)` 开始执行的内核线程
    ///
    /// `entry` 返回后线程以退出码 0 结束。
    pub fn create_thread(
        &'static self,
        name: &str,
        options: ThreadOptions,
        entry: extern "C" fn(usize),
        arg: usize,
    ) -> SchedResult<Arc<Thread>> {
        self.create_thread_from_registers(name, options, entry_registers(entry as usize, arg))
    }

    /// 以给定的寄存器映像创建线程
    ///
    /// 映像中返回地址非零时保持不变（例如复制自已有线程的映像），否则设为
    /// 线程退出跳板；栈指针为零时指向初始帧下方。
    pub fn create_thread_from_registers(
        &'static self,
        name: &str,
        options: ThreadOptions,
        regs: RegisterState,
    ) -> SchedResult<Arc<Thread>> {
        let thread = self.build_thread(name, options, regs, false)?;
        let mut state = self.state.lock();
        state.registry.insert(thread.tid(), Arc::downgrade(&thread));
        let priority = thread.priority();
        state.run_queue.push(thread.clone(), priority);
        self.sync_runnable(&state);
        self.maybe_preempt(priority);
        Ok(thread)
    }

    fn build_thread(
        &'static self,
        name: &str,
        options: ThreadOptions,
        regs: RegisterState,
        idle: bool,
    ) -> SchedResult<Arc<Thread>> {
        if options.priority >= PRIORITY_CLASSES {
            return Err(SchedError::InvalidPriority(options.priority));
        }
        let affinity = options.affinity.within(self.cpus.len());
        if affinity.is_empty() {
            return Err(SchedError::EmptyAffinity);
        }
        let process = options
            .process
            .unwrap_or_else(|| self.kernel_process.clone());
        let tid = TidHandle::alloc(&self.tids)?;
        let kstack = self.stacks.stack(tid.get());
        let mut context = ThreadContext::kernel(0, 0, process.address_space(), self.stack_offset());
        context.entry = regs;
        let inner = ThreadInner {
            state: ThreadState::Runnable,
            priority: options.priority,
            affinity,
            cpu: None,
            time_slice: self.config.time_slice(options.priority),
            exit_code: None,
            block_reason: None,
            first_dispatches: 0,
            dispatches: 0,
        };
        let thread = Arc::new(Thread::new(tid, name, idle, &process, kstack, inner, context));
        unsafe { self.init_context(&thread, false) };
        process.add_thread(thread.clone());
        debug!(
            "created thread {} '{}' (priority {}, pid {})",
            thread.tid(),
            name,
            options.priority,
            process.getpid()
        );
        Ok(thread)
    }

    /// 按 tid 查找存活线程
    pub fn thread(&self, tid: usize) -> Option<Arc<Thread>> {
        self.state.lock().registry.get(&tid).and_then(Weak::upgrade)
    }

    /// 让出 CPU
    ///
    /// 在临界区或中断上下文中只记录一个调度请求，等到安全点再执行。
    pub fn yield_now(&'static self) {
        let _irq = InterruptDisabler::new();
        let Some(cpu) = PerCpuState::current() else {
            return;
        };
        if cpu.in_irq() > 0 || cpu.in_critical() > 0 {
            cpu.invoke_scheduler_async();
            return;
        }
        if !cpu.is_initialized() {
            return;
        }
        self.pick_next();
    }

    /// 执行挂起的调度请求；由 `check_invoke_scheduler` 在安全点调用
    pub(crate) fn invoke_async(&'static self) {
        self.pick_next();
    }

    /// 当前线程回到队尾并选出下一个线程
    ///
    /// ## Returns
    ///
    /// 是否发生了上下文切换
    fn pick_next(&'static self) -> bool {
        let mut state = self.state.lock();
        let cpu = self.this_cpu();
        let Some(current) = cpu.current_thread() else {
            cpu.fatal("pick_next without a current thread");
        };
        if !current.is_idle() {
            let mut inner = current.inner_exclusive_access();
            if inner.state == ThreadState::Running {
                inner.state = ThreadState::Runnable;
                let priority = inner.priority;
                drop(inner);
                state.run_queue.push(current.clone(), priority);
            }
        }
        let next = self.select_next(&mut state, cpu);
        if Arc::ptr_eq(&next, &current) {
            let mut inner = current.inner_exclusive_access();
            inner.state = ThreadState::Running;
            inner.time_slice = self.config.time_slice(inner.priority);
            return false;
        }
        self.context_switch(&mut state, cpu, current, next);
        true
    }

    /// 从运行队列取出下一个允许在 `cpu` 上运行的线程，没有则取空闲线程
    fn select_next(&self, state: &mut SchedState, cpu: &PerCpuState) -> Arc<Thread> {
        let id = cpu.id();
        let next = state.run_queue.pop_first(|t| t.affinity().contains(id));
        self.sync_runnable(state);
        match next {
            Some(thread) => thread,
            None => match cpu.idle_thread() {
                Some(idle) => idle.clone(),
                None => self.fatal_locked(state, cpu, "no runnable thread and no idle thread"),
            },
        }
    }

    /// 阻塞当前线程直到 `cond` 不成立
    ///
    /// ## Returns
    ///
    /// `cond` 已经不成立时返回 `false`，否则阻塞并在被唤醒后返回 `true`
    pub(crate) fn block_on(&'static self, queue: &WaitQueue, cond: &mut dyn FnMut() -> bool) -> bool {
        let _irq = InterruptDisabler::new();
        self.check_may_block();
        let mut state = self.state.lock();
        if !cond() {
            return false;
        }
        let cpu = self.this_cpu();
        let current = self.blockable_current(cpu);
        {
            let mut inner = current.inner_exclusive_access();
            inner.state = ThreadState::Blocked;
            inner.block_reason = Some(BlockReason::Wait {
                queue: queue as *const WaitQueue as usize,
            });
        }
        queue.waiters().lock().push_back(current.clone());
        trace!("thread {} blocked", current.tid());
        self.switch_away(&mut state, cpu, current);
        true
    }

    /// 唤醒等待队列上最多 `max` 个线程
    pub(crate) fn wake_waiters(&'static self, queue: &WaitQueue, max: usize) -> usize {
        let mut state = self.state.lock();
        self.wake_locked(&mut state, queue, max)
    }

    /// 唤醒 `queue` 上最早等待的线程
    pub fn wake_one(&'static self, queue: &WaitQueue) -> bool {
        self.wake_waiters(queue, 1) == 1
    }

    /// 唤醒 `queue` 上的所有线程，返回被唤醒的数量
    pub fn wake_all(&'static self, queue: &WaitQueue) -> usize {
        self.wake_waiters(queue, usize::MAX)
    }

    fn wake_locked(&self, state: &mut SchedState, queue: &WaitQueue, max: usize) -> usize {
        let mut woken = 0;
        while woken < max {
            let next = queue.waiters().lock().pop_front();
            let Some(thread) = next else {
                break;
            };
            if self.unblock_locked(state, &thread) {
                woken += 1;
            }
        }
        woken
    }

    /// 把阻塞的线程放回运行队列
    ///
    /// ## Returns
    ///
    /// 线程不处于阻塞状态时返回 `false`
    pub fn unblock(&'static self, thread: &Arc<Thread>) -> bool {
        let mut state = self.state.lock();
        self.unblock_locked(&mut state, thread)
    }

    fn unblock_locked(&self, state: &mut SchedState, thread: &Arc<Thread>) -> bool {
        let tid = thread.tid();
        let priority = {
            let mut inner = thread.inner_exclusive_access();
            if inner.state != ThreadState::Blocked {
                return false;
            }
            match inner.block_reason.take() {
                Some(BlockReason::Sleep { deadline }) => {
                    state.sleepers.remove(&(deadline, tid));
                }
                Some(BlockReason::Wait { queue }) => {
                    // 阻塞期间等待方的调用帧一直借用着该队列
                    let queue = unsafe { &*(queue as *const WaitQueue) };
                    queue.waiters().lock().retain(|t| t.tid() != tid);
                }
                None => {}
            }
            inner.state = ThreadState::Runnable;
            inner.priority
        };
        state.run_queue.push(thread.clone(), priority);
        self.sync_runnable(state);
        self.update_next_deadline(state);
        trace!("thread {} unblocked", tid);
        self.maybe_preempt(priority);
        true
    }

    /// 新就绪线程比本核当前线程更优先时请求重新调度
    fn maybe_preempt(&self, priority: usize) {
        let Some(cpu) = PerCpuState::current() else {
            return;
        };
        if let Some(current) = cpu.current_thread() {
            if current.is_idle() || priority < current.priority() {
                cpu.invoke_scheduler_async();
            }
        }
    }

    /// 结束当前线程
    ///
    /// 线程进入 `Dying`，切换到下一个线程后由换入一侧回收。
    pub fn exit_current(&'static self, code: i32) -> ! {
        let irq = InterruptDisabler::new();
        core::mem::forget(irq);
        self.check_may_block();
        let mut state = self.state.lock();
        let cpu = self.this_cpu();
        let current = self.blockable_current(cpu);
        {
            let mut inner = current.inner_exclusive_access();
            inner.state = ThreadState::Dying;
            inner.exit_code = Some(code);
        }
        debug!("thread {} exiting with code {}", current.tid(), code);
        self.switch_away(&mut state, cpu, current);
        unreachable!("dying thread was resumed");
    }

    /// 把已经不再可运行的当前线程换出
    fn switch_away(&'static self, state: &mut SchedState, cpu: &PerCpuState, current: Arc<Thread>) {
        let next = self.select_next(state, cpu);
        self.context_switch(state, cpu, current, next);
    }

    /// 时钟中断处理
    ///
    /// 0 号 CPU 推进全局时钟并在有睡眠线程到期时排入唤醒；运行线程的
    /// 时间片减一，用完时请求重新调度。
    pub fn timer_tick(&'static self) {
        let Some(cpu) = PerCpuState::current() else {
            return;
        };
        if cpu.id() == 0 {
            let now = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if now >= self.next_deadline.load(Ordering::SeqCst)
                && cpu
                    .deferred()
                    .queue(sleep::wake_sleepers_deferred, self as *const Scheduler as usize)
                    .is_err()
            {
                log::warn!("deferred call pool full, sleepers will wake late");
            }
        }
        let Some(current) = cpu.current_thread() else {
            return;
        };
        if current.is_idle() {
            if self.runnable.load(Ordering::Relaxed) > 0 {
                cpu.invoke_scheduler_async();
            }
            return;
        }
        let expired = {
            let mut inner = current.inner_exclusive_access();
            inner.time_slice = inner.time_slice.saturating_sub(1);
            inner.time_slice == 0
        };
        if expired {
            trace!("thread {} time slice expired", current.tid());
            cpu.invoke_scheduler_async();
        }
    }

    /// 请求停机：空闲线程在没有可运行线程时让 CPU 停下
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// 就绪线程数量
    pub fn runnable_count(&self) -> usize {
        self.runnable.load(Ordering::Relaxed)
    }

    fn sync_runnable(&self, state: &SchedState) {
        self.runnable
            .store(state.run_queue.len(), Ordering::Relaxed);
    }

    /// 已持有调度锁时的当前 CPU；持锁期间不会迁移
    fn this_cpu(&self) -> &'static PerCpuState {
        match PerCpuState::current() {
            Some(cpu) => cpu,
            None => panic!("scheduler used on a cpu that was never initialized"),
        }
    }

    fn check_may_block(&self) {
        let cpu = self.this_cpu();
        if cpu.in_critical() > 0 || cpu.in_irq() > 0 {
            cpu.fatal("blocking inside a critical section or interrupt handler");
        }
    }

    fn blockable_current(&self, cpu: &PerCpuState) -> Arc<Thread> {
        match cpu.current_thread() {
            Some(thread) if !thread.is_idle() => thread,
            Some(_) => cpu.fatal("idle thread cannot block or exit"),
            None => cpu.fatal("no current thread"),
        }
    }

    /// 本次新线程初始帧的栈顶偏移
    fn stack_offset(&self) -> usize {
        match self.config.stack_offset {
            StackOffset::Disabled => 0,
            StackOffset::Random { limit } => {
                let limit = limit.min(STACK_OFFSET_LIMIT);
                if limit < 16 {
                    0
                } else {
                    (self.next_random() as usize % limit) & !0xf
                }
            }
        }
    }

    fn next_random(&self) -> u64 {
        let step = |mut x: u64| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x
        };
        let prev = self
            .rng
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| Some(step(x)))
            .unwrap_or(1);
        step(prev)
    }

    /// 诊断转储后停机
    pub fn fatal(&self, msg: &str) -> ! {
        let _irq = InterruptDisabler::new();
        let cpu = self.this_cpu();
        match self.state.try_lock() {
            Some(state) => self.fatal_locked(&state, cpu, msg),
            None => cpu.fatal(msg),
        }
    }

    fn fatal_locked(&self, state: &SchedState, cpu: &PerCpuState, msg: &str) -> ! {
        error!(
            "scheduler state: ticks={} runnable={:?} sleepers={}",
            self.ticks.load(Ordering::Relaxed),
            state.run_queue.tids(),
            state.sleepers.len()
        );
        for other in self.cpus.iter() {
            error!(
                "  cpu {}: initialized={} current={:?}",
                other.id(),
                other.is_initialized(),
                other.current_thread().map(|t| t.tid())
            );
        }
        cpu.fatal(msg)
    }
}

/// 新内核线程的入口寄存器映像
fn entry_registers(entry: usize, arg: usize) -> RegisterState {
    let mut regs = RegisterState::default();
    regs.set_ip(entry);
    regs.set_arg(arg);
    regs.set_return_mode(arch::ExecutionMode::Kernel);
    regs
}

extern "C" fn spawn_entry(arg: usize) {
    let body = unsafe { Box::from_raw(arg as *mut ThreadBody) };
    let code = body();
    exit_current(code);
}

/// 当前 CPU 上运行的线程
pub fn current_thread() -> Option<Arc<Thread>> {
    let _irq = InterruptDisabler::new();
    PerCpuState::current().and_then(|cpu| cpu.current_thread())
}

/// 让出当前 CPU
pub fn yield_now() {
    if let Some(sched) = Scheduler::current() {
        sched.yield_now();
    }
}

/// 以 `code` 结束当前线程
pub fn exit_current(code: i32) -> ! {
    match Scheduler::current() {
        Some(sched) => sched.exit_current(code),
        None => panic!("exit_current called before the scheduler was initialized"),
    }
}
