//! # 切换与首次调度
//!
//! 热切换发起时持有调度锁，`in_critical == 1`。换入的线程有两种恢复方式：
//!
//! - 曾经换出过：从它自己的 `context_switch` 调用中返回，随后
//!   `finish_context_switch` 回收上一个线程，返回途中析构调度锁守卫
//! - 第一次运行：恢复点是 first-enter 跳板，跳板调用
//!   [`context_first_init`]，它完成同样的收尾，再强制释放调度锁并静默
//!   离开临界区，最后经由陷入返回路径进入合成帧
//!
//! ```text
//! 栈顶   ┌────────────────────┐
//!        │ 内核入口槽 (16B)     │
//!        ├────────────────────┤ ◄─ top - 16 - frame_offset
//!        │ TrapFrame          │
//!        ├────────────────────┤
//!        │ RegisterState      │ ◄─ ThreadRegisters::sp（首次调度）
//!        └────────────────────┘
//! ```

use super::{SchedState, Scheduler};
use crate::arch::{
    self, ContextSwitchEngine, Engine, InterruptDisabler, REGISTER_STATE_SIZE, RegisterState,
    TRAP_FRAME_SIZE, ThreadRegisters, TrapRegisters,
};
use crate::processor::PerCpuState;
use crate::task::{Thread, ThreadState};
use crate::trap::TrapFrame;
use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::Ordering;
use log::{debug, info, trace};

/// 内核入口槽大小
const KERNEL_ENTRY_SLOT: usize = 16;

impl Scheduler {
    /// 从 `from` 切换到 `to`
    ///
    /// 返回时 `from` 已经被重新调度，可能在另一个 CPU 上；返回前完成了
    /// 上一个线程的收尾。
    pub(super) fn context_switch(
        &'static self,
        state: &mut SchedState,
        cpu: &PerCpuState,
        from: Arc<Thread>,
        to: Arc<Thread>,
    ) {
        if !from.kernel_stack().canary_intact() {
            self.fatal_locked(state, cpu, "kernel stack overflow");
        }
        {
            let mut inner = to.inner_exclusive_access();
            if inner.state != ThreadState::Runnable {
                drop(inner);
                self.fatal_locked(state, cpu, "dispatching a thread that is not runnable");
            }
            inner.state = ThreadState::Running;
            inner.cpu = Some(cpu.id());
            inner.time_slice = self.config.time_slice(inner.priority);
            inner.dispatches += 1;
        }
        if from.is_idle() {
            from.inner_exclusive_access().state = ThreadState::Runnable;
        }
        unsafe { cpu.switch_context(from, to) };
        self.finish_context_switch(state);
    }

    /// 换入之后的收尾：回收已经退出的上一个线程
    ///
    /// 调用时持有调度锁，且运行在换入线程的栈上。
    pub(super) fn finish_context_switch(&self, state: &mut SchedState) {
        let cpu = self.this_cpu();
        if let Some(previous) = cpu.take_previous() {
            if previous.state() == ThreadState::Dying {
                self.reap(state, previous);
            }
        }
    }

    fn reap(&self, state: &mut SchedState, thread: Arc<Thread>) {
        let tid = thread.tid();
        thread.inner_exclusive_access().state = ThreadState::Dead;
        state.registry.remove(&tid);
        let owned = thread.process().and_then(|p| p.remove_thread(tid));
        let woken = self.wake_locked(state, thread.exit_waiters(), usize::MAX);
        debug!("reaped thread {} ({} joiners woken)", tid, woken);
        drop(owned);
    }

    /// 为 `thread` 构造首次调度用的合成帧
    ///
    /// 合成帧由入口寄存器映像复制而来：返回地址为零时设为退出跳板，
    /// 栈指针为零时指向寄存器块底部。之后线程的恢复点指向 first-enter
    /// 跳板。
    ///
    /// ## Arguments
    ///
    /// * `leave_critical` - 为真时把临界区深度从 2 降为 1（exec 路径）
    ///
    /// ## Safety
    ///
    /// `thread` 不能正在任何 CPU 上使用初始帧所在的栈区域。
    pub(crate) unsafe fn init_context(&self, thread: &Thread, leave_critical: bool) {
        let ctx = unsafe { &mut *thread.context_ptr() };
        let frame_top = thread.kernel_stack().top() - KERNEL_ENTRY_SLOT - ctx.frame_offset;
        let trap_addr = frame_top - TRAP_FRAME_SIZE;
        let regs_addr = trap_addr - REGISTER_STATE_SIZE;
        debug_assert!(regs_addr % 16 == 0);

        let mut regs = ctx.entry;
        if regs.return_address() == 0 {
            regs.set_return_address(Engine::exit_trampoline_address());
        }
        if regs.sp() == 0 {
            regs.set_sp(regs_addr);
        }
        unsafe {
            ptr::write(regs_addr as *mut RegisterState, regs);
            ptr::write(
                trap_addr as *mut TrapFrame,
                TrapFrame::new(regs_addr as *mut RegisterState),
            );
        }
        ctx.current_trap = trap_addr as *mut TrapFrame;
        ctx.regs.sp = regs_addr;
        ctx.regs.ip = Engine::first_enter_address();
        ctx.saved_critical = 1;

        if leave_critical {
            let cpu = self.this_cpu();
            if cpu.in_critical() != 2 {
                cpu.fatal("init_context: exec path expects two critical sections");
            }
            cpu.restore_critical(1);
        }
    }

    /// 冷启动当前 CPU，从此执行本核空闲线程
    ///
    /// ## Panics
    ///
    /// 当前 CPU 没有调用过 [`Scheduler::initialize`] 时 panic
    pub fn start(&'static self) -> ! {
        let irq = InterruptDisabler::new();
        core::mem::forget(irq);
        let cpu = self.this_cpu();
        if !cpu.scheduler().is_some_and(|s| ptr::eq(s, self)) {
            cpu.fatal("start on a cpu owned by another scheduler");
        }
        let Some(idle) = cpu.idle_thread().cloned() else {
            cpu.fatal("start without an idle thread");
        };
        // 由首次调度路径释放
        core::mem::forget(self.state.lock());
        {
            let mut inner = idle.inner_exclusive_access();
            inner.state = ThreadState::Running;
            inner.cpu = Some(cpu.id());
            inner.dispatches += 1;
        }
        let space = idle.address_space();
        if arch::active_address_space() != space {
            arch::activate_address_space(space);
        }
        cpu.set_current_thread(idle.clone());
        cpu.set_initialized();
        info!("cpu {} entering scheduler", cpu.id());
        let regs = unsafe { &raw const (*idle.context_ptr()).regs };
        drop(idle);
        unsafe { Engine::initialize_context_switching(regs) }
    }

    /// 首次调度的收尾，见 [`context_first_init`]
    fn first_switch(&self, cpu: &PerCpuState) {
        if !self.state.is_locked() {
            cpu.fatal("first dispatch without the scheduler lock");
        }
        let state = unsafe { self.state.get_unchecked() };
        self.finish_context_switch(state);
        if let Some(current) = cpu.current_thread() {
            current.inner_exclusive_access().first_dispatches += 1;
            trace!("thread {} first dispatch on cpu {}", current.tid(), cpu.id());
        }
        unsafe { self.state.force_unlock() };
        cpu.leave_critical_silently();
    }

    /// exec 子系统装好新映像之后、回到线程之前调用
    ///
    /// 调用方须处在恰好一层临界区内（例如持有一个 [`ScopedCritical`]），
    /// 并已把新的地址空间写入当前线程。本函数取得调度锁后检查上下文，
    /// 再切换到当前线程的地址空间。
    ///
    /// ## Panics
    ///
    /// 临界区深度不为 1 或没有当前线程时致命失败
    ///
    /// [`ScopedCritical`]: crate::processor::ScopedCritical
    pub fn prepare_after_exec(&self) {
        let _state = self.state.lock();
        self.activate_exec_space();
    }

    /// 持有调度锁、临界区深度为 2 时切换到当前线程的地址空间
    fn activate_exec_space(&self) {
        let cpu = self.this_cpu();
        if !self.state.is_locked() {
            cpu.fatal("exec without the scheduler lock");
        }
        if cpu.in_critical() != 2 {
            cpu.fatal("exec expects two critical sections");
        }
        let Some(current) = cpu.current_thread() else {
            cpu.fatal("exec without a current thread");
        };
        let space = current.address_space();
        if arch::active_address_space() != space {
            arch::activate_address_space(space);
            cpu.stats()
                .address_space_switches
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 以新的入口替换当前线程的执行映像
    ///
    /// 丢弃当前栈上的一切，重建初始帧并经由强制重入路径从 `entry(arg)`
    /// 开始执行；`address_space` 为 `Some` 时同时换用新的地址空间。
    /// 线程 ID、优先级与亲和性保持不变。
    pub fn exec_current(
        &'static self,
        entry: extern "C" fn(usize),
        arg: usize,
        address_space: Option<usize>,
    ) -> ! {
        let irq = InterruptDisabler::new();
        core::mem::forget(irq);
        self.check_may_block();
        let cpu = self.this_cpu();
        let thread = self.blockable_current(cpu);
        cpu.enter_critical();
        core::mem::forget(self.state.lock());

        let ctx = unsafe { &mut *thread.context_ptr() };
        let mut regs = RegisterState::default();
        regs.set_ip(entry as usize);
        regs.set_arg(arg);
        regs.set_return_mode(arch::ExecutionMode::Kernel);
        ctx.entry = regs;
        if let Some(space) = address_space {
            ctx.address_space = space;
        }
        thread.inner_exclusive_access().first_dispatches = 0;
        debug!("thread {} exec at {:#x}", thread.tid(), entry as usize);

        self.activate_exec_space();
        unsafe { self.init_context(&thread, true) };
        let regs: *const ThreadRegisters = unsafe { &raw const (*thread.context_ptr()).regs };
        drop(thread);
        unsafe { Engine::assume_context(regs) }
    }
}

/// first-enter 跳板调用：线程第一次运行时完成切换收尾
///
/// 返回后跳板经由陷入返回路径进入线程的合成帧。
#[unsafe(no_mangle)]
pub extern "C" fn context_first_init(
    _from: *mut ThreadRegisters,
    _to: *mut ThreadRegisters,
    _trap: *mut TrapFrame,
) {
    let Some(cpu) = PerCpuState::current() else {
        panic!("first dispatch on a cpu that was never initialized");
    };
    let Some(sched) = cpu.scheduler() else {
        cpu.fatal("first dispatch without a scheduler");
    };
    sched.first_switch(cpu);
}

/// 线程入口函数返回后由退出跳板调用
#[unsafe(no_mangle)]
pub extern "C" fn thread_returned() -> ! {
    super::exit_current(0)
}
