//! # 体系结构抽象层
//!
//! 上下文切换引擎与寄存器布局随目标体系结构在编译期选定，每次构建只有
//! 一个实现：
//!
//! - `riscv64`：内核目标，使用 `sstatus`/`satp`/`sscratch`、`sret` 与 SBI
//! - `hosted`：x86_64 宿主环境，在用户态做真实的栈切换，供开发与测试使用
//!
//! 其余内核代码只通过 [`ContextSwitchEngine`] 的三个入口（冷启动、热切换、
//! 强制重入）以及 [`TrapRegisters`] 访问寄存器状态，不依赖具体编码。

#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(target_arch = "riscv64")]
pub use riscv64::*;

#[cfg(all(target_arch = "x86_64", not(target_os = "none")))]
mod hosted;
#[cfg(all(target_arch = "x86_64", not(target_os = "none")))]
pub use hosted::*;

#[cfg(not(any(
    target_arch = "riscv64",
    all(target_arch = "x86_64", not(target_os = "none"))
)))]
compile_error!("nimloth-sched supports riscv64 kernels and hosted x86_64 builds only");

/// 陷入前的执行模式
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Kernel,
    User,
}

/// 线程切换时保存的上下文
///
/// 通用寄存器保存在线程自己的内核栈上，这里只记录恢复所需的栈指针、
/// 恢复点以及浮点状态。布局被切换汇编直接使用：
///
/// ```text
/// +0   sp   保存寄存器块所在的内核栈指针
/// +8   ip   恢复点（首次调度时为 first-enter 跳板）
/// +16  fpu  浮点寄存器状态
/// ```
#[repr(C, align(16))]
pub struct ThreadRegisters {
    pub sp: usize,
    pub ip: usize,
    pub fpu: FpuState,
}

impl ThreadRegisters {
    pub fn new() -> Self {
        Self {
            sp: 0,
            ip: 0,
            fpu: FpuState::new(),
        }
    }
}

/// 陷入时保存的寄存器快照的访问接口
///
/// 布局由各体系结构的陷入入口汇编决定，必须与 `init_context` 构造的
/// 合成帧逐位一致。
pub trait TrapRegisters {
    fn ip(&self) -> usize;
    fn set_ip(&mut self, ip: usize);
    fn sp(&self) -> usize;
    fn set_sp(&mut self, sp: usize);
    /// 返回地址寄存器；线程入口函数返回时跳转到这里
    fn return_address(&self) -> usize;
    fn set_return_address(&mut self, ra: usize);
    /// 第一个参数寄存器
    fn set_arg(&mut self, arg: usize);
    fn arg(&self) -> usize;
    /// 陷入前所处的执行模式
    fn previous_mode(&self) -> ExecutionMode;
    /// 设置返回后的执行模式，并在返回后打开中断与浮点单元
    fn set_return_mode(&mut self, mode: ExecutionMode);
    fn interrupts_enabled_on_return(&self) -> bool;
}

/// 上下文切换引擎
///
/// 三个入口对应三种恢复方式。全部都是 `unsafe`：调用者必须持有调度锁、
/// 关闭中断，并保证指针指向存活线程的上下文。
pub trait ContextSwitchEngine {
    /// 冷启动：不保存任何现场，直接以 `initial` 的首次调度方式开始执行
    unsafe fn initialize_context_switching(initial: *const ThreadRegisters) -> !;

    /// 热切换：把当前寄存器压入 `from` 的内核栈，切到 `to` 的栈并恢复
    ///
    /// `from` 日后被切回时，本函数像普通调用一样返回。
    unsafe fn switch_context(from: *mut ThreadRegisters, to: *const ThreadRegisters);

    /// 强制重入：丢弃当前栈上的一切，经由 `thread` 上已构造好的合成陷入帧
    /// 走通用陷入返回路径
    unsafe fn assume_context(thread: *const ThreadRegisters) -> !;

    /// 首次调度时的恢复点
    fn first_enter_address() -> usize;

    /// 线程入口函数返回后的跳板
    fn exit_trampoline_address() -> usize;
}

/// 关中断守卫
///
/// 构造时记录并关闭中断，析构时恢复原来的中断状态。
pub struct InterruptDisabler {
    was_enabled: bool,
}

impl InterruptDisabler {
    pub fn new() -> Self {
        let was_enabled = interrupts_enabled();
        disable_interrupts();
        Self { was_enabled }
    }
}

impl Drop for InterruptDisabler {
    fn drop(&mut self) {
        if self.was_enabled {
            enable_interrupts();
        }
    }
}

/// 陷入寄存器块大小（字节）
pub const REGISTER_STATE_SIZE: usize = core::mem::size_of::<RegisterState>();

/// 陷入帧大小（字节）
pub const TRAP_FRAME_SIZE: usize = core::mem::size_of::<crate::trap::TrapFrame>();

const _: () = assert!(REGISTER_STATE_SIZE % 16 == 0);
const _: () = assert!(TRAP_FRAME_SIZE == 32);
const _: () = assert!(core::mem::offset_of!(ThreadRegisters, fpu) == 16);
