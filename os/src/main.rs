//! # NimlothOS 内核入口
//!
//! 启动 hart 清零 `.bss`、初始化堆与日志、创建调度器并通过 SBI HSM 扩展
//! 唤醒其余 hart。每个 hart 随后安装陷入入口、打开浮点单元与时钟中断，
//! 初始化本核调度状态并冷启动进入空闲线程。
//!
//! ```text
//! _start (entry.asm, a0 = hartid)
//!     └─► rust_main
//!           ├─ 启动 hart: boot_main ─► hart_start(其余 hart)
//!           └─ 其余 hart: secondary_main
//!                 └─► enter_scheduler ─► Scheduler::start (不返回)
//! ```

#![no_std]
#![no_main]

extern crate alloc;

mod config;
mod demo;
mod heap_allocator;
mod lang_items;

use config::HART_COUNT;
use core::arch::global_asm;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use log::{info, warn};
use nimloth_sched::arch::{self, sbi};
use nimloth_sched::{Scheduler, SchedulerConfig, logging};

global_asm!(include_str!("entry.asm"));

const NO_BOOT_HART: usize = usize::MAX;

/// 第一个到达 `rust_main` 的 hart
static BOOT_HART: AtomicUsize = AtomicUsize::new(NO_BOOT_HART);

/// 启动 hart 创建的调度器，其余 hart 启动后从这里取得
static SCHEDULER: AtomicPtr<Scheduler> = AtomicPtr::new(ptr::null_mut());

#[unsafe(no_mangle)]
pub extern "C" fn rust_main(hartid: usize) -> ! {
    if BOOT_HART
        .compare_exchange(NO_BOOT_HART, hartid, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        boot_main(hartid)
    } else {
        secondary_main(hartid)
    }
}

fn boot_main(hartid: usize) -> ! {
    clear_bss();
    heap_allocator::init_heap();
    logging::init();
    info!("[kernel] NimlothOS booting on hart {}", hartid);

    let sched = match Scheduler::new(SchedulerConfig::with_cpus(HART_COUNT)) {
        Ok(sched) => sched,
        Err(e) => panic!("failed to create scheduler: {}", e),
    };
    SCHEDULER.store(sched as *const Scheduler as *mut Scheduler, Ordering::Release);

    unsafe extern "C" {
        fn _start();
    }
    for id in (0..HART_COUNT).filter(|id| *id != hartid) {
        if !sbi::hart_start(id, _start as usize, 0) {
            warn!("[kernel] failed to start hart {}", id);
        }
    }
    enter_scheduler(sched, hartid, true)
}

fn secondary_main(hartid: usize) -> ! {
    let Some(sched) = (unsafe { SCHEDULER.load(Ordering::Acquire).as_ref() }) else {
        panic!("hart {} started before the scheduler was created", hartid);
    };
    enter_scheduler(sched, hartid, false)
}

fn enter_scheduler(sched: &'static Scheduler, hartid: usize, boot: bool) -> ! {
    arch::enable_fpu();
    arch::init_trap();
    if let Err(e) = sched.initialize(hartid) {
        panic!("hart {}: {}", hartid, e);
    }
    if boot {
        demo::spawn_workload(sched);
    }
    arch::enable_timer_interrupt();
    arch::set_next_trigger();
    info!("[kernel] hart {} online", hartid);
    sched.start()
}

fn clear_bss() {
    unsafe extern "C" {
        fn sbss();
        fn ebss();
    }
    (sbss as usize..ebss as usize).for_each(|a| unsafe {
        (a as *mut u8).write_volatile(0);
    });
}
