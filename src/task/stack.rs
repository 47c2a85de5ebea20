//! # 内核栈区
//!
//! 所有线程的内核栈来自一块连续内存，按线程 ID 切成固定大小的槽位：
//!
//! ```text
//! base                                                   base + N * SIZE
//! ┌──────────────┬──────────────┬─────┬──────────────────┐
//! │ slot 0       │ slot 1       │ ... │ slot N-1         │
//! └──────────────┴──────────────┴─────┴──────────────────┘
//!  ▲ canary      ▲ top of slot 0
//! ```
//!
//! 每个槽位最低地址处写入一个哨兵值，线程每次被换出时检查，哨兵被
//! 改写说明发生了栈溢出。

use crate::config::KERNEL_STACK_SIZE;
use alloc::alloc::{Layout, alloc_zeroed};

/// 栈底哨兵值
pub const STACK_CANARY: u64 = 0x5a5a_c0de_dead_beef;

/// 栈区对齐
const ARENA_ALIGN: usize = 4096;

pub struct StackArena {
    base: usize,
    slots: usize,
    slot_size: usize,
}

impl StackArena {
    /// 分配能容纳 `slots` 个内核栈的栈区
    ///
    /// 栈区在整个调度器生命周期内存活，从不释放。
    pub fn new(slots: usize) -> Self {
        let slot_size = KERNEL_STACK_SIZE;
        let size = slots.max(1) * slot_size;
        let base = match Layout::from_size_align(size, ARENA_ALIGN) {
            Ok(layout) => unsafe { alloc_zeroed(layout) },
            Err(_) => core::ptr::null_mut(),
        };
        if base.is_null() {
            panic!("failed to allocate {} kernel stacks", slots);
        }
        Self {
            base: base as usize,
            slots,
            slot_size,
        }
    }

    /// 取出 `tid` 对应的栈槽位并写入哨兵
    pub fn stack(&'static self, tid: usize) -> KernelStack {
        assert!(tid < self.slots, "no kernel stack slot for tid {}", tid);
        let bottom = self.base + tid * self.slot_size;
        let stack = KernelStack {
            bottom,
            top: bottom + self.slot_size,
        };
        stack.write_canary();
        stack
    }
}

/// 一个线程的内核栈 `[bottom, top)`
pub struct KernelStack {
    bottom: usize,
    top: usize,
}

impl KernelStack {
    pub fn top(&self) -> usize {
        self.top
    }

    pub fn bottom(&self) -> usize {
        self.bottom
    }

    fn write_canary(&self) {
        unsafe { (self.bottom as *mut u64).write_volatile(STACK_CANARY) };
    }

    /// 哨兵是否完好
    pub fn canary_intact(&self) -> bool {
        unsafe { (self.bottom as *const u64).read_volatile() == STACK_CANARY }
    }
}
