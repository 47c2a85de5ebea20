//! # 内核堆内存分配器
//!
//! 使用 Buddy System 算法管理一块静态内存。线程在时钟中断的延迟调用
//! 与回收路径上也会释放内存，因此持有分配器锁期间必须关中断；同时它
//! 不计入调度临界区，分配与释放永远不会成为调度点，持有其他自旋锁时
//! 也可以安全地分配内存。

use crate::config::KERNEL_HEAP_SIZE;
use buddy_system_allocator::Heap;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, addr_of_mut};
use nimloth_sched::arch::InterruptDisabler;
use spin::Mutex;

struct KernelHeap(Mutex<Heap<32>>);

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _irq = InterruptDisabler::new();
        self.0
            .lock()
            .alloc(layout)
            .map_or(core::ptr::null_mut(), |ptr| ptr.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _irq = InterruptDisabler::new();
        if let Some(ptr) = NonNull::new(ptr) {
            self.0.lock().dealloc(ptr, layout);
        }
    }
}

#[global_allocator]
static HEAP_ALLOCATOR: KernelHeap = KernelHeap(Mutex::new(Heap::empty()));

static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

/// 初始化内核堆分配器
///
/// 由启动 hart 在其他 hart 启动之前调用一次。
pub fn init_heap() {
    let _irq = InterruptDisabler::new();
    unsafe {
        HEAP_ALLOCATOR
            .0
            .lock()
            .init(addr_of_mut!(HEAP_SPACE) as usize, KERNEL_HEAP_SIZE);
    }
}
