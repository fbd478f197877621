//! 内核堆分配。

#![no_std]
#![deny(warnings, missing_docs)]

extern crate alloc;

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error};
use buddy_system_allocator::LockedHeap;
use core::{alloc::Layout, ptr::NonNull};

/// 页内偏移的位数。
pub const PAGE_BITS: usize = 12;

/// 初始化 `n` 个页的托管区，这些页将放置在 bss 段上。
#[macro_export]
macro_rules! init {
    (pages = $n:expr) => {{
        #[repr(C, align(4096))]
        struct Page([u8; 4096]);

        impl Page {
            const ZERO: Self = Self([0u8; 4096]);
        }

        static mut SPACE: [Page; $n] = [Page::ZERO; $n];
        unsafe { $crate::_init(core::ptr::addr_of_mut!(SPACE).cast(), $n << 12) };
    }};
}

/// 初始化全局分配器。
///
/// # Safety
///
/// `base` 起的 `len` 字节交由分配器独占。
#[doc(hidden)]
pub unsafe fn _init(base: *mut u8, len: usize) {
    log::info!("HEAP = {:#x}..{:#x}", base as usize, base as usize + len);
    HEAP.lock().init(base as usize, len);
}

/// 追加一段托管内存。
///
/// # Safety
///
/// 这段内存交由分配器独占。
pub unsafe fn transfer(region: &'static mut [u8]) {
    let range = region.as_ptr_range();
    HEAP.lock().add_to_heap(range.start as usize, range.end as usize);
}

/// 整页分配，返回清零的页。
#[inline]
pub fn alloc_pages(count: usize) -> &'static mut [u8] {
    unsafe {
        let size = count << PAGE_BITS;
        let layout = Layout::from_size_align_unchecked(size, 1 << PAGE_BITS);
        let ptr = alloc_zeroed(layout);
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        core::slice::from_raw_parts_mut(ptr, size)
    }
}

/// 整页回收。
#[inline]
pub fn dealloc_pages<T>(ptr: NonNull<T>, count: usize) {
    unsafe {
        let layout = Layout::from_size_align_unchecked(count << PAGE_BITS, 1 << PAGE_BITS);
        dealloc(ptr.as_ptr().cast(), layout)
    }
}

/// 堆分配器。
#[cfg_attr(target_os = "none", global_allocator)]
static HEAP: LockedHeap<32> = LockedHeap::empty();
