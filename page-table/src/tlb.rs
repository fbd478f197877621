//! TLB 维护。
//!
//! 页表被修改后必须让对应的缓存表项失效，在宿主机上这些都是空操作。

/// 把页目录装入 cr3。
///
/// # Safety
///
/// `root_pa` 必须指向一个结构完好的页目录，且内核半空间已映射。
#[inline]
pub unsafe fn install(root_pa: usize) {
    #[cfg(target_arch = "x86")]
    core::arch::asm!("mov cr3, {}", in(reg) root_pa);
    #[cfg(not(target_arch = "x86"))]
    let _ = root_pa;
}

/// 当前装载的页目录物理地址。
#[inline]
pub fn current() -> usize {
    #[cfg(target_arch = "x86")]
    {
        let pa: usize;
        unsafe { core::arch::asm!("mov {}, cr3", out(reg) pa) };
        pa
    }
    #[cfg(not(target_arch = "x86"))]
    0
}

/// 使一个虚地址的缓存表项失效。
#[inline]
pub fn flush_one(va: usize) {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va)
    };
    #[cfg(not(target_arch = "x86"))]
    let _ = va;
}

/// 重装 cr3，使全部非全局表项失效。
#[inline]
pub fn flush_all() {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("mov {0}, cr3", "mov cr3, {0}", out(reg) _)
    };
}
