//! 物理内存与内核地址空间。
//!
//! 物理内存通过固定偏移的内核窗口访问：物理地址 p 映射在
//! `HIGHER_HALF + p`。窗口之上是内核自己的动态区域，给内核栈
//! 这类按区域管理的映射用。

use frame_alloc::{FrameAllocator, FRAME_SIZE};
use kernel_vm::{AddressSpace, ShmRegistry};
use linker::{KernelLayout, MultibootInfo, HIGHER_HALF};
use page_table::{FrameManager, Ppn, PteFlags, Vpn};
use spin::{Lazy, Once};
use sync::UPIntrFreeCell;

/// 窗口管理的物理内存上限。再多的物理内存按保留处理。
pub const LOWMEM_TOP: usize = 0x1000_0000;

/// 内核动态区域，内核栈等内核区域从这里分配。
pub const KERNEL_DYN_START: usize = 0xd000_0000;
/// 内核动态区域的结束。
pub const KERNEL_DYN_END: usize = 0xf000_0000;

/// 用户地址空间的硬边界。
pub const USER_START: usize = 0x1000;
/// 用户半空间到内核半空间的分界。
pub const USER_END: usize = HIGHER_HALF;
/// 内核挑地址时的搜索范围。
pub const USER_ALLOC_START: usize = 0x1000_0000;
/// 搜索范围的结束，再往上留给用户栈。
pub const USER_ALLOC_END: usize = 0xb000_0000;

/// 全局页帧管理：位图分配器加内核窗口。
pub struct GlobalFrames {
    inner: UPIntrFreeCell<FrameAllocator>,
}

/// 把物理地址翻译成内核窗口里的指针，窗口常驻所以没有对应的解除操作。
#[inline]
pub fn kmap(pa: usize) -> *mut u8 {
    (pa + HIGHER_HALF) as *mut u8
}

impl FrameManager for GlobalFrames {
    fn alloc_frame(&self) -> Option<Ppn> {
        let ppn = self
            .inner
            .exclusive_session(|fa| fa.alloc())
            .ok()
            .map(Ppn)?;
        unsafe { core::ptr::write_bytes(self.frame_ptr(ppn), 0, FRAME_SIZE) };
        Some(ppn)
    }

    fn retain(&self, ppn: Ppn) {
        self.inner.exclusive_session(|fa| fa.retain(ppn.0));
    }

    fn release(&self, ppn: Ppn) -> bool {
        self.inner.exclusive_session(|fa| fa.release(ppn.0))
    }

    fn frame_ptr(&self, ppn: Ppn) -> *mut u8 {
        kmap(ppn.base())
    }
}

impl GlobalFrames {
    /// 空闲页帧数。
    pub fn free_frames(&self) -> usize {
        self.inner.exclusive_session(|fa| fa.free_frames())
    }
}

static FRAMES: Once<GlobalFrames> = Once::new();
static KERNEL_SPACE: Once<UPIntrFreeCell<AddressSpace>> = Once::new();

/// 共享内存注册表。
static SHM: Lazy<UPIntrFreeCell<ShmRegistry>> =
    Lazy::new(|| unsafe { UPIntrFreeCell::new(ShmRegistry::new()) });

/// 全局页帧管理器。
pub fn frames() -> &'static GlobalFrames {
    FRAMES.get().unwrap()
}

/// 内核地址空间。
pub fn kernel_space() -> &'static UPIntrFreeCell<AddressSpace> {
    KERNEL_SPACE.get().unwrap()
}

/// 共享内存注册表。
pub fn shm_registry() -> &'static UPIntrFreeCell<ShmRegistry> {
    &SHM
}

/// 内核页目录的物理地址，退出路径切换回它再拆用户空间。
pub fn kernel_root_pa() -> usize {
    kernel_space().exclusive_session(|ks| ks.dir().root_pa())
}

/// 初始化物理内存和内核地址空间。
///
/// 内存图缺失是引导致命错误。
pub fn init(info: &MultibootInfo, layout: &KernelLayout) {
    let areas = info
        .memory_areas()
        .unwrap_or_else(|| panic!("MULTIBOOT_FAIL: no memory map"));

    // 按内存图把可用内存标记出来，只收整页。
    let managed = LOWMEM_TOP / FRAME_SIZE;
    let mut fa = FrameAllocator::new(managed);
    let mut total = 0usize;
    for area in areas {
        if !area.is_available() || area.base >= LOWMEM_TOP as u64 {
            continue;
        }
        let start = (area.base as usize).div_ceil(FRAME_SIZE);
        let end = (area.base + area.length).min(LOWMEM_TOP as u64) as usize / FRAME_SIZE;
        total += end.saturating_sub(start);
        fa.mark_free(start..end);
    }

    // 低 1 MiB、内核映像和引导模块不参与分配。
    fa.mark_reserved(0..0x10_0000 / FRAME_SIZE);
    let image = layout.p_range();
    fa.mark_reserved(image.start / FRAME_SIZE..image.end.div_ceil(FRAME_SIZE));
    for module in info.modules() {
        let range = module.p_range;
        fa.mark_reserved(range.start / FRAME_SIZE..range.end.div_ceil(FRAME_SIZE));
    }

    log::info!(
        "pmem: {} MiB usable, {} frames free",
        total * FRAME_SIZE >> 20,
        fa.free_frames(),
    );
    FRAMES.call_once(|| GlobalFrames {
        inner: unsafe { UPIntrFreeCell::new(fa) },
    });

    // 内核地址空间：先把 256 张内核页表配齐，此后内核半空间
    // 的页目录项不再变化，所有地址空间共享同一组内核页表。
    //
    // 这期间分配的页帧都落在引导页目录映射的低端 16 MiB 里，
    // 换上新页目录之前窗口还没完全建好。
    let mut space = AddressSpace::new(
        frames(),
        KERNEL_DYN_START..KERNEL_DYN_END,
        KERNEL_DYN_START..KERNEL_DYN_END,
    )
    .expect("kernel address space");
    space.alloc_kernel_tables().expect("kernel page tables");
    space
        .map_extern(
            Vpn(HIGHER_HALF >> 12)..Vpn((HIGHER_HALF >> 12) + managed),
            Ppn(0),
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::GLOBAL,
        )
        .expect("kernel window");
    for region in layout.iter() {
        log::info!("{region}");
    }
    unsafe { space.install() };
    KERNEL_SPACE.call_once(|| unsafe { UPIntrFreeCell::new(space) });
}
