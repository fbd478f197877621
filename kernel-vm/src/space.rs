//! 地址空间：互不相交的区域加一个页目录。

use crate::{object::VmObject, VmProt};
use alloc::{sync::Arc, vec::Vec};
use core::ops::Range;
use page_table::{FrameManager, MapError, PageDirectory, Ppn, PteFlags, VAddr, Vpn, PAGE_SIZE};
use syscall::{Error, Result};

/// 一段虚地址区间到一个对象的映射。
pub struct VmRegion {
    start: usize,
    size: usize,
    object: Arc<VmObject>,
    prot: VmProt,
}

impl VmRegion {
    /// 区域起始地址。
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// 区域字节数。
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// 区域结束地址（不含）。
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// 区域的保护属性。
    #[inline]
    pub fn prot(&self) -> VmProt {
        self.prot
    }

    /// 绑定的对象。
    #[inline]
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    /// 是否用户态区域。
    #[inline]
    pub fn is_user(&self) -> bool {
        self.prot.contains(VmProt::USER)
    }

    #[inline]
    fn contains(&self, va: usize) -> bool {
        self.start <= va && va < self.end()
    }
}

/// 访问类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// 读或取指。
    Read,
    /// 写。
    Write,
}

/// 缺页无法解决的原因，由调用者决定终止谁。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// 地址不落在任何区域内。
    NoRegion,
    /// 访问与区域保护属性冲突。
    Protection,
    /// 生产页帧时内存耗尽。
    OutOfMemory,
    /// 后备文件读取失败。
    Io,
}

/// 地址空间。
///
/// 区域按起始地址排序且互不相交。页表项按需装载：
/// 用户区域在缺页时装入，内核区域建立时就全部装好。
pub struct AddressSpace {
    m: &'static dyn FrameManager,
    dir: PageDirectory,
    regions: Vec<VmRegion>,
    /// 可以随意映射的硬边界。
    bounds: Range<usize>,
    /// 内核挑选地址时的搜索范围，含于 `bounds`。
    alloc_range: Range<usize>,
}

impl AddressSpace {
    /// 新建空的地址空间。
    pub fn new(
        m: &'static dyn FrameManager,
        bounds: Range<usize>,
        alloc_range: Range<usize>,
    ) -> Result<Self> {
        Ok(Self {
            m,
            dir: PageDirectory::new(m).ok_or(Error::OutOfMemory)?,
            regions: Vec::new(),
            bounds,
            alloc_range,
        })
    }

    /// 新建用户地址空间，内核半空间从 `kernel` 别名过来。
    pub fn new_user(
        m: &'static dyn FrameManager,
        bounds: Range<usize>,
        alloc_range: Range<usize>,
        kernel: &AddressSpace,
    ) -> Result<Self> {
        let mut space = Self::new(m, bounds, alloc_range)?;
        space.dir.share_kernel_half(m, &kernel.dir);
        Ok(space)
    }

    /// 页目录。
    #[inline]
    pub fn dir(&self) -> &PageDirectory {
        &self.dir
    }

    /// 区域列表，按起始地址排序。
    #[inline]
    pub fn regions(&self) -> &[VmRegion] {
        &self.regions
    }

    /// 为内核半空间预分配全部页表，只有内核空间调用。
    pub fn alloc_kernel_tables(&mut self) -> Result<()> {
        self.dir
            .alloc_kernel_tables(self.m)
            .ok_or(Error::OutOfMemory)
    }

    /// 直接映射一段外来的物理页帧，不建立区域也不计引用。
    ///
    /// 用于内核映像和物理内存窗口这类生命周期超过空间本身的映射。
    pub fn map_extern(&mut self, range: Range<Vpn>, pbase: Ppn, flags: PteFlags) -> Result<()> {
        for i in 0..range.end.0 - range.start.0 {
            self.dir
                .update(self.m, range.start + i, Ppn(pbase.0 + i), flags)
                .map_err(|_| Error::OutOfMemory)?;
        }
        Ok(())
    }

    /// 把对象映射到内核挑选的地址。
    pub fn map_object(&mut self, object: Arc<VmObject>, prot: VmProt) -> Result<usize> {
        let start = self.find_hole(object.size()).ok_or(Error::OutOfMemory)?;
        self.insert(object, start, prot)?;
        Ok(start)
    }

    /// 把对象映射到指定的地址。
    pub fn map_object_at(
        &mut self,
        object: Arc<VmObject>,
        va: usize,
        prot: VmProt,
    ) -> Result<usize> {
        if va % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        let end = va.checked_add(object.size()).ok_or(Error::InvalidArgument)?;
        if va < self.bounds.start || end > self.bounds.end {
            return Err(Error::InvalidArgument);
        }
        if self.regions.iter().any(|r| r.start < end && va < r.end()) {
            return Err(Error::InvalidArgument);
        }
        self.insert(object, va, prot)?;
        Ok(va)
    }

    /// 取消一个区域的映射。
    ///
    /// `(va, size)` 必须与区域完全一致，不支持部分取消。
    /// 区域持有的对象引用随之消失，内核区域的页表项当场清除，
    /// 别名共享使它对所有页目录生效。
    pub fn unmap_region(&mut self, va: usize, size: usize) -> Result<()> {
        let pos = self
            .regions
            .iter()
            .position(|r| r.start == va && r.size == size)
            .ok_or(Error::NotFound)?;
        let region = self.regions.remove(pos);
        let base = VAddr(region.start).floor();
        for i in 0..region.size / PAGE_SIZE {
            self.dir.unmap(self.m, base + i);
        }
        Ok(())
    }

    /// 处理一次缺页。
    pub fn handle_page_fault(&mut self, va: usize, kind: FaultKind) -> core::result::Result<(), FaultError> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(va))
            .ok_or(FaultError::NoRegion)?;
        if !region.prot.contains(VmProt::READ) {
            return Err(FaultError::Protection);
        }
        let index = (va - region.start) / PAGE_SIZE;
        let (ppn, writable) = match kind {
            FaultKind::Read => {
                let (ppn, private) = region.object.read_page(index).map_err(fault_err)?;
                (ppn, private && region.prot.contains(VmProt::WRITE))
            }
            FaultKind::Write => {
                if !region.prot.contains(VmProt::WRITE) {
                    return Err(FaultError::Protection);
                }
                let ppn = region.object.write_fault(index).map_err(fault_err)?;
                (ppn, true)
            }
        };
        let flags = region.prot.pte_flags(writable);
        self.dir
            .update(self.m, VAddr(va).floor(), ppn, flags)
            .map_err(|_| FaultError::OutOfMemory)
    }

    /// 为用户访问产生某页，返回页内指针和页内可用长度。
    ///
    /// 内核访问用户数据全部走这里，检查区域归属和保护属性，
    /// 然后经由页帧的内核映射读写，绝不解引用用户虚地址。
    /// 写访问可能复制出私有页，页表项同步刷新，用户态才不会
    /// 继续读到复制前的共享页。
    pub fn user_page(&mut self, va: usize, write: bool) -> Result<(*mut u8, usize)> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(va))
            .ok_or(Error::BadAddress)?;
        let mut required = VmProt::USER | VmProt::READ;
        if write {
            required |= VmProt::WRITE;
        }
        if !region.prot.contains(required) {
            return Err(Error::BadAddress);
        }
        let index = (va - region.start) / PAGE_SIZE;
        let (ppn, writable) = if write {
            (region.object.write_fault(index)?, true)
        } else {
            let (ppn, private) = region.object.read_page(index)?;
            (ppn, private && region.prot.contains(VmProt::WRITE))
        };
        let flags = region.prot.pte_flags(writable);
        let offset = VAddr(va).offset();
        let in_page = PAGE_SIZE - offset;
        let in_region = region.end() - va;
        let ptr = unsafe { self.m.frame_ptr(ppn).add(offset) };
        self.dir
            .update(self.m, VAddr(va).floor(), ppn, flags)
            .map_err(|_| Error::OutOfMemory)?;
        Ok((ptr, in_page.min(in_region)))
    }

    /// 复制出一个写时复制的子空间。
    ///
    /// 用户区域换成以父对象为后备的写时复制对象，
    /// 共享内存区域直接共享同一个对象，内核区域不复制。
    pub fn fork(&self) -> Result<AddressSpace> {
        let mut child = Self::new(self.m, self.bounds.clone(), self.alloc_range.clone())?;
        child.dir.share_kernel_half(self.m, &self.dir);
        for region in self.regions.iter().filter(|r| r.is_user()) {
            let object = if region.object.shm_id().is_some() {
                region.object.clone()
            } else {
                VmObject::cow(&region.object)?
            };
            child.regions.push(VmRegion {
                start: region.start,
                size: region.size,
                object,
                prot: region.prot,
            });
        }
        Ok(child)
    }

    /// 把页目录装入处理器。
    ///
    /// # Safety
    ///
    /// 空间必须映射着当前执行的内核代码。
    #[inline]
    pub unsafe fn install(&self) {
        page_table::tlb::install(self.dir.root_pa());
    }

    /// 找一段能放下 `size` 字节的空闲地址，首次适配。
    fn find_hole(&self, size: usize) -> Option<usize> {
        let mut candidate = self.alloc_range.start;
        for region in &self.regions {
            if region.end() <= candidate {
                continue;
            }
            if region.start >= candidate && region.start - candidate >= size {
                break;
            }
            candidate = region.end();
        }
        (candidate
            .checked_add(size)
            .is_some_and(|end| end <= self.alloc_range.end))
        .then_some(candidate)
    }

    /// 插入区域并保持排序，内核区域当场装载页表项。
    fn insert(&mut self, object: Arc<VmObject>, start: usize, prot: VmProt) -> Result<()> {
        let region = VmRegion {
            start,
            size: object.size(),
            object,
            prot,
        };
        if !prot.contains(VmProt::USER) {
            self.populate(&region)?;
        }
        let pos = self
            .regions
            .iter()
            .position(|r| r.start > start)
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, region);
        Ok(())
    }

    /// 立即装载区域的全部页表项，失败时把装载过的部分拆掉。
    fn populate(&mut self, region: &VmRegion) -> Result<()> {
        let base = VAddr(region.start).floor();
        for i in 0..region.size / PAGE_SIZE {
            let result = region
                .object
                .write_fault(i)
                .and_then(|ppn| match self.dir.update(self.m, base + i, ppn, region.prot.pte_flags(true)) {
                    Ok(()) => Ok(()),
                    Err(MapError::AlreadyMapped | MapError::OutOfMemory) => Err(Error::OutOfMemory),
                });
            if let Err(e) = result {
                for j in 0..i {
                    self.dir.unmap(self.m, base + j);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // 只拆用户半空间的页表；叶子页帧归对象，在区域放弃引用后回收。
        self.dir.destroy(self.m);
    }
}

fn fault_err(e: Error) -> FaultError {
    match e {
        Error::OutOfMemory => FaultError::OutOfMemory,
        Error::Io => FaultError::Io,
        _ => FaultError::Protection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockFrames;
    use page_table::KERNEL_BASE;

    const USER_BOUNDS: Range<usize> = 0x1000..KERNEL_BASE;
    const USER_ALLOC: Range<usize> = 0x1000_0000..0xb000_0000;

    fn user_space(m: &'static MockFrames) -> AddressSpace {
        AddressSpace::new(m, USER_BOUNDS, USER_ALLOC).unwrap()
    }

    #[test]
    fn map_fault_unmap_restores_frames() {
        let m = MockFrames::new();
        let before = m.outstanding();
        let mut space = user_space(m);
        let obj = VmObject::anonymous(m, 2 * PAGE_SIZE).unwrap();
        let va = space.map_object(obj, VmProt::RW | VmProt::USER).unwrap();

        // 两页都写一遍，强迫缺页装载。
        space.handle_page_fault(va, FaultKind::Write).unwrap();
        space
            .handle_page_fault(va + PAGE_SIZE, FaultKind::Write)
            .unwrap();
        assert!(m.outstanding() > before);

        space.unmap_region(va, 2 * PAGE_SIZE).unwrap();
        drop(space);
        assert_eq!(m.outstanding(), before);
    }

    #[test]
    fn regions_stay_disjoint_and_sorted() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        let a = VmObject::anonymous(m, PAGE_SIZE).unwrap();
        let b = VmObject::anonymous(m, 4 * PAGE_SIZE).unwrap();
        let c = VmObject::anonymous(m, PAGE_SIZE).unwrap();
        let va_a = space.map_object(a, VmProt::RW | VmProt::USER).unwrap();
        let va_b = space.map_object(b, VmProt::RW | VmProt::USER).unwrap();
        space
            .map_object_at(c.clone(), va_a + 0x2000_0000, VmProt::RW | VmProt::USER)
            .unwrap();
        assert_ne!(va_a, va_b);
        let regions = space.regions();
        for pair in regions.windows(2) {
            assert!(pair[0].end() <= pair[1].start());
        }
        // 重叠映射被拒绝，空间不变。
        let count = regions.len();
        let d = VmObject::anonymous(m, 2 * PAGE_SIZE).unwrap();
        assert_eq!(
            space.map_object_at(d, va_b, VmProt::RW | VmProt::USER),
            Err(Error::InvalidArgument)
        );
        assert_eq!(space.regions().len(), count);
    }

    #[test]
    fn unmap_requires_exact_match() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        let obj = VmObject::anonymous(m, 2 * PAGE_SIZE).unwrap();
        let va = space.map_object(obj, VmProt::RW | VmProt::USER).unwrap();
        assert_eq!(space.unmap_region(va, PAGE_SIZE), Err(Error::NotFound));
        assert_eq!(
            space.unmap_region(va + PAGE_SIZE, PAGE_SIZE),
            Err(Error::NotFound)
        );
        assert_eq!(space.regions().len(), 1);
        space.unmap_region(va, 2 * PAGE_SIZE).unwrap();
        assert!(space.regions().is_empty());
    }

    #[test]
    fn fault_outside_any_region_is_unresolved() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        assert_eq!(
            space.handle_page_fault(0xdead_0000, FaultKind::Read),
            Err(FaultError::NoRegion)
        );
    }

    #[test]
    fn write_to_readonly_region_is_protection_fault() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        let obj = VmObject::anonymous(m, PAGE_SIZE).unwrap();
        let va = space
            .map_object(obj, VmProt::READ | VmProt::USER)
            .unwrap();
        assert_eq!(
            space.handle_page_fault(va, FaultKind::Write),
            Err(FaultError::Protection)
        );
        space.handle_page_fault(va, FaultKind::Read).unwrap();
    }

    #[test]
    fn fork_is_copy_on_write() {
        let m = MockFrames::new();
        let mut parent = user_space(m);
        let obj = VmObject::anonymous(m, PAGE_SIZE).unwrap();
        let va = parent.map_object(obj, VmProt::RW | VmProt::USER).unwrap();

        // 父进程先写入 0x1。
        parent.handle_page_fault(va, FaultKind::Write).unwrap();
        let parent_frame = parent.regions()[0].object().frame_at(0).unwrap();
        unsafe { *m.frame_ptr(parent_frame) = 0x1 };

        let mut child = parent.fork().unwrap();

        // 子进程读，看到父进程的页帧和数据，不复制。
        child.handle_page_fault(va, FaultKind::Read).unwrap();
        let shared = child.regions()[0].object().frame_at(0).unwrap();
        assert_eq!(shared, parent_frame);
        assert_eq!(unsafe { *m.frame_ptr(shared) }, 0x1);
        let frames = m.outstanding();

        // 子进程写，恰好复制一帧，父进程数据不动。
        child.handle_page_fault(va, FaultKind::Write).unwrap();
        let own = child.regions()[0].object().frame_at(0).unwrap();
        assert_ne!(own, parent_frame);
        assert_eq!(m.outstanding(), frames + 1);
        unsafe { *m.frame_ptr(own) = 0x2 };
        assert_eq!(unsafe { *m.frame_ptr(parent_frame) }, 0x1);
    }

    #[test]
    fn user_page_checks_protection() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        let obj = VmObject::anonymous(m, PAGE_SIZE).unwrap();
        let va = space
            .map_object(obj, VmProt::READ | VmProt::USER)
            .unwrap();
        assert!(space.user_page(va + 8, false).is_ok());
        assert_eq!(space.user_page(va + 8, true), Err(Error::BadAddress));
        assert_eq!(space.user_page(0x500, false), Err(Error::BadAddress));
    }

    #[test]
    fn kernel_regions_populate_eagerly() {
        let m = MockFrames::new();
        let mut space = AddressSpace::new(m, 0xd000_0000..0xf000_0000, 0xd000_0000..0xf000_0000)
            .unwrap();
        let obj = VmObject::anonymous(m, 2 * PAGE_SIZE).unwrap();
        let va = space.map_object(obj, VmProt::RW).unwrap();
        // 不经过缺页就已经有页帧。
        assert!(space.regions()[0].object().frame_at(0).is_some());
        assert!(space.regions()[0].object().frame_at(1).is_some());
        space.unmap_region(va, 2 * PAGE_SIZE).unwrap();
    }
}
