//! 页目录的构造与遍历。

use crate::{
    tlb, FrameManager, Ppn, Pte, PteFlags, VAddr, Vpn, ENTRIES, KERNEL_PDE_BASE, PAGE_BITS,
};

/// 建立映射失败的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// 目标虚页已有映射。
    AlreadyMapped,
    /// 页表页分配失败。
    OutOfMemory,
}

/// 一个地址空间的页目录。
///
/// 目录和各级页表各占一个页帧，从 [`FrameManager`] 取得。
/// 结构本身只记根表的物理页号，复制是浅的，所有权由地址空间约定。
pub struct PageDirectory {
    root: Ppn,
}

impl PageDirectory {
    /// 新建空页目录。
    pub fn new(m: &dyn FrameManager) -> Option<Self> {
        m.alloc_frame().map(|root| Self { root })
    }

    /// 根表物理页号。
    #[inline]
    pub const fn root(&self) -> Ppn {
        self.root
    }

    /// 装入 cr3 的物理地址。
    #[inline]
    pub const fn root_pa(&self) -> usize {
        self.root.0 << PAGE_BITS
    }

    /// 把某个物理页帧当作一张表访问。
    #[allow(clippy::mut_from_ref)]
    fn table_of<'a>(m: &dyn FrameManager, ppn: Ppn) -> &'a mut [Pte; ENTRIES] {
        unsafe { &mut *m.frame_ptr(ppn).cast() }
    }

    /// 查找叶子表项所在的表，`create` 时缺失的中间表会被补齐。
    fn leaf_table<'a>(
        &self,
        m: &dyn FrameManager,
        vpn: Vpn,
        create: bool,
    ) -> Option<&'a mut [Pte; ENTRIES]> {
        let root = Self::table_of(m, self.root);
        let pde = &mut root[vpn.pde_index()];
        if pde.is_present() {
            Some(Self::table_of(m, pde.ppn()))
        } else if create {
            let frame = m.alloc_frame()?;
            let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
            if vpn.pde_index() < KERNEL_PDE_BASE {
                flags |= PteFlags::USER;
            }
            *pde = Pte::new(frame, flags);
            Some(Self::table_of(m, frame))
        } else {
            None
        }
    }

    /// 建立一个映射，目标虚页必须还没有映射。
    pub fn map(
        &mut self,
        m: &dyn FrameManager,
        vpn: Vpn,
        ppn: Ppn,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        let table = self.leaf_table(m, vpn, true).ok_or(MapError::OutOfMemory)?;
        let pte = &mut table[vpn.pte_index()];
        if pte.is_present() {
            return Err(MapError::AlreadyMapped);
        }
        *pte = Pte::new(ppn, flags | PteFlags::PRESENT);
        tlb::flush_one(vpn.base().val());
        Ok(())
    }

    /// 覆盖一个映射，缺页处理用它更新升级过的表项。
    pub fn update(
        &mut self,
        m: &dyn FrameManager,
        vpn: Vpn,
        ppn: Ppn,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        let table = self.leaf_table(m, vpn, true).ok_or(MapError::OutOfMemory)?;
        table[vpn.pte_index()] = Pte::new(ppn, flags | PteFlags::PRESENT);
        tlb::flush_one(vpn.base().val());
        Ok(())
    }

    /// 取消一个映射，返回之前的表项内容。
    pub fn unmap(&mut self, m: &dyn FrameManager, vpn: Vpn) -> Option<(Ppn, PteFlags)> {
        let table = self.leaf_table(m, vpn, false)?;
        let pte = &mut table[vpn.pte_index()];
        if !pte.is_present() {
            return None;
        }
        let old = (pte.ppn(), pte.flags());
        *pte = Pte::EMPTY;
        tlb::flush_one(vpn.base().val());
        Some(old)
    }

    /// 查询一个映射。
    pub fn lookup(&self, m: &dyn FrameManager, vpn: Vpn) -> Option<(Ppn, PteFlags)> {
        let table = self.leaf_table(m, vpn, false)?;
        let pte = table[vpn.pte_index()];
        pte.is_present().then(|| (pte.ppn(), pte.flags()))
    }

    /// 检查属性要求，然后把虚地址翻译成内核可用的指针。
    pub fn translate(
        &self,
        m: &dyn FrameManager,
        addr: VAddr,
        required: PteFlags,
    ) -> Option<*mut u8> {
        let (ppn, flags) = self.lookup(m, addr.floor())?;
        flags
            .contains(required)
            .then(|| unsafe { m.frame_ptr(ppn).add(addr.offset()) })
    }

    /// 为内核半空间预分配全部页表。
    ///
    /// 内核页目录项此后不再改变，各地址空间共享这些表，
    /// 内核映射的增删因此自动对所有页目录可见。
    pub fn alloc_kernel_tables(&mut self, m: &dyn FrameManager) -> Option<()> {
        let root = Self::table_of(m, self.root);
        for pde in root[KERNEL_PDE_BASE..].iter_mut() {
            if !pde.is_present() {
                let frame = m.alloc_frame()?;
                *pde = Pte::new(frame, PteFlags::PRESENT | PteFlags::WRITABLE);
            }
        }
        Some(())
    }

    /// 把 `src` 的内核半空间别名到这个目录。
    pub fn share_kernel_half(&mut self, m: &dyn FrameManager, src: &PageDirectory) {
        let dst = Self::table_of(m, self.root);
        let from = Self::table_of(m, src.root);
        dst[KERNEL_PDE_BASE..].copy_from_slice(&from[KERNEL_PDE_BASE..]);
    }

    /// 释放用户半空间的页表页和根表。
    ///
    /// 叶子映射指向的页帧属于虚存对象，由对象自己回收。
    pub fn destroy(&mut self, m: &dyn FrameManager) {
        let root = Self::table_of(m, self.root);
        for pde in root[..KERNEL_PDE_BASE].iter_mut() {
            if pde.is_present() && !pde.flags().contains(PteFlags::LARGE) {
                m.release(pde.ppn());
                *pde = Pte::EMPTY;
            }
        }
        m.release(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameManager, Ppn, PteFlags, VAddr, Vpn, KERNEL_PDE_BASE, PAGE_SIZE};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// 用堆内存模拟物理页帧。
    pub struct MockFrames {
        inner: Mutex<Inner>,
    }

    struct Inner {
        frames: HashMap<usize, Box<[u8; PAGE_SIZE]>>,
        refs: HashMap<usize, u16>,
        next: usize,
    }

    impl MockFrames {
        pub fn new() -> &'static Self {
            Box::leak(Box::new(Self {
                inner: Mutex::new(Inner {
                    frames: HashMap::new(),
                    refs: HashMap::new(),
                    next: 1,
                }),
            }))
        }

        pub fn outstanding(&self) -> usize {
            self.inner.lock().unwrap().frames.len()
        }
    }

    impl FrameManager for MockFrames {
        fn alloc_frame(&self) -> Option<Ppn> {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner.next;
            inner.next += 1;
            inner.frames.insert(idx, Box::new([0; PAGE_SIZE]));
            inner.refs.insert(idx, 1);
            Some(Ppn(idx))
        }

        fn retain(&self, ppn: Ppn) {
            *self.inner.lock().unwrap().refs.get_mut(&ppn.0).unwrap() += 1;
        }

        fn release(&self, ppn: Ppn) -> bool {
            let mut inner = self.inner.lock().unwrap();
            let count = inner.refs.get_mut(&ppn.0).unwrap();
            *count -= 1;
            if *count == 0 {
                inner.refs.remove(&ppn.0);
                inner.frames.remove(&ppn.0);
                true
            } else {
                false
            }
        }

        fn frame_ptr(&self, ppn: Ppn) -> *mut u8 {
            self.inner.lock().unwrap().frames.get(&ppn.0).unwrap().as_ptr() as *mut u8
        }
    }

    #[test]
    fn map_lookup_unmap() {
        let m = MockFrames::new();
        let mut dir = PageDirectory::new(m).unwrap();
        let frame = m.alloc_frame().unwrap();
        let vpn = Vpn(0x1234);
        dir.map(m, vpn, frame, PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        let (ppn, flags) = dir.lookup(m, vpn).unwrap();
        assert_eq!(ppn, frame);
        assert!(flags.contains(PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER));
        assert_eq!(
            dir.map(m, vpn, frame, PteFlags::USER),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(dir.unmap(m, vpn).unwrap().0, frame);
        assert!(dir.lookup(m, vpn).is_none());
    }

    #[test]
    fn translate_keeps_offset_and_checks_flags() {
        let m = MockFrames::new();
        let mut dir = PageDirectory::new(m).unwrap();
        let frame = m.alloc_frame().unwrap();
        unsafe { *m.frame_ptr(frame).add(0x42) = 0xab };
        dir.map(m, Vpn(7), frame, PteFlags::USER).unwrap();
        let ptr = dir
            .translate(m, VAddr(7 * PAGE_SIZE + 0x42), PteFlags::PRESENT | PteFlags::USER)
            .unwrap();
        assert_eq!(unsafe { *ptr }, 0xab);
        assert!(dir
            .translate(m, VAddr(7 * PAGE_SIZE), PteFlags::WRITABLE)
            .is_none());
    }

    #[test]
    fn kernel_half_is_shared() {
        let m = MockFrames::new();
        let mut kernel = PageDirectory::new(m).unwrap();
        kernel.alloc_kernel_tables(m).unwrap();
        let mut user = PageDirectory::new(m).unwrap();
        user.share_kernel_half(m, &kernel);

        // 内核目录里建立的映射在用户目录中可见，反之亦然。
        let frame = m.alloc_frame().unwrap();
        let vpn = Vpn((KERNEL_PDE_BASE + 5) << 10);
        kernel.map(m, vpn, frame, PteFlags::WRITABLE).unwrap();
        assert_eq!(user.lookup(m, vpn).unwrap().0, frame);
        kernel.unmap(m, vpn).unwrap();
        assert!(user.lookup(m, vpn).is_none());
    }

    #[test]
    fn destroy_frees_tables() {
        let m = MockFrames::new();
        let before = m.outstanding();
        let mut dir = PageDirectory::new(m).unwrap();
        let frame = m.alloc_frame().unwrap();
        dir.map(m, Vpn(3), frame, PteFlags::USER).unwrap();
        dir.map(m, Vpn(5 << 10), frame, PteFlags::USER).unwrap();
        dir.update(m, Vpn(5 << 10), frame, PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();
        dir.destroy(m);
        m.release(frame);
        assert_eq!(m.outstanding(), before);
    }
}
