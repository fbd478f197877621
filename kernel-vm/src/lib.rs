//! 内核虚存管理。
//!
//! 虚存对象提供页的内容，区域把对象绑定到一段虚地址，
//! 地址空间维护互不相交的区域并服务缺页。

#![cfg_attr(not(test), no_std)]
#![deny(warnings, missing_docs)]

mod object;
mod shm;
mod space;

extern crate alloc;

pub use object::{ReadAt, VmObject};
pub use shm::ShmRegistry;
pub use space::{AddressSpace, FaultError, FaultKind, VmRegion};

use bitflags::bitflags;
use page_table::PteFlags;

bitflags! {
    /// 映射保护属性。
    pub struct VmProt: u8 {
        /// 可读。
        const READ = 1 << 0;
        /// 可写。
        const WRITE = 1 << 1;
        /// 可执行。x86 保护模式无法单独禁止取指，仅作记录。
        const EXEC = 1 << 2;
        /// 用户态映射。
        const USER = 1 << 3;
        /// 可读可写。
        const RW = Self::READ.bits | Self::WRITE.bits;
    }
}

impl VmProt {
    /// 折算成页表属性位。
    ///
    /// `writable` 单独给出：写时复制的共享页即使区域可写也先装成只读。
    pub fn pte_flags(self, writable: bool) -> PteFlags {
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        if self.contains(Self::USER) {
            flags |= PteFlags::USER;
        } else {
            flags |= PteFlags::GLOBAL;
        }
        flags
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::ReadAt;
    use page_table::{FrameManager, Ppn, PAGE_SIZE};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use syscall::Result;

    /// 用堆内存模拟物理页帧，统计在外的页帧数。
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

        /// 尚未归还的页帧数。
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

    /// 一段内存模拟的文件。
    pub struct SliceFile(pub Vec<u8>);

    impl ReadAt for SliceFile {
        fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
            let end = (offset + buf.len()).min(self.0.len());
            if offset >= end {
                return Ok(0);
            }
            let count = end - offset;
            buf[..count].copy_from_slice(&self.0[offset..end]);
            Ok(count)
        }
    }
}
