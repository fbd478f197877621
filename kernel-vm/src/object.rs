//! 虚存对象：映射的后备存储。

use alloc::{sync::Arc, vec, vec::Vec};
use page_table::{FrameManager, Ppn, PAGE_SIZE};
use spin::Mutex;
use syscall::{Error, Result};

/// 按偏移读取字节的能力。
///
/// 文件系统在核心之外，核心只要求“从某个偏移读出若干字节”。
pub trait ReadAt: Send + Sync {
    /// 从 `offset` 读取字节填满 `buf`，返回读到的长度。
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize>;
}

/// 一个页槽的状态。
#[derive(Clone, Copy)]
enum Slot {
    /// 还没有内容。
    Empty,
    /// 与父对象共享的页帧，写入前要复制。
    Shared(Ppn),
    /// 本对象独占的页帧。
    Private(Ppn),
}

/// 页内容的来源。
enum Backing {
    /// 零填充的匿名内存。
    Anonymous,
    /// 发布到共享内存注册表的匿名内存。
    Shared {
        /// 注册表里的编号。
        id: i32,
    },
    /// 文件内容，只读来源。
    ///
    /// 对象偏移 `skip` 之前是零，接下来 `len` 字节来自 `source`
    /// 的 `offset` 处，其余仍是零。页一旦填好就归对象私有。
    File {
        source: Arc<dyn ReadAt>,
        offset: usize,
        skip: usize,
        len: usize,
    },
    /// 写时复制的父对象。
    Cow { parent: Arc<VmObject> },
}

/// 虚存对象。
///
/// 大小固定为整页，页槽懒填充。对象通过 `Arc` 被区域共享，
/// 最后一个引用消失时释放占用的页帧。
pub struct VmObject {
    m: &'static dyn FrameManager,
    size: usize,
    backing: Backing,
    pages: Mutex<Vec<Slot>>,
}

/// 单个对象的大小上限，挡住荒唐的分配请求。
const MAX_OBJECT_SIZE: usize = 64 << 20;

impl VmObject {
    fn new(m: &'static dyn FrameManager, size: usize, backing: Backing) -> Result<Arc<Self>> {
        if size == 0 || size > MAX_OBJECT_SIZE {
            return Err(Error::InvalidArgument);
        }
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Ok(Arc::new(Self {
            m,
            size,
            backing,
            pages: Mutex::new(vec![Slot::Empty; size / PAGE_SIZE]),
        }))
    }

    /// 新建匿名对象。
    pub fn anonymous(m: &'static dyn FrameManager, size: usize) -> Result<Arc<Self>> {
        Self::new(m, size, Backing::Anonymous)
    }

    /// 新建发布到注册表的匿名对象。
    pub fn shared(m: &'static dyn FrameManager, id: i32, size: usize) -> Result<Arc<Self>> {
        Self::new(m, size, Backing::Shared { id })
    }

    /// 新建文件后备对象。
    pub fn file_backed(
        m: &'static dyn FrameManager,
        source: Arc<dyn ReadAt>,
        offset: usize,
        skip: usize,
        len: usize,
        size: usize,
    ) -> Result<Arc<Self>> {
        Self::new(
            m,
            size,
            Backing::File {
                source,
                offset,
                skip,
                len,
            },
        )
    }

    /// 以 `parent` 为后备新建写时复制对象。
    pub fn cow(parent: &Arc<Self>) -> Result<Arc<Self>> {
        Self::new(
            parent.m,
            parent.size,
            Backing::Cow {
                parent: parent.clone(),
            },
        )
    }

    /// 对象字节数，整页。
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// 页数。
    #[inline]
    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// 共享内存编号，只有发布过的对象才有。
    pub fn shm_id(&self) -> Option<i32> {
        match self.backing {
            Backing::Shared { id } => Some(id),
            _ => None,
        }
    }

    /// 读取某页的页帧，没有就生产出来。
    ///
    /// 返回 `(页帧, 是否独占)`。共享页帧写入前必须经过
    /// [`write_fault`](Self::write_fault)，装载时也只能装成只读。
    /// 对同一个下标重复调用返回同一个页帧。
    pub fn read_page(&self, index: usize) -> Result<(Ppn, bool)> {
        let mut pages = self.pages.lock();
        match pages[index] {
            Slot::Private(ppn) => Ok((ppn, true)),
            Slot::Shared(ppn) => Ok((ppn, false)),
            Slot::Empty => {
                let (slot, ppn, private) = self.produce(index)?;
                pages[index] = slot;
                Ok((ppn, private))
            }
        }
    }

    /// 为写访问取得页帧。
    ///
    /// 写时复制对象把共享页复制成私有页，其余对象的页本来就私有。
    pub fn write_fault(&self, index: usize) -> Result<Ppn> {
        let parent = match &self.backing {
            Backing::Cow { parent } => parent,
            _ => return self.read_page(index).map(|(ppn, _)| ppn),
        };
        let mut pages = self.pages.lock();
        match pages[index] {
            Slot::Private(ppn) => Ok(ppn),
            Slot::Shared(shared) => {
                let own = self.copy_frame(shared)?;
                // 归还父对象的页帧，换成自己的副本。
                self.m.release(shared);
                pages[index] = Slot::Private(own);
                Ok(own)
            }
            Slot::Empty => {
                let (src, _) = parent.read_page(index)?;
                let own = self.copy_frame(src)?;
                pages[index] = Slot::Private(own);
                Ok(own)
            }
        }
    }

    /// 某页当前占用的页帧，不触发生产。
    pub fn frame_at(&self, index: usize) -> Option<Ppn> {
        match self.pages.lock()[index] {
            Slot::Empty => None,
            Slot::Shared(ppn) | Slot::Private(ppn) => Some(ppn),
        }
    }

    /// 生产一个空槽的内容。
    fn produce(&self, index: usize) -> Result<(Slot, Ppn, bool)> {
        match &self.backing {
            Backing::Anonymous | Backing::Shared { .. } => {
                let frame = self.m.alloc_frame().ok_or(Error::OutOfMemory)?;
                Ok((Slot::Private(frame), frame, true))
            }
            Backing::File {
                source,
                offset,
                skip,
                len,
            } => {
                let frame = self.m.alloc_frame().ok_or(Error::OutOfMemory)?;
                if let Err(e) = self.fill_from_file(frame, index, source, *offset, *skip, *len) {
                    self.m.release(frame);
                    return Err(e);
                }
                Ok((Slot::Private(frame), frame, true))
            }
            Backing::Cow { parent } => {
                let (frame, _) = parent.read_page(index)?;
                self.m.retain(frame);
                Ok((Slot::Shared(frame), frame, false))
            }
        }
    }

    /// 把文件内容填进页帧，页帧已经清零，只需拷贝相交的窗口。
    fn fill_from_file(
        &self,
        frame: Ppn,
        index: usize,
        source: &Arc<dyn ReadAt>,
        offset: usize,
        skip: usize,
        len: usize,
    ) -> Result<()> {
        let page_start = index * PAGE_SIZE;
        let copy_start = page_start.max(skip);
        let copy_end = (page_start + PAGE_SIZE).min(skip + len);
        if copy_start < copy_end {
            let count = copy_end - copy_start;
            let buf = unsafe {
                core::slice::from_raw_parts_mut(
                    self.m.frame_ptr(frame).add(copy_start - page_start),
                    count,
                )
            };
            if source.read_at(offset + (copy_start - skip), buf)? != count {
                return Err(Error::Io);
            }
        }
        Ok(())
    }

    /// 复制一个页帧的内容到新页帧。
    fn copy_frame(&self, src: Ppn) -> Result<Ppn> {
        let frame = self.m.alloc_frame().ok_or(Error::OutOfMemory)?;
        unsafe {
            core::ptr::copy_nonoverlapping(self.m.frame_ptr(src), self.m.frame_ptr(frame), PAGE_SIZE)
        };
        Ok(frame)
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        for slot in self.pages.get_mut().iter() {
            if let Slot::Shared(ppn) | Slot::Private(ppn) = *slot {
                self.m.release(ppn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockFrames;

    #[test]
    fn anonymous_pages_are_lazy_and_cached() {
        let m = MockFrames::new();
        let before = m.outstanding();
        let obj = VmObject::anonymous(m, 3 * PAGE_SIZE).unwrap();
        assert_eq!(m.outstanding(), before);
        let (a, private) = obj.read_page(0).unwrap();
        assert!(private);
        let (b, _) = obj.read_page(0).unwrap();
        assert_eq!(a, b);
        assert_eq!(m.outstanding(), before + 1);
        drop(obj);
        assert_eq!(m.outstanding(), before);
    }

    #[test]
    fn size_zero_is_rejected_and_sizes_round_up() {
        let m = MockFrames::new();
        assert!(VmObject::anonymous(m, 0).is_err());
        let obj = VmObject::anonymous(m, PAGE_SIZE + 1).unwrap();
        assert_eq!(obj.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn cow_shares_until_write() {
        let m = MockFrames::new();
        let parent = VmObject::anonymous(m, 2 * PAGE_SIZE).unwrap();
        // 父对象第 0 页写入 0x1。
        let first = parent.write_fault(0).unwrap();
        unsafe { *m.frame_ptr(first) = 0x1 };

        let child = VmObject::cow(&parent).unwrap();
        let frames = m.outstanding();

        // 子对象读到父对象的页帧和内容，不新增页帧。
        let (shared, private) = child.read_page(0).unwrap();
        assert_eq!(shared, first);
        assert!(!private);
        assert_eq!(unsafe { *m.frame_ptr(shared) }, 0x1);
        assert_eq!(m.outstanding(), frames);

        // 子对象写入才复制，且恰好多一帧。
        let own = child.write_fault(0).unwrap();
        assert_ne!(own, first);
        assert_eq!(m.outstanding(), frames + 1);
        unsafe { *m.frame_ptr(own) = 0x2 };
        assert_eq!(unsafe { *m.frame_ptr(first) }, 0x1);

        drop(child);
        drop(parent);
    }

    #[test]
    fn file_pages_copy_window_and_zero_fill() {
        let m = MockFrames::new();
        let content: Vec<u8> = (0..0x200u32).map(|x| x as u8).collect();
        let mut file = vec![0xeeu8; 0x40];
        file.extend_from_slice(&content);
        let source: Arc<dyn ReadAt> = Arc::new(crate::tests::SliceFile(file));
        // 模拟装载：页内偏移 0x100 开始放文件 0x40 处的 0x200 字节。
        let obj = VmObject::file_backed(m, source, 0x40, 0x100, 0x200, PAGE_SIZE).unwrap();
        let (frame, _) = obj.read_page(0).unwrap();
        let page = unsafe { core::slice::from_raw_parts(m.frame_ptr(frame), PAGE_SIZE) };
        assert!(page[..0x100].iter().all(|&b| b == 0));
        assert_eq!(&page[0x100..0x300], &content[..]);
        assert!(page[0x300..].iter().all(|&b| b == 0));
    }
}
