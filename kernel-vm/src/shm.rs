//! 共享内存注册表。
//!
//! 匿名对象以整数编号发布，按进程记录访问权限。
//! 注册表只管权限和查找，映射仍由各进程的地址空间完成。

use crate::{object::VmObject, VmProt};
use alloc::{collections::BTreeMap, sync::Arc};
use page_table::FrameManager;
use syscall::{Error, Result};

struct ShmEntry {
    object: Arc<VmObject>,
    creator: usize,
    /// pid 到授予的保护属性。
    perms: BTreeMap<usize, VmProt>,
}

/// 共享内存注册表。
///
/// 编号单调递增。某个进程解除映射只摘掉它自己的权限项，
/// 最后一个权限项消失时摘掉整个表项，对象在最后一个区域
/// 放弃引用时回收，其他持有者不受单次 detach 影响。
pub struct ShmRegistry {
    entries: BTreeMap<i32, ShmEntry>,
    next_id: i32,
}

impl ShmRegistry {
    /// 新建空注册表。
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// 创建并发布一个匿名对象。
    ///
    /// 创建者无条件获得读写权限。
    pub fn create(
        &mut self,
        m: &'static dyn FrameManager,
        pid: usize,
        size: usize,
    ) -> Result<(Arc<VmObject>, i32)> {
        let id = self.next_id;
        let object = VmObject::shared(m, id, size)?;
        self.next_id += 1;
        let mut perms = BTreeMap::new();
        perms.insert(pid, VmProt::RW);
        self.entries.insert(
            id,
            ShmEntry {
                object: object.clone(),
                creator: pid,
                perms,
            },
        );
        Ok((object, id))
    }

    /// 查找编号对应的对象和调用者被授予的权限。
    ///
    /// 编号不存在和没被授权同样返回 NotFound，不泄露编号是否存在。
    pub fn attach(&self, id: i32, pid: usize) -> Result<(Arc<VmObject>, VmProt)> {
        let entry = self.entries.get(&id).ok_or(Error::NotFound)?;
        let prot = entry.perms.get(&pid).ok_or(Error::NotFound)?;
        Ok((entry.object.clone(), *prot))
    }

    /// 授予 `pid` 访问权限，只有创建者可以授予。
    pub fn allow(&mut self, id: i32, caller: usize, pid: usize, prot: VmProt) -> Result<()> {
        if !prot.contains(VmProt::READ) {
            return Err(Error::InvalidArgument);
        }
        let entry = self.entries.get_mut(&id).ok_or(Error::NotFound)?;
        if entry.creator != caller {
            return Err(Error::PermissionDenied);
        }
        entry.perms.insert(pid, prot);
        Ok(())
    }

    /// 摘掉 `pid` 对 `id` 的权限项。
    pub fn detach(&mut self, pid: usize, id: i32) -> Result<()> {
        let entry = self.entries.get_mut(&id).ok_or(Error::NotFound)?;
        entry.perms.remove(&pid).ok_or(Error::NotFound)?;
        if entry.perms.is_empty() {
            self.entries.remove(&id);
        }
        Ok(())
    }

    /// 进程结束时摘掉它的所有权限项。
    pub fn remove_process(&mut self, pid: usize) {
        self.entries.retain(|_, entry| {
            entry.perms.remove(&pid);
            !entry.perms.is_empty()
        });
    }
}

impl Default for ShmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::MockFrames;
    use crate::{AddressSpace, FaultKind};
    use page_table::{KERNEL_BASE, PAGE_SIZE};

    fn user_space(m: &'static MockFrames) -> AddressSpace {
        AddressSpace::new(m, 0x1000..KERNEL_BASE, 0x1000_0000..0xb000_0000).unwrap()
    }

    #[test]
    fn handshake_between_two_processes() {
        let m = MockFrames::new();
        let before = m.outstanding();
        let mut registry = ShmRegistry::new();
        let mut space_a = user_space(m);
        let mut space_b = user_space(m);

        // A 创建并映射。
        let (object, id) = registry.create(m, 1, PAGE_SIZE).unwrap();
        let va_a = space_a
            .map_object(object, crate::VmProt::RW | crate::VmProt::USER)
            .unwrap();

        // 没授权前 B 连编号都看不见。
        assert_eq!(registry.attach(id, 2).err(), Some(Error::NotFound));

        // 授权后 B 映射到同一个对象。
        registry
            .allow(id, 1, 2, crate::VmProt::RW)
            .unwrap();
        let (object_b, prot) = registry.attach(id, 2).unwrap();
        assert_eq!(prot, crate::VmProt::RW);
        let va_b = space_b
            .map_object(object_b, prot | crate::VmProt::USER)
            .unwrap();

        // A 写入的数据 B 能读到：两边缺页后指向同一个页帧。
        space_a.handle_page_fault(va_a, FaultKind::Write).unwrap();
        space_b.handle_page_fault(va_b, FaultKind::Read).unwrap();
        let frame_a = space_a.regions()[0].object().frame_at(0).unwrap();
        let frame_b = space_b.regions()[0].object().frame_at(0).unwrap();
        assert_eq!(frame_a, frame_b);
        unsafe { *(m.frame_ptr(frame_a) as *mut u32) = 0xdead_beef };
        assert_eq!(unsafe { *(m.frame_ptr(frame_b) as *const u32) }, 0xdead_beef);

        // 先后 detach，对象随最后一个区域消失，页帧全部归还。
        space_a.unmap_region(va_a, PAGE_SIZE).unwrap();
        registry.detach(1, id).unwrap();
        assert!(registry.attach(id, 2).is_ok());
        space_b.unmap_region(va_b, PAGE_SIZE).unwrap();
        registry.detach(2, id).unwrap();
        assert_eq!(registry.attach(id, 2).err(), Some(Error::NotFound));
        drop(space_a);
        drop(space_b);
        assert_eq!(m.outstanding(), before);
    }

    #[test]
    fn allow_rules() {
        let m = MockFrames::new();
        let mut registry = ShmRegistry::new();
        let (_object, id) = registry.create(m, 1, PAGE_SIZE).unwrap();

        // 无读权限的授予、非创建者的授予都被拒绝。
        assert_eq!(
            registry.allow(id, 1, 2, crate::VmProt::WRITE),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            registry.allow(id, 3, 2, crate::VmProt::RW),
            Err(Error::PermissionDenied)
        );
        assert_eq!(
            registry.allow(7777, 1, 2, crate::VmProt::RW),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn ids_are_monotonic() {
        let m = MockFrames::new();
        let mut registry = ShmRegistry::new();
        let (_, a) = registry.create(m, 1, PAGE_SIZE).unwrap();
        let (_, b) = registry.create(m, 1, PAGE_SIZE).unwrap();
        assert!(b > a);
    }

    #[test]
    fn process_cleanup_detaches_everywhere() {
        let m = MockFrames::new();
        let mut registry = ShmRegistry::new();
        let (_, id1) = registry.create(m, 1, PAGE_SIZE).unwrap();
        let (_, id2) = registry.create(m, 1, PAGE_SIZE).unwrap();
        registry.allow(id2, 1, 2, crate::VmProt::RW).unwrap();
        registry.remove_process(1);
        assert_eq!(registry.attach(id1, 1).err(), Some(Error::NotFound));
        // id2 还有 pid 2 的权限项，保持存在。
        assert!(registry.attach(id2, 2).is_ok());
    }
}
