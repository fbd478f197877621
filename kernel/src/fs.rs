//! 可执行文件的来源。
//!
//! 块设备和真正的文件系统都在核心之外，核心只需要
//! “按路径打开、按偏移读字节”。引导模块正好满足这个接口，
//! GRUB 把 init 等程序当作模块装进内存。

use alloc::{sync::Arc, vec::Vec};
use kernel_vm::ReadAt;
use linker::MultibootInfo;
use spin::Once;
use syscall::Result;

/// 一个引导模块就是一个只读文件。
pub struct Module {
    /// 引导器附带的路径。
    pub name: &'static str,
    /// 文件内容。
    pub data: &'static [u8],
}

impl Module {
    /// 提供给虚存对象的读取接口。
    pub fn reader(&self) -> Arc<dyn ReadAt> {
        Arc::new(ModuleReader(self.data))
    }
}

struct ModuleReader(&'static [u8]);

impl ReadAt for ModuleReader {
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

static MODULES: Once<Vec<Module>> = Once::new();

/// 登记引导模块。
pub fn init(info: &MultibootInfo) {
    let mut modules = Vec::new();
    for module in info.modules() {
        log::info!(
            "module {:?}: {} KiB at {:#x}",
            module.string,
            module.p_range.len() >> 10,
            module.p_range.start,
        );
        modules.push(Module {
            name: module.string,
            data: module.bytes(),
        });
    }
    MODULES.call_once(|| modules);
}

/// 按路径找一个模块，全路径或文件名都可以。
pub fn open(path: &str) -> Option<&'static Module> {
    let modules = MODULES.get()?;
    modules
        .iter()
        .find(|m| m.name == path)
        .or_else(|| {
            let base = path.rsplit('/').next()?;
            modules
                .iter()
                .find(|m| m.name.rsplit('/').next() == Some(base))
        })
}

/// 进程打开的一个文件。
///
/// fork 时整表复制，exec 时丢掉设了 close-on-exec 的表项。
#[derive(Clone)]
pub struct FileHandle {
    /// 内容来源。
    pub file: Arc<dyn ReadAt>,
    /// exec 时关闭。
    pub close_on_exec: bool,
}
