//! ELF32 装载。
//!
//! 只认 PT_LOAD 和 PT_INTERP，其余程序头一概跳过。
//! 每个装载段做成一个文件后备对象：前面是文件内容，
//! 其余零填充，页在缺页时私有地生产出来。

use crate::{fs, mem};
use alloc::string::String;
use kernel_vm::{AddressSpace, VmObject, VmProt};
use page_table::PAGE_SIZE;
use syscall::{Error, Result};
use xmas_elf::{
    header::{self, HeaderPt2, Machine},
    program, ElfFile,
};

/// 一次装载的结果。
pub struct LoadedImage {
    /// 程序入口。
    pub entry: usize,
    /// 装到的最高地址，即初始 program break。
    pub brk: usize,
}

/// 动态链接的可执行文件要换装它的解释器。
pub enum Loaded {
    /// 静态映像，段已经映射好。
    Image(LoadedImage),
    /// 指定了解释器，什么都还没映射，调用者改装解释器。
    Interp(String),
}

/// 校验并装载一个 ELF32 可执行文件。
pub fn load(space: &mut AddressSpace, module: &fs::Module) -> Result<Loaded> {
    let bytes = module.data;
    let elf = ElfFile::new(bytes).map_err(|_| Error::BadExecutable)?;

    // 32 位小端 x86 可执行文件，版本 1。
    if !matches!(elf.header.pt1.class(), header::Class::ThirtyTwo)
        || !matches!(elf.header.pt1.data(), header::Data::LittleEndian)
        || bytes.get(6) != Some(&1)
    {
        return Err(Error::BadExecutable);
    }
    let entry = match elf.header.pt2 {
        HeaderPt2::Header32(pt2)
            if pt2.type_.as_type() == header::Type::Executable
                && pt2.machine.as_machine() == Machine::X86 =>
        {
            pt2.entry_point as usize
        }
        _ => return Err(Error::BadExecutable),
    };

    // 先找解释器：有的话整个映像都交给它，这里不映射任何段。
    for ph in elf.program_iter() {
        if matches!(ph.get_type(), Ok(program::Type::Interp)) {
            let start = ph.offset() as usize;
            let end = start + ph.file_size() as usize;
            let raw = bytes.get(start..end).ok_or(Error::BadExecutable)?;
            let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
            let path = core::str::from_utf8(raw).map_err(|_| Error::BadExecutable)?;
            return Ok(Loaded::Interp(String::from(path)));
        }
    }

    let mut brk = 0;
    for ph in elf.program_iter() {
        if !matches!(ph.get_type(), Ok(program::Type::Load)) {
            continue;
        }
        let offset = ph.offset() as usize;
        let vaddr = ph.virtual_addr() as usize;
        let filesz = ph.file_size() as usize;
        let memsz = ph.mem_size() as usize;
        if filesz > memsz || offset + filesz > bytes.len() {
            return Err(Error::BadExecutable);
        }

        let page_off = vaddr % PAGE_SIZE;
        let object = VmObject::file_backed(
            mem::frames(),
            module.reader(),
            offset,
            page_off,
            filesz,
            memsz + page_off,
        )?;
        let mut prot = VmProt::USER | VmProt::READ;
        if ph.flags().is_write() {
            prot |= VmProt::WRITE;
        }
        if ph.flags().is_execute() {
            prot |= VmProt::EXEC;
        }
        space.map_object_at(object, vaddr - page_off, prot)?;
        brk = brk.max(vaddr + memsz);
    }
    Ok(Loaded::Image(LoadedImage { entry, brk }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{user_space, MockFrames};
    use alloc::vec::Vec;

    fn u16le(v: u16) -> [u8; 2] {
        v.to_le_bytes()
    }

    fn u32le(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    /// 手搓一个只有一个装载段的 ELF32 可执行文件。
    fn sample_elf() -> Vec<u8> {
        let mut image = alloc::vec![0u8; 0x1200];
        let mut at = 0;
        let mut put = |image: &mut Vec<u8>, bytes: &[u8]| {
            image[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        // e_ident
        put(&mut image, &[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        put(&mut image, &[0; 8]);
        put(&mut image, &u16le(2)); // ET_EXEC
        put(&mut image, &u16le(3)); // EM_386
        put(&mut image, &u32le(1)); // EV_CURRENT
        put(&mut image, &u32le(0x0804_8000)); // e_entry
        put(&mut image, &u32le(52)); // e_phoff
        put(&mut image, &u32le(0)); // e_shoff
        put(&mut image, &u32le(0)); // e_flags
        put(&mut image, &u16le(52)); // e_ehsize
        put(&mut image, &u16le(32)); // e_phentsize
        put(&mut image, &u16le(1)); // e_phnum
        put(&mut image, &u16le(40)); // e_shentsize
        put(&mut image, &u16le(0)); // e_shnum
        put(&mut image, &u16le(0)); // e_shstrndx
        // 唯一的程序头：PT_LOAD {0x1000, 0x08048000, filesz 0x200, memsz 0x1000, R|X}
        put(&mut image, &u32le(1));
        put(&mut image, &u32le(0x1000));
        put(&mut image, &u32le(0x0804_8000));
        put(&mut image, &u32le(0x0804_8000));
        put(&mut image, &u32le(0x200));
        put(&mut image, &u32le(0x1000));
        put(&mut image, &u32le(5));
        put(&mut image, &u32le(0x1000));
        // 段的文件内容。
        for (i, byte) in image[0x1000..0x1200].iter_mut().enumerate() {
            *byte = i as u8;
        }
        image
    }

    fn module_of(image: Vec<u8>) -> fs::Module {
        fs::Module {
            name: "sample",
            data: Vec::leak(image),
        }
    }

    #[test]
    fn load_places_file_bytes_and_zeroes() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        let module = module_of(sample_elf());
        let image = match load(&mut space, &module).unwrap() {
            Loaded::Image(image) => image,
            Loaded::Interp(_) => panic!("unexpected interpreter"),
        };
        assert_eq!(image.entry, 0x0804_8000);
        assert_eq!(image.brk, 0x0804_9000);

        // 文件窗口按字节可见，其余清零。
        let mut buf = alloc::vec![0u8; 0x1000];
        crate::uaccess::copy_from_user(&mut space, 0x0804_8000, &mut buf).unwrap();
        for (i, &byte) in buf[..0x200].iter().enumerate() {
            assert_eq!(byte, i as u8);
        }
        assert!(buf[0x200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_wrong_headers() {
        let m = MockFrames::new();
        let mut space = user_space(m);

        // 魔数破坏。
        let mut bad = sample_elf();
        bad[0] = 0;
        assert!(load(&mut space, &module_of(bad)).is_err());

        // 64 位。
        let mut bad = sample_elf();
        bad[4] = 2;
        assert!(load(&mut space, &module_of(bad)).is_err());

        // filesz > memsz 视为非法文件。
        let mut bad = sample_elf();
        bad[52 + 16..52 + 20].copy_from_slice(&u32le(0x2000));
        assert!(load(&mut space, &module_of(bad)).is_err());
    }

    #[test]
    fn interpreter_wins_before_any_mapping() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        // 把程序头改成 PT_INTERP，内容放一个 NUL 结尾的路径。
        let mut image = sample_elf();
        image[52..56].copy_from_slice(&u32le(3));
        image[52 + 16..52 + 20].copy_from_slice(&u32le(11));
        image[0x1000..0x100b].copy_from_slice(b"/lib/ld.so\0");
        let module = module_of(image);
        match load(&mut space, &module).unwrap() {
            Loaded::Interp(path) => assert_eq!(path, "/lib/ld.so"),
            Loaded::Image(_) => panic!("expected interpreter"),
        }
        assert!(space.regions().is_empty());
    }
}
