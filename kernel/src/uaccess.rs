//! 用户指针访问。
//!
//! 用户给的地址一律先按区域校验，再通过页帧的内核映射逐页拷贝。
//! 内核从不直接解引用用户虚地址，所以访问本身不会再触发缺页，
//! 校验失败统一折算成 EFAULT。

use alloc::{string::String, vec::Vec};
use kernel_vm::AddressSpace;
use syscall::{Error, Result};

/// 从用户空间拷贝 `buf.len()` 字节。
pub fn copy_from_user(space: &mut AddressSpace, mut va: usize, buf: &mut [u8]) -> Result<()> {
    let mut copied = 0;
    while copied < buf.len() {
        let (ptr, len) = space.user_page(va, false)?;
        let count = len.min(buf.len() - copied);
        unsafe { core::ptr::copy_nonoverlapping(ptr, buf[copied..].as_mut_ptr(), count) };
        copied += count;
        va += count;
    }
    Ok(())
}

/// 向用户空间拷贝 `data` 的全部字节。
pub fn copy_to_user(space: &mut AddressSpace, mut va: usize, data: &[u8]) -> Result<()> {
    let mut copied = 0;
    while copied < data.len() {
        let (ptr, len) = space.user_page(va, true)?;
        let count = len.min(data.len() - copied);
        unsafe { core::ptr::copy_nonoverlapping(data[copied..].as_ptr(), ptr, count) };
        copied += count;
        va += count;
    }
    Ok(())
}

/// 读一个定长标量，允许跨页。
pub fn read_value<T: Copy>(space: &mut AddressSpace, va: usize) -> Result<T> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    let buf = unsafe {
        core::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
    };
    copy_from_user(space, va, buf)?;
    Ok(unsafe { value.assume_init() })
}

/// 写一个定长标量。
pub fn write_value<T: Copy>(space: &mut AddressSpace, va: usize, value: T) -> Result<()> {
    let buf = unsafe {
        core::slice::from_raw_parts(&value as *const T as *const u8, core::mem::size_of::<T>())
    };
    copy_to_user(space, va, buf)
}

/// 读 NUL 结尾的字符串，超长按参数无效处理。
pub fn read_cstr(space: &mut AddressSpace, mut va: usize, max: usize) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte: u8 = read_value(space, va)?;
        if byte == 0 {
            break;
        }
        if bytes.len() >= max {
            return Err(Error::InvalidArgument);
        }
        bytes.push(byte);
        va += 1;
    }
    String::from_utf8(bytes).map_err(|_| Error::InvalidArgument)
}

/// 读 NULL 结尾的指针数组，比如 argv 和 envp。指针为 0 的数组基址视为空表。
pub fn read_ptr_array(space: &mut AddressSpace, va: usize, max: usize) -> Result<Vec<usize>> {
    let mut ptrs = Vec::new();
    if va == 0 {
        return Ok(ptrs);
    }
    loop {
        let ptr: u32 = read_value(space, va + ptrs.len() * 4)?;
        if ptr == 0 {
            return Ok(ptrs);
        }
        if ptrs.len() >= max {
            return Err(Error::InvalidArgument);
        }
        ptrs.push(ptr as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{user_space, MockFrames};
    use kernel_vm::{VmObject, VmProt};
    use page_table::PAGE_SIZE;

    #[test]
    fn round_trip_across_page_boundary() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        let obj = VmObject::anonymous(m, 2 * PAGE_SIZE).unwrap();
        let va = space.map_object(obj, VmProt::RW | VmProt::USER).unwrap();

        let data: Vec<u8> = (0..256).map(|x| x as u8).collect();
        let at = va + PAGE_SIZE - 100;
        copy_to_user(&mut space, at, &data).unwrap();
        let mut back = vec![0u8; 256];
        copy_from_user(&mut space, at, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn rejects_unmapped_and_readonly() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        assert_eq!(
            copy_to_user(&mut space, 0xdead_0000, &[1]),
            Err(Error::BadAddress)
        );
        let obj = VmObject::anonymous(m, PAGE_SIZE).unwrap();
        let va = space
            .map_object(obj, VmProt::READ | VmProt::USER)
            .unwrap();
        assert_eq!(copy_to_user(&mut space, va, &[1]), Err(Error::BadAddress));
        assert!(read_value::<u8>(&mut space, va).is_ok());
    }

    #[test]
    fn cstr_and_ptr_array() {
        let m = MockFrames::new();
        let mut space = user_space(m);
        let obj = VmObject::anonymous(m, PAGE_SIZE).unwrap();
        let va = space.map_object(obj, VmProt::RW | VmProt::USER).unwrap();

        copy_to_user(&mut space, va, b"hello\0").unwrap();
        assert_eq!(read_cstr(&mut space, va, 64).unwrap(), "hello");

        // [va, 0]：一个元素的指针数组。
        write_value::<u32>(&mut space, va + 0x100, va as u32).unwrap();
        write_value::<u32>(&mut space, va + 0x104, 0).unwrap();
        assert_eq!(
            read_ptr_array(&mut space, va + 0x100, 8).unwrap(),
            vec![va]
        );
        assert!(read_ptr_array(&mut space, 0, 8).unwrap().is_empty());
    }
}
