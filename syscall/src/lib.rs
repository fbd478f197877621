//! 系统调用 ABI。
//!
//! 两侧共用的调用号、错误码和跨边界结构都定义在这里，
//! 内核侧的分发接口和用户侧的触发指令分别由 feature 提供。

#![cfg_attr(not(test), no_std)]
#![deny(warnings)]

#[cfg(all(feature = "kernel", feature = "user"))]
compile_error!("You can only use one of `kernel` or `user` features at a time");

#[cfg(feature = "kernel")]
mod kernel;

#[cfg(feature = "kernel")]
pub use kernel::*;

#[cfg(feature = "user")]
mod user;

#[cfg(feature = "user")]
pub use user::*;

use bitflags::bitflags;

/// 系统调用号，触发中断时放在 eax。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct SyscallId(pub usize);

impl SyscallId {
    /// 结束当前进程。
    pub const EXIT: Self = Self(1);
    /// 复制当前进程。
    pub const FORK: Self = Self(2);
    /// 替换当前进程映像。
    pub const EXECVE: Self = Self(3);
    /// 等待子进程结束。
    pub const WAITPID: Self = Self(4);
    /// 当前进程号。
    pub const GETPID: Self = Self(5);
    /// 终止一个进程。
    pub const KILL: Self = Self(6);
    /// 主动让出处理器。
    pub const YIELD: Self = Self(7);
    /// 映射匿名内存。
    pub const MEMACQUIRE: Self = Self(20);
    /// 取消匿名内存映射。
    pub const MEMRELEASE: Self = Self(21);
    /// 创建共享内存对象并映射。
    pub const SHMCREATE: Self = Self(30);
    /// 映射一个共享内存对象。
    pub const SHMATTACH: Self = Self(31);
    /// 取消共享内存映射。
    pub const SHMDETACH: Self = Self(32);
    /// 授予其他进程访问共享内存的权限。
    pub const SHMALLOW: Self = Self(33);
}

impl From<usize> for SyscallId {
    #[inline]
    fn from(v: usize) -> Self {
        Self(v)
    }
}

/// 内核错误，穿过系统调用边界时折算成负 errno。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// 物理内存耗尽。
    OutOfMemory,
    /// 参数无效。
    InvalidArgument,
    /// 目标不存在。
    NotFound,
    /// 读写失败。
    Io,
    /// 权限不足。
    PermissionDenied,
    /// 不是本机可执行文件。
    BadExecutable,
    /// 地址不在调用者可访问的区域内。
    BadAddress,
    /// 目标已存在。
    Exists,
    /// 没有这个进程。
    NoProcess,
    /// 没有可等待的子进程。
    NoChild,
}

impl Error {
    /// 对应的 errno 数值。
    pub const fn errno(self) -> isize {
        match self {
            Self::PermissionDenied => errno::EPERM,
            Self::NotFound => errno::ENOENT,
            Self::NoProcess => errno::ESRCH,
            Self::Io => errno::EIO,
            Self::BadExecutable => errno::ENOEXEC,
            Self::NoChild => errno::ECHILD,
            Self::OutOfMemory => errno::ENOMEM,
            Self::BadAddress => errno::EFAULT,
            Self::Exists => errno::EEXIST,
            Self::InvalidArgument => errno::EINVAL,
        }
    }
}

/// 贯穿内核的结果类型。
pub type Result<T> = core::result::Result<T, Error>;

/// 把内核结果折算成系统调用返回值。
#[inline]
pub fn as_ret(result: Result<usize>) -> isize {
    match result {
        Ok(v) => v as isize,
        Err(e) => -e.errno(),
    }
}

/// errno 数值，和 C 库约定一致。
pub mod errno {
    #![allow(missing_docs)]

    pub const EPERM: isize = 1;
    pub const ENOENT: isize = 2;
    pub const ESRCH: isize = 3;
    pub const EIO: isize = 5;
    pub const ENOEXEC: isize = 8;
    pub const ECHILD: isize = 10;
    pub const ENOMEM: isize = 12;
    pub const EACCES: isize = 13;
    pub const EFAULT: isize = 14;
    pub const EEXIST: isize = 17;
    pub const EINVAL: isize = 22;
    pub const ENOSYS: isize = 38;
}

/// 共享内存句柄。
///
/// 字段顺序就是 ABI：`{ ptr, size, id }`，两侧必须一致。
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shm {
    /// 映射进调用者空间的起始地址。
    pub ptr: usize,
    /// 区域字节数。
    pub size: usize,
    /// 对象编号。
    pub id: i32,
}

bitflags! {
    /// `shmallow` 的权限字。
    pub struct ShmPerm: usize {
        /// 可读。
        const READ = 1 << 0;
        /// 可写。
        const WRITE = 1 << 1;
        /// 允许转授，保留位，尚不支持。
        const SHARE = 1 << 2;
    }
}

impl ShmPerm {
    /// 校验权限字。
    ///
    /// 必须包含 READ，写权限依赖读权限，SHARE 暂不支持。
    pub fn validate(bits: usize) -> Result<Self> {
        let perm = Self::from_bits(bits).ok_or(Error::InvalidArgument)?;
        if perm.contains(Self::SHARE) || !perm.contains(Self::READ) {
            return Err(Error::InvalidArgument);
        }
        Ok(perm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn shm_layout_is_the_documented_abi() {
        assert_eq!(offset_of!(Shm, ptr), 0);
        assert_eq!(offset_of!(Shm, size), size_of::<usize>());
        assert_eq!(offset_of!(Shm, id), 2 * size_of::<usize>());
    }

    #[test]
    fn errno_signs() {
        assert_eq!(as_ret(Ok(7)), 7);
        assert_eq!(as_ret(Err(Error::OutOfMemory)), -errno::ENOMEM);
        assert_eq!(as_ret(Err(Error::NotFound)), -errno::ENOENT);
    }

    #[test]
    fn shm_perm_rules() {
        assert!(ShmPerm::validate(ShmPerm::READ.bits()).is_ok());
        assert!(ShmPerm::validate((ShmPerm::READ | ShmPerm::WRITE).bits()).is_ok());
        // 只写不读、转授、越界的位都被拒绝。
        assert_eq!(
            ShmPerm::validate(ShmPerm::WRITE.bits()),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            ShmPerm::validate((ShmPerm::READ | ShmPerm::SHARE).bits()),
            Err(Error::InvalidArgument)
        );
        assert_eq!(ShmPerm::validate(1 << 7), Err(Error::InvalidArgument));
    }
}
