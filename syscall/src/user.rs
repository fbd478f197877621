//! 用户侧的系统调用触发。
//!
//! 调用号放在 eax，参数依次放在 ebx、ecx、edx、esi、edi，
//! 以 `int 0x80` 进入内核，返回值从 eax 取回，负值是 errno。

use crate::{Shm, SyscallId};

/// 结束当前进程。
#[inline]
pub fn sys_exit(exit_code: i32) -> isize {
    unsafe { syscall1(SyscallId::EXIT, exit_code as _) }
}

/// 复制当前进程。
#[inline]
pub fn sys_fork() -> isize {
    unsafe { syscall0(SyscallId::FORK) }
}

/// 替换当前进程映像，参数都是 NUL 结尾的 C 字符串。
#[inline]
pub fn sys_execve(path: *const u8, argv: *const *const u8, envp: *const *const u8) -> isize {
    unsafe { syscall3(SyscallId::EXECVE, path as _, argv as _, envp as _) }
}

/// 等待子进程结束，`pid` 为 -1 表示任意子进程。
#[inline]
pub fn sys_waitpid(pid: isize, exit_code: *mut isize) -> isize {
    unsafe { syscall2(SyscallId::WAITPID, pid as _, exit_code as _) }
}

/// 当前进程号。
#[inline]
pub fn sys_getpid() -> isize {
    unsafe { syscall0(SyscallId::GETPID) }
}

/// 终止一个进程。
#[inline]
pub fn sys_kill(pid: isize, signum: u8) -> isize {
    unsafe { syscall2(SyscallId::KILL, pid as _, signum as _) }
}

/// 主动让出处理器。
#[inline]
pub fn sys_yield() -> isize {
    unsafe { syscall0(SyscallId::YIELD) }
}

/// 映射匿名内存，返回映射地址。
#[inline]
pub fn sys_memacquire(addr: usize, size: usize) -> isize {
    unsafe { syscall2(SyscallId::MEMACQUIRE, addr, size) }
}

/// 取消匿名内存映射。
#[inline]
pub fn sys_memrelease(addr: usize, size: usize) -> isize {
    unsafe { syscall2(SyscallId::MEMRELEASE, addr, size) }
}

/// 创建共享内存对象并映射。
#[inline]
pub fn sys_shmcreate(addr: usize, size: usize, out: &mut Shm) -> isize {
    unsafe { syscall3(SyscallId::SHMCREATE, addr, size, out as *mut Shm as _) }
}

/// 映射授权给自己的共享内存对象。
#[inline]
pub fn sys_shmattach(id: i32, addr: usize, out: &mut Shm) -> isize {
    unsafe { syscall3(SyscallId::SHMATTACH, id as _, addr, out as *mut Shm as _) }
}

/// 取消自己对共享内存对象的映射。
#[inline]
pub fn sys_shmdetach(id: i32) -> isize {
    unsafe { syscall1(SyscallId::SHMDETACH, id as _) }
}

/// 授予其他进程访问共享内存的权限。
#[inline]
pub fn sys_shmallow(id: i32, pid: isize, perms: usize) -> isize {
    unsafe { syscall3(SyscallId::SHMALLOW, id as _, pid as _, perms) }
}

/// 返回指针的调用的错误判定。
///
/// 落在 `[-4095, -1]` 的返回值是负 errno，其余都是有效指针。
#[inline]
pub fn ptr_err(ret: isize) -> Option<isize> {
    if (-4095..0).contains(&ret) {
        Some(-ret)
    } else {
        None
    }
}

#[cfg(target_arch = "x86")]
mod raw {
    use crate::SyscallId;
    use core::arch::asm;

    // ebx 在某些代码模型下被保留，借 xchg 中转。
    #[inline(always)]
    pub unsafe fn syscall0(id: SyscallId) -> isize {
        let ret: isize;
        asm!("int 0x80",
            inlateout("eax") id.0 => ret,
        );
        ret
    }

    #[inline(always)]
    pub unsafe fn syscall1(id: SyscallId, a0: usize) -> isize {
        let ret: isize;
        asm!(
            "xchg ebx, {a0}",
            "int 0x80",
            "xchg ebx, {a0}",
            a0 = in(reg) a0,
            inlateout("eax") id.0 => ret,
        );
        ret
    }

    #[inline(always)]
    pub unsafe fn syscall2(id: SyscallId, a0: usize, a1: usize) -> isize {
        let ret: isize;
        asm!(
            "xchg ebx, {a0}",
            "int 0x80",
            "xchg ebx, {a0}",
            a0 = in(reg) a0,
            inlateout("eax") id.0 => ret,
            in("ecx") a1,
        );
        ret
    }

    #[inline(always)]
    pub unsafe fn syscall3(id: SyscallId, a0: usize, a1: usize, a2: usize) -> isize {
        let ret: isize;
        asm!(
            "xchg ebx, {a0}",
            "int 0x80",
            "xchg ebx, {a0}",
            a0 = in(reg) a0,
            inlateout("eax") id.0 => ret,
            in("ecx") a1,
            in("edx") a2,
        );
        ret
    }

    #[inline(always)]
    #[allow(dead_code)]
    pub unsafe fn syscall5(
        id: SyscallId,
        a0: usize,
        a1: usize,
        a2: usize,
        a3: usize,
        a4: usize,
    ) -> isize {
        let ret: isize;
        asm!(
            "xchg ebx, {a0}",
            "int 0x80",
            "xchg ebx, {a0}",
            a0 = in(reg) a0,
            inlateout("eax") id.0 => ret,
            in("ecx") a1,
            in("edx") a2,
            in("esi") a3,
            in("edi") a4,
        );
        ret
    }
}

#[cfg(not(target_arch = "x86"))]
mod raw {
    //! 非 x86 目标上的占位实现，让依赖方可以在宿主机上编译。

    use crate::{errno, SyscallId};

    #[inline]
    pub unsafe fn syscall0(_id: SyscallId) -> isize {
        -errno::ENOSYS
    }

    #[inline]
    pub unsafe fn syscall1(_id: SyscallId, _a0: usize) -> isize {
        -errno::ENOSYS
    }

    #[inline]
    pub unsafe fn syscall2(_id: SyscallId, _a0: usize, _a1: usize) -> isize {
        -errno::ENOSYS
    }

    #[inline]
    pub unsafe fn syscall3(_id: SyscallId, _a0: usize, _a1: usize, _a2: usize) -> isize {
        -errno::ENOSYS
    }
}

use self::raw::*;
