//! 内核侧的系统调用分发。
//!
//! 每个领域一个 trait，内核在初始化时注册实现，
//! `handle` 按调用号把参数转发过去。

#![allow(unused_variables)]

use crate::SyscallId;
use spin::Once;

/// 系统调用的发起者信息。
pub struct Caller {
    /// 发起者拥有的资源集的标记，相当于进程号。
    pub entity: usize,
    /// 发起者的控制流的标记，相当于线程号。
    pub flow: usize,
}

/// 进程生命周期。
pub trait Process: Sync {
    /// 结束当前进程。
    fn exit(&self, caller: Caller, status: usize) -> isize {
        unimplemented!()
    }
    /// 复制当前进程，父进程得到子进程号，子进程得到 0。
    fn fork(&self, caller: Caller) -> isize {
        unimplemented!()
    }
    /// 替换当前进程映像。
    fn exec(&self, caller: Caller, path: usize, argv: usize, envp: usize) -> isize {
        unimplemented!()
    }
    /// 等待子进程结束。
    fn waitpid(&self, caller: Caller, pid: isize, exit_code_ptr: usize) -> isize {
        unimplemented!()
    }
    /// 当前进程号。
    fn getpid(&self, caller: Caller) -> isize {
        unimplemented!()
    }
    /// 终止一个进程。
    fn kill(&self, caller: Caller, pid: isize, signum: u8) -> isize {
        unimplemented!()
    }
}

/// 进程地址空间内的匿名内存。
pub trait Memory: Sync {
    /// 映射匿名内存，`addr` 为 0 时由内核挑选地址。
    fn memacquire(&self, caller: Caller, addr: usize, size: usize) -> isize {
        unimplemented!()
    }
    /// 取消映射，要求 `(addr, size)` 与既有区域完全一致。
    fn memrelease(&self, caller: Caller, addr: usize, size: usize) -> isize {
        unimplemented!()
    }
}

/// 共享内存。
pub trait SharedMem: Sync {
    /// 创建共享对象、映射并把 `Shm` 写到 `out`。
    fn shmcreate(&self, caller: Caller, addr: usize, size: usize, out: usize) -> isize {
        unimplemented!()
    }
    /// 映射授权给调用者的共享对象。
    fn shmattach(&self, caller: Caller, id: isize, addr: usize, out: usize) -> isize {
        unimplemented!()
    }
    /// 取消调用者对对象的映射。
    fn shmdetach(&self, caller: Caller, id: isize) -> isize {
        unimplemented!()
    }
    /// 授予其他进程权限。
    fn shmallow(&self, caller: Caller, id: isize, pid: isize, perms: usize) -> isize {
        unimplemented!()
    }
}

/// 处理器让渡。
pub trait Scheduling: Sync {
    /// 主动让出处理器。
    fn sched_yield(&self, caller: Caller) -> isize {
        unimplemented!()
    }
}

static PROCESS: Container<dyn Process> = Container::new();
static MEMORY: Container<dyn Memory> = Container::new();
static SHARED_MEM: Container<dyn SharedMem> = Container::new();
static SCHEDULING: Container<dyn Scheduling> = Container::new();

/// 注册进程接口。
#[inline]
pub fn init_process(process: &'static dyn Process) {
    PROCESS.init(process);
}

/// 注册内存接口。
#[inline]
pub fn init_memory(memory: &'static dyn Memory) {
    MEMORY.init(memory);
}

/// 注册共享内存接口。
#[inline]
pub fn init_shared_mem(shared_mem: &'static dyn SharedMem) {
    SHARED_MEM.init(shared_mem);
}

/// 注册调度接口。
#[inline]
pub fn init_scheduling(scheduling: &'static dyn Scheduling) {
    SCHEDULING.init(scheduling);
}

/// 一次系统调用的结果。
pub enum SyscallResult {
    /// 处理完成，携带返回值。
    Done(isize),
    /// 不认识这个调用号。
    Unsupported(SyscallId),
}

/// 分发一次系统调用。
pub fn handle(caller: Caller, id: SyscallId, args: [usize; 5]) -> SyscallResult {
    use SyscallId as Id;
    match id {
        Id::EXIT => PROCESS.call(id, |proc| proc.exit(caller, args[0])),
        Id::FORK => PROCESS.call(id, |proc| proc.fork(caller)),
        Id::EXECVE => PROCESS.call(id, |proc| proc.exec(caller, args[0], args[1], args[2])),
        Id::WAITPID => PROCESS.call(id, |proc| proc.waitpid(caller, args[0] as _, args[1])),
        Id::GETPID => PROCESS.call(id, |proc| proc.getpid(caller)),
        Id::KILL => PROCESS.call(id, |proc| proc.kill(caller, args[0] as _, args[1] as _)),
        Id::YIELD => SCHEDULING.call(id, |sched| sched.sched_yield(caller)),
        Id::MEMACQUIRE => MEMORY.call(id, |memory| memory.memacquire(caller, args[0], args[1])),
        Id::MEMRELEASE => MEMORY.call(id, |memory| memory.memrelease(caller, args[0], args[1])),
        Id::SHMCREATE => {
            SHARED_MEM.call(id, |shm| shm.shmcreate(caller, args[0], args[1], args[2]))
        }
        Id::SHMATTACH => {
            SHARED_MEM.call(id, |shm| shm.shmattach(caller, args[0] as _, args[1], args[2]))
        }
        Id::SHMDETACH => SHARED_MEM.call(id, |shm| shm.shmdetach(caller, args[0] as _)),
        Id::SHMALLOW => SHARED_MEM.call(id, |shm| {
            shm.shmallow(caller, args[0] as _, args[1] as _, args[2])
        }),
        _ => SyscallResult::Unsupported(id),
    }
}

struct Container<T: 'static + ?Sized>(Once<&'static T>);

impl<T: 'static + ?Sized> Container<T> {
    #[inline]
    const fn new() -> Self {
        Self(Once::new())
    }

    #[inline]
    fn init(&self, val: &'static T) {
        self.0.call_once(|| val);
    }

    #[inline]
    fn call(&self, id: SyscallId, f: impl FnOnce(&T) -> isize) -> SyscallResult {
        self.0
            .get()
            .map_or(SyscallResult::Unsupported(id), |val| {
                SyscallResult::Done(f(val))
            })
    }
}
