//! duck 核心：内存与任务。

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

mod arch;
mod boot;
mod elf;
mod fs;
mod mem;
mod process;
mod processor;
mod trap;
mod uaccess;

#[macro_use]
extern crate console;

extern crate alloc;

use alloc::string::String;
use impls::{Console, SyscallContext};
use process::Process;
use task_manage::ProcId;

// 定义内核入口。
linker::boot0!(rust_main; stack = 16 * 4096);

extern "C" fn rust_main(magic: u32, mboot_pa: usize) -> ! {
    let layout = linker::KernelLayout::locate();
    // bss 段清零
    unsafe { layout.zero_bss() };
    // 初始化 `console`
    arch::serial::init();
    console::init_console(&Console);
    console::set_log_level(option_env!("LOG"));
    // 初始化内核堆
    kernel_alloc::init!(pages = 1024);

    // 引导信息检查，缺内存图或引导盘都没法继续
    if magic != linker::BOOT_MAGIC {
        panic!("MULTIBOOT_FAIL: bad magic {magic:#x}");
    }
    let info = unsafe { linker::MultibootInfo::from_phys(mboot_pa) };
    let boot_disk = info
        .boot_device()
        .unwrap_or_else(|| panic!("MULTIBOOT_FAIL: no boot device"));
    log::info!("boot disk: {boot_disk:#x}");
    boot::init(info);

    // 物理内存、内核地址空间、段表和中断
    mem::init(info, &layout);
    arch::gdt::init();
    arch::idt::init();
    arch::pic::init();
    arch::pit::init();
    fs::init(info);
    processor::init();

    // 初始化 syscall
    syscall::init_process(&SyscallContext);
    syscall::init_memory(&SyscallContext);
    syscall::init_shared_mem(&SyscallContext);
    syscall::init_scheduling(&SyscallContext);

    // 0 号进程：引导模块里的 init。孤儿进程之后都过继给它，
    // 所以它必须第一个拿进程号。
    let init_path = boot::value_of("init").unwrap_or("/bin/init");
    let module = fs::open(init_path).unwrap_or_else(|| panic!("no init module {init_path:?}"));
    let (proc, thread) = Process::from_elf(
        module,
        init_path,
        alloc::vec![String::from(init_path)],
        alloc::vec![],
    )
    .expect("load init");
    processor::PROCESSOR.exclusive_session(|p| {
        let (pid, tid) = (proc.pid, thread.tid);
        p.add_proc(pid, proc, ProcId::from_usize(usize::MAX));
        p.add(tid, thread, pid);
    });

    // 内核自己的第一个线程，顺便验证内核栈区域的建立和回收
    processor::spawn_kernel("kinit", kinit, 0).expect("spawn kinit");

    processor::run()
}

/// 第一个内核线程：报告一下家底就退休。
extern "C" fn kinit(_arg: usize) {
    log::info!(
        "kinit: {} frames free, cmdline debug = {}",
        mem::frames().free_frames(),
        boot::has_option("debug"),
    );
}

/// Rust 异常处理函数，打印后停机。
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("{info}");
    arch::cpu::halt_forever()
}

/// 宿主机上只为编译和测试，不会真的运行内核。
#[cfg(not(target_os = "none"))]
fn main() {}

/// 各种接口库的实现。
mod impls {
    use crate::{fs, mem, process::ShmDesc, processor, uaccess};
    use alloc::{string::String, vec::Vec};
    use kernel_vm::{AddressSpace, VmObject, VmProt};
    use syscall::{as_ret, Caller, Error, Result, Shm, ShmPerm};
    use task_manage::ProcId;

    pub struct Console;

    impl console::Console for Console {
        #[inline]
        fn put_char(&self, c: u8) {
            crate::arch::serial::put_char(c);
        }
    }

    pub struct SyscallContext;

    impl syscall::Process for SyscallContext {
        #[inline]
        fn exit(&self, _caller: Caller, status: usize) -> isize {
            processor::exit_process(status as isize)
        }

        fn fork(&self, _caller: Caller) -> isize {
            as_ret(do_fork().map(|pid| pid.get_usize()))
        }

        fn exec(&self, _caller: Caller, path: usize, argv: usize, envp: usize) -> isize {
            as_ret(do_exec(path, argv, envp))
        }

        fn waitpid(&self, _caller: Caller, pid: isize, exit_code_ptr: usize) -> isize {
            as_ret(do_waitpid(pid, exit_code_ptr))
        }

        fn getpid(&self, _caller: Caller) -> isize {
            processor::PROCESSOR
                .exclusive_session(|p| p.current_proc_id())
                .map_or(-1, |pid| pid.get_usize() as isize)
        }

        fn kill(&self, _caller: Caller, pid: isize, signum: u8) -> isize {
            as_ret(do_kill(pid, signum))
        }
    }

    impl syscall::Memory for SyscallContext {
        fn memacquire(&self, _caller: Caller, addr: usize, size: usize) -> isize {
            as_ret(do_memacquire(addr, size))
        }

        fn memrelease(&self, _caller: Caller, addr: usize, size: usize) -> isize {
            as_ret(do_memrelease(addr, size))
        }
    }

    impl syscall::SharedMem for SyscallContext {
        fn shmcreate(&self, _caller: Caller, addr: usize, size: usize, out: usize) -> isize {
            as_ret(do_shmcreate(addr, size, out))
        }

        fn shmattach(&self, _caller: Caller, id: isize, addr: usize, out: usize) -> isize {
            as_ret(do_shmattach(id as i32, addr, out))
        }

        fn shmdetach(&self, _caller: Caller, id: isize) -> isize {
            as_ret(do_shmdetach(id as i32))
        }

        fn shmallow(&self, _caller: Caller, id: isize, pid: isize, perms: usize) -> isize {
            as_ret(do_shmallow(id as i32, pid, perms))
        }
    }

    impl syscall::Scheduling for SyscallContext {
        #[inline]
        fn sched_yield(&self, _caller: Caller) -> isize {
            processor::yield_now();
            0
        }
    }

    fn do_fork() -> Result<ProcId> {
        processor::PROCESSOR.exclusive_session(|p| {
            let tf = unsafe { (*p.current().ok_or(Error::NoProcess)?.user_tf()).clone() };
            let parent_pid = p.current_proc_id().ok_or(Error::NoProcess)?;
            let (child, thread) = p.get_current_proc().unwrap().fork(tf)?;
            let (pid, tid) = (child.pid, thread.tid);
            p.add_proc(pid, child, parent_pid);
            p.add(tid, thread, pid);
            Ok(pid)
        })
    }

    fn read_str_array(space: &mut AddressSpace, ptr: usize) -> Result<Vec<String>> {
        uaccess::read_ptr_array(space, ptr, 32)?
            .into_iter()
            .map(|p| uaccess::read_cstr(space, p, 256))
            .collect()
    }

    fn do_exec(path_ptr: usize, argv_ptr: usize, envp_ptr: usize) -> Result<usize> {
        processor::PROCESSOR.exclusive_session(|p| {
            let tf = p.current().ok_or(Error::NoProcess)?.user_tf();
            let (path, argv, envp) = {
                let proc = p.get_current_proc().unwrap();
                let space = proc.space.as_mut().ok_or(Error::PermissionDenied)?;
                let path = uaccess::read_cstr(space, path_ptr, 256)?;
                let argv = read_str_array(space, argv_ptr)?;
                let envp = read_str_array(space, envp_ptr)?;
                (path, argv, envp)
            };
            let module = fs::open(&path).ok_or(Error::NotFound)?;
            p.get_current_proc()
                .unwrap()
                .exec(tf, module, &path, argv, envp)?;
            Ok(0)
        })
    }

    fn do_waitpid(pid: isize, status_ptr: usize) -> Result<usize> {
        enum Wait {
            Done(ProcId, isize),
            NoChild,
            Running,
        }
        let target = if pid == -1 {
            ProcId::from_usize(usize::MAX)
        } else {
            ProcId::from_usize(pid as usize)
        };
        loop {
            let state = processor::PROCESSOR.exclusive_session(|p| match p.wait(target) {
                None => Wait::NoChild,
                Some((dead, _)) if dead.get_usize() == (-2isize as usize) => Wait::Running,
                Some((dead, code)) => Wait::Done(dead, code),
            });
            match state {
                Wait::NoChild => return Err(Error::NoChild),
                Wait::Running => processor::block_until_child_exits(),
                Wait::Done(dead, code) => {
                    if status_ptr != 0 {
                        processor::PROCESSOR.exclusive_session(|p| {
                            let space = p
                                .get_current_proc()
                                .and_then(|proc| proc.space.as_mut())
                                .ok_or(Error::BadAddress)?;
                            uaccess::write_value::<i32>(space, status_ptr, code as i32)
                        })?;
                    }
                    return Ok(dead.get_usize());
                }
            }
        }
    }

    fn do_kill(pid: isize, signum: u8) -> Result<usize> {
        if pid < 0 || signum == 0 || signum > 31 {
            return Err(Error::InvalidArgument);
        }
        let target = ProcId::from_usize(pid as usize);
        let code = 128 + signum as isize;
        let (me, my_uid) = processor::PROCESSOR.exclusive_session(|p| {
            let pid = p.current_proc_id().ok_or(Error::NoProcess)?;
            let uid = p.get_current_proc().unwrap().uid;
            Ok::<_, Error>((pid, uid))
        })?;
        // 杀自己就是带信号的退出。
        if target == me {
            processor::exit_process(code);
        }
        processor::PROCESSOR.exclusive_session(|p| {
            let proc = p.get_proc(target).ok_or(Error::NotFound)?;
            if my_uid != 0 && my_uid != proc.uid {
                return Err(Error::PermissionDenied);
            }
            Ok(())
        })?;
        processor::kill(target, code)?;
        Ok(0)
    }

    fn do_memacquire(addr: usize, size: usize) -> Result<usize> {
        processor::PROCESSOR.exclusive_session(|p| {
            let proc = p.get_current_proc().ok_or(Error::NoProcess)?;
            let space = proc.space.as_mut().ok_or(Error::PermissionDenied)?;
            let object = VmObject::anonymous(mem::frames(), size)?;
            let len = object.size();
            let va = if addr != 0 {
                space.map_object_at(object, addr, VmProt::RW | VmProt::USER)?
            } else {
                space.map_object(object, VmProt::RW | VmProt::USER)?
            };
            proc.used_pmem += len;
            Ok(va)
        })
    }

    fn do_memrelease(addr: usize, size: usize) -> Result<usize> {
        processor::PROCESSOR.exclusive_session(|p| {
            let proc = p.get_current_proc().ok_or(Error::NoProcess)?;
            let space = proc.space.as_mut().ok_or(Error::PermissionDenied)?;
            if space.unmap_region(addr, size).is_err() {
                log::warn!("memrelease() for {}({}) failed.", proc.name, proc.pid.get_usize());
                return Err(Error::NotFound);
            }
            proc.used_pmem = proc.used_pmem.saturating_sub(size);
            Ok(0)
        })
    }

    fn do_shmcreate(addr: usize, size: usize, out: usize) -> Result<usize> {
        processor::PROCESSOR.exclusive_session(|p| {
            let proc = p.get_current_proc().ok_or(Error::NoProcess)?;
            let pid = proc.pid.get_usize();
            let space = proc.space.as_mut().ok_or(Error::PermissionDenied)?;

            let (object, id) = mem::shm_registry()
                .exclusive_session(|r| r.create(mem::frames(), pid, size))?;
            let len = object.size();
            // 创建者的映射无条件可读写。
            let mapped = if addr != 0 {
                space.map_object_at(object, addr, VmProt::RW | VmProt::USER)
            } else {
                space.map_object(object, VmProt::RW | VmProt::USER)
            };
            let va = match mapped {
                Ok(va) => va,
                Err(e) => {
                    mem::shm_registry().exclusive_session(|r| {
                        let _ = r.detach(pid, id);
                    });
                    return Err(e);
                }
            };
            let shm = Shm {
                ptr: va,
                size: len,
                id,
            };
            if let Err(e) = uaccess::write_value(space, out, shm) {
                let _ = space.unmap_region(va, len);
                mem::shm_registry().exclusive_session(|r| {
                    let _ = r.detach(pid, id);
                });
                return Err(e);
            }
            proc.used_shmem += len;
            proc.shm_attached.push(ShmDesc {
                id,
                va,
                size: len,
                prot: VmProt::RW,
            });
            Ok(0)
        })
    }

    fn do_shmattach(id: i32, addr: usize, out: usize) -> Result<usize> {
        processor::PROCESSOR.exclusive_session(|p| {
            let proc = p.get_current_proc().ok_or(Error::NoProcess)?;
            let pid = proc.pid.get_usize();
            let space = proc.space.as_mut().ok_or(Error::PermissionDenied)?;

            let (object, prot) = mem::shm_registry().exclusive_session(|r| r.attach(id, pid))?;
            let len = object.size();
            let va = if addr != 0 {
                space.map_object_at(object, addr, prot | VmProt::USER)?
            } else {
                space.map_object(object, prot | VmProt::USER)?
            };
            let shm = Shm {
                ptr: va,
                size: len,
                id,
            };
            if let Err(e) = uaccess::write_value(space, out, shm) {
                let _ = space.unmap_region(va, len);
                return Err(e);
            }
            proc.used_shmem += len;
            proc.shm_attached.push(ShmDesc {
                id,
                va,
                size: len,
                prot,
            });
            Ok(0)
        })
    }

    fn do_shmdetach(id: i32) -> Result<usize> {
        processor::PROCESSOR.exclusive_session(|p| {
            let proc = p.get_current_proc().ok_or(Error::NoProcess)?;
            let pid = proc.pid.get_usize();
            let pos = proc
                .shm_attached
                .iter()
                .position(|desc| desc.id == id)
                .ok_or(Error::NotFound)?;
            let desc = proc.shm_attached.remove(pos);
            let space = proc.space.as_mut().ok_or(Error::PermissionDenied)?;
            let _ = space.unmap_region(desc.va, desc.size);
            // fork 继承的映射在注册表里没有权限项，摘不到不算错。
            mem::shm_registry().exclusive_session(|r| {
                let _ = r.detach(pid, id);
            });
            proc.used_shmem = proc.used_shmem.saturating_sub(desc.size);
            Ok(0)
        })
    }

    fn do_shmallow(id: i32, pid: isize, perms: usize) -> Result<usize> {
        let perm = ShmPerm::validate(perms)?;
        let mut prot = VmProt::READ;
        if perm.contains(ShmPerm::WRITE) {
            prot |= VmProt::WRITE;
        }
        if pid < 0 {
            return Err(Error::InvalidArgument);
        }
        let target = ProcId::from_usize(pid as usize);
        processor::PROCESSOR.exclusive_session(|p| {
            // 目标进程必须存在。
            if !p.proc_exists(target) {
                return Err(Error::InvalidArgument);
            }
            let caller = p.current_proc_id().ok_or(Error::NoProcess)?.get_usize();
            mem::shm_registry()
                .exclusive_session(|r| r.allow(id, caller, target.get_usize(), prot))?;
            Ok(0)
        })
    }
}

#[cfg(test)]
mod testing {
    //! 宿主机测试共用的页帧模拟。

    use kernel_vm::AddressSpace;
    use page_table::{FrameManager, Ppn, KERNEL_BASE, PAGE_SIZE};
    use std::collections::HashMap;
    use std::sync::Mutex;

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

    /// 和内核布局一致的用户空间。
    pub fn user_space(m: &'static MockFrames) -> AddressSpace {
        AddressSpace::new(m, 0x1000..KERNEL_BASE, 0x1000_0000..0xb000_0000).unwrap()
    }
}
