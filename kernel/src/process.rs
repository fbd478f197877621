//! 进程与线程。

use crate::{elf, fs, mem, uaccess};
use alloc::{boxed::Box, string::String, vec::Vec};
use kernel_context::{TaskContext, TrapFrame};
use kernel_vm::{AddressSpace, VmObject, VmProt};
use syscall::{Error, Result};
use task_manage::{ProcId, ThreadId};

/// 用户栈大小。
const USER_STACK_SIZE: usize = 64 << 10;
/// 内核栈大小。
const KERNEL_STACK_SIZE: usize = 16 << 10;

/// 线程的调度状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// 在就绪队列里。
    Runnable,
    /// 正在处理器上。
    Running,
    /// 等待唤醒。
    Blocked,
    /// 已结束，等待回收。
    Zombie,
}

/// 内核栈：内核空间里的一个匿名区域。
///
/// 区域销毁时页表项从共享的内核页表里摘除，对所有页目录生效。
pub struct KernelStack {
    base: usize,
    size: usize,
}

impl KernelStack {
    /// 映射一个新内核栈。
    pub fn new() -> Result<Self> {
        let object = VmObject::anonymous(mem::frames(), KERNEL_STACK_SIZE)?;
        let size = object.size();
        let base = mem::kernel_space().exclusive_session(|ks| ks.map_object(object, VmProt::RW))?;
        Ok(Self { base, size })
    }

    /// 栈顶。
    #[inline]
    pub fn top(&self) -> usize {
        self.base + self.size
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        let _ = mem::kernel_space().exclusive_session(|ks| ks.unmap_region(self.base, self.size));
    }
}

/// 线程。
pub struct Thread {
    /// 不可变。
    pub tid: ThreadId,
    /// 调度状态。
    pub state: ThreadState,
    /// 切换时保存的上下文。
    pub ctx: TaskContext,
    /// 内核栈。
    pub kstack: KernelStack,
}

impl Thread {
    /// 打包一个新线程。
    pub fn new(ctx: TaskContext, kstack: KernelStack) -> Box<Self> {
        Box::new(Self {
            tid: ThreadId::new(),
            state: ThreadState::Runnable,
            ctx,
            kstack,
        })
    }

    /// 上下文的地址，交给切换代码。
    #[inline]
    pub fn ctx_ptr(&mut self) -> *mut TaskContext {
        &mut self.ctx
    }

    /// 用户线程陷入帧的固定位置。
    #[inline]
    pub fn user_tf(&self) -> *mut TrapFrame {
        TaskContext::trap_frame_of(self.kstack.top())
    }
}

/// 进程里记一笔共享内存映射。
#[derive(Clone)]
pub struct ShmDesc {
    /// 对象编号。
    pub id: i32,
    /// 映射地址。
    pub va: usize,
    /// 区域大小。
    pub size: usize,
    /// 被授予的保护属性。
    pub prot: VmProt,
}

/// 进程。
pub struct Process {
    /// 不可变。
    pub pid: ProcId,
    /// 父进程。
    pub parent: ProcId,
    /// 名字，取映像路径的最后一段。
    pub name: String,
    /// 属主。
    pub uid: u32,
    /// 属组。
    pub gid: u32,
    /// 用户地址空间，内核进程没有。
    pub space: Option<AddressSpace>,
    /// 文件描述符表。
    pub fd_table: Vec<Option<fs::FileHandle>>,
    /// 共享内存映射。
    pub shm_attached: Vec<ShmDesc>,
    /// 匿名映射占用的字节数。
    pub used_pmem: usize,
    /// 共享映射占用的字节数。
    pub used_shmem: usize,
    /// 初始 program break，装载器给出。
    pub brk: usize,
}

impl Process {
    /// 新建内核进程，地址空间就是内核空间。
    pub fn new_kernel(name: &str) -> Box<Self> {
        Box::new(Self {
            pid: ProcId::new(),
            parent: ProcId::from_usize(0),
            name: String::from(name),
            uid: 0,
            gid: 0,
            space: None,
            fd_table: Vec::new(),
            shm_attached: Vec::new(),
            used_pmem: 0,
            used_shmem: 0,
            brk: 0,
        })
    }

    /// 从一个 ELF 模块创建新进程。
    pub fn from_elf(
        module: &fs::Module,
        path: &str,
        mut argv: Vec<String>,
        envp: Vec<String>,
    ) -> Result<(Box<Self>, Box<Thread>)> {
        let (mut space, image) = build_user_image(module, &mut argv, path)?;
        let sp = build_stack(&mut space, &argv, &envp)?;

        let kstack = KernelStack::new()?;
        let tf = TrapFrame::user(image.entry, sp);
        let ctx = unsafe { TaskContext::returning_to_user(kstack.top(), tf) };
        let thread = Thread::new(ctx, kstack);

        let proc = Box::new(Self {
            pid: ProcId::new(),
            parent: ProcId::from_usize(0),
            name: String::from(basename(path)),
            uid: 0,
            gid: 0,
            space: Some(space),
            fd_table: alloc::vec![None, None, None],
            shm_attached: Vec::new(),
            used_pmem: 0,
            used_shmem: 0,
            brk: image.brk,
        });
        Ok((proc, thread))
    }

    /// 复制当前进程。
    ///
    /// 地址空间写时复制，文件表逐项复制，子线程从同一个陷入帧
    /// 返回用户态，只是 eax 改成 0。任何一步失败都不会留下子进程。
    pub fn fork(&mut self, mut tf: TrapFrame) -> Result<(Box<Self>, Box<Thread>)> {
        let space = self
            .space
            .as_ref()
            .ok_or(Error::PermissionDenied)?
            .fork()?;
        let kstack = KernelStack::new()?;
        tf.eax = 0;
        let ctx = unsafe { TaskContext::returning_to_user(kstack.top(), tf) };
        let thread = Thread::new(ctx, kstack);

        let child = Box::new(Self {
            pid: ProcId::new(),
            parent: self.pid,
            name: self.name.clone(),
            uid: self.uid,
            gid: self.gid,
            space: Some(space),
            fd_table: self.fd_table.clone(),
            shm_attached: self.shm_attached.clone(),
            used_pmem: self.used_pmem,
            used_shmem: self.used_shmem,
            brk: self.brk,
        });
        Ok((child, thread))
    }

    /// 替换进程映像。
    ///
    /// 新空间完整建好才换掉旧的，失败时当前映像原样保留。
    pub fn exec(
        &mut self,
        tf: *mut TrapFrame,
        module: &fs::Module,
        path: &str,
        mut argv: Vec<String>,
        envp: Vec<String>,
    ) -> Result<()> {
        let (mut space, image) = build_user_image(module, &mut argv, path)?;
        let sp = build_stack(&mut space, &argv, &envp)?;

        // 换上新页目录之后旧空间才能拆。
        unsafe { space.install() };
        let old = self.space.replace(space);
        drop(old);

        // 旧映像的共享内存映射随区域一起消失了，权限项也摘掉。
        for desc in self.shm_attached.drain(..) {
            let _ = mem::shm_registry()
                .exclusive_session(|r| r.detach(self.pid.get_usize(), desc.id));
        }
        for fd in self.fd_table.iter_mut() {
            if fd.as_ref().is_some_and(|f| f.close_on_exec) {
                *fd = None;
            }
        }
        self.name = String::from(basename(path));
        self.used_pmem = 0;
        self.used_shmem = 0;
        self.brk = image.brk;
        unsafe { *tf = TrapFrame::user(image.entry, sp) };
        Ok(())
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// 新建一个挂好内核半空间的用户地址空间。
fn new_user_space() -> Result<AddressSpace> {
    mem::kernel_space().exclusive_session(|ks| {
        AddressSpace::new_user(
            mem::frames(),
            mem::USER_START..mem::USER_END,
            mem::USER_ALLOC_START..mem::USER_ALLOC_END,
            ks,
        )
    })
}

/// 装载映像；指定了解释器时换装解释器，原路径挪进参数。
fn build_user_image(
    module: &fs::Module,
    argv: &mut Vec<String>,
    path: &str,
) -> Result<(AddressSpace, elf::LoadedImage)> {
    let mut space = new_user_space()?;
    match elf::load(&mut space, module)? {
        elf::Loaded::Image(image) => Ok((space, image)),
        elf::Loaded::Interp(interp) => {
            let loader = fs::open(&interp).ok_or(Error::NotFound)?;
            argv.insert(0, String::from(path));
            match elf::load(&mut space, loader)? {
                elf::Loaded::Image(image) => Ok((space, image)),
                elf::Loaded::Interp(_) => Err(Error::BadExecutable),
            }
        }
    }
}

/// 建用户栈并铺好 argc、argv、envp。
///
/// 栈顶朝下依次是字符串、envp 数组、argv 数组和 argc，
/// esp 指向 argc，与 crt0 的约定一致。
fn build_stack(space: &mut AddressSpace, argv: &[String], envp: &[String]) -> Result<usize> {
    let stack = VmObject::anonymous(mem::frames(), USER_STACK_SIZE)?;
    space.map_object_at(
        stack,
        mem::USER_END - USER_STACK_SIZE,
        VmProt::RW | VmProt::USER,
    )?;

    let mut sp = mem::USER_END;
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_ptrs.push(push_str(space, &mut sp, arg)?);
    }
    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for env in envp {
        envp_ptrs.push(push_str(space, &mut sp, env)?);
    }

    sp &= !3;
    push_word(space, &mut sp, 0)?;
    for &ptr in envp_ptrs.iter().rev() {
        push_word(space, &mut sp, ptr)?;
    }
    push_word(space, &mut sp, 0)?;
    for &ptr in argv_ptrs.iter().rev() {
        push_word(space, &mut sp, ptr)?;
    }
    push_word(space, &mut sp, argv.len() as u32)?;
    Ok(sp)
}

fn push_str(space: &mut AddressSpace, sp: &mut usize, s: &str) -> Result<u32> {
    *sp -= s.len() + 1;
    uaccess::copy_to_user(space, *sp, s.as_bytes())?;
    uaccess::write_value::<u8>(space, *sp + s.len(), 0)?;
    Ok(*sp as u32)
}

fn push_word(space: &mut AddressSpace, sp: &mut usize, word: u32) -> Result<()> {
    *sp -= 4;
    uaccess::write_value(space, *sp, word)
}
