//! 处理器调度。
//!
//! 单处理器，抢占式时间片轮转。引导栈在初始化结束后化身 idle
//! 上下文：所有让出处理器的路径都切回 idle，由 idle 循环挑下一个
//! 就绪线程。就绪队列空了就停机等中断。

use crate::{arch, mem, process::{Process, Thread, ThreadState}};
use alloc::{boxed::Box, collections::BTreeMap, collections::VecDeque};
use core::ptr::{addr_of, addr_of_mut};
use kernel_context::TaskContext;
use spin::Lazy;
use sync::{UPIntrFreeCell, WaitQueue};
use syscall::{Error, Result};
use task_manage::{Manage, PThreadManager, ProcId, Schedule, ThreadId};

/// 线程管理器。
///
/// 实体装箱保存，调度代码拿到的上下文指针在重新平衡后仍然有效。
pub struct ThreadManager {
    tasks: BTreeMap<ThreadId, Box<Thread>>,
    ready_queue: VecDeque<ThreadId>,
}

impl ThreadManager {
    /// 新建线程管理器。
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            ready_queue: VecDeque::new(),
        }
    }
}

impl Manage<Box<Thread>, ThreadId> for ThreadManager {
    #[inline]
    fn insert(&mut self, id: ThreadId, task: Box<Thread>) {
        self.tasks.insert(id, task);
    }
    #[inline]
    fn delete(&mut self, id: ThreadId) -> Option<Box<Thread>> {
        self.tasks.remove(&id)
    }
    #[inline]
    fn get_mut(&mut self, id: ThreadId) -> Option<&mut Box<Thread>> {
        self.tasks.get_mut(&id)
    }
}

impl Schedule<ThreadId> for ThreadManager {
    fn add(&mut self, id: ThreadId) {
        self.ready_queue.push_back(id);
    }
    fn fetch(&mut self) -> Option<ThreadId> {
        self.ready_queue.pop_front()
    }
    fn remove(&mut self, id: ThreadId) {
        self.ready_queue.retain(|&x| x != id);
    }
}

/// 进程管理器。
pub struct ProcManager {
    procs: BTreeMap<ProcId, Box<Process>>,
}

impl ProcManager {
    /// 新建进程管理器。
    pub fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
        }
    }
}

impl Manage<Box<Process>, ProcId> for ProcManager {
    #[inline]
    fn insert(&mut self, id: ProcId, item: Box<Process>) {
        self.procs.insert(id, item);
    }
    #[inline]
    fn delete(&mut self, id: ProcId) -> Option<Box<Process>> {
        self.procs.remove(&id)
    }
    #[inline]
    fn get_mut(&mut self, id: ProcId) -> Option<&mut Box<Process>> {
        self.procs.get_mut(&id)
    }
}

type Manager = PThreadManager<Box<Process>, Box<Thread>, ThreadManager, ProcManager>;

/// 全局任务管理器。
pub static PROCESSOR: Lazy<UPIntrFreeCell<Manager>> =
    Lazy::new(|| unsafe { UPIntrFreeCell::new(PThreadManager::new()) });

/// 各进程在 waitpid 里等着的线程。
static WAITERS: Lazy<UPIntrFreeCell<BTreeMap<ProcId, WaitQueue<ThreadId>>>> =
    Lazy::new(|| unsafe { UPIntrFreeCell::new(BTreeMap::new()) });

/// idle 上下文，就是引导栈。
static mut IDLE_CTX: TaskContext = TaskContext::ZERO;

/// 初始化两级管理器。
pub fn init() {
    PROCESSOR.exclusive_session(|p| {
        p.set_manager(ThreadManager::new());
        p.set_proc_manager(ProcManager::new());
    });
}

/// idle 循环，引导流程的终点。
///
/// 每次调度都会回到这里：回收坟场，取下一个就绪线程，装载
/// 它的地址空间和内核栈，切过去。没有就绪线程时停机等中断。
pub fn run() -> ! {
    loop {
        let next = PROCESSOR.exclusive_session(|p| {
            p.reap();
            p.find_next()?;
            let (ctx, kstack_top) = {
                let thread = p.current().unwrap();
                thread.state = ThreadState::Running;
                (thread.ctx_ptr(), thread.kstack.top())
            };
            let root_pa = p
                .get_current_proc()
                .and_then(|proc| proc.space.as_ref())
                .map(|space| space.dir().root_pa());
            Some((ctx, kstack_top, root_pa))
        });
        match next {
            Some((ctx, kstack_top, root_pa)) => {
                arch::gdt::set_kernel_stack(kstack_top);
                let root_pa = root_pa.unwrap_or_else(mem::kernel_root_pa);
                if page_table::tlb::current() != root_pa {
                    unsafe { page_table::tlb::install(root_pa) };
                }
                unsafe { kernel_context::switch(&mut *addr_of_mut!(IDLE_CTX), &*ctx) };
            }
            None => arch::cpu::wait_for_interrupt(),
        }
    }
}

/// 切回 idle 循环。
fn switch_to_idle(cur: *mut TaskContext) {
    unsafe { kernel_context::switch(&mut *cur, &*addr_of!(IDLE_CTX)) };
}

/// 主动让出处理器，时间片耗尽的抢占也走这里。
pub fn yield_now() {
    let cur = PROCESSOR.exclusive_session(|p| {
        let ctx = p.current().map(|thread| {
            thread.state = ThreadState::Runnable;
            thread.ctx_ptr()
        });
        p.make_current_suspend();
        ctx
    });
    if let Some(cur) = cur {
        switch_to_idle(cur);
    }
}

/// 时钟中断：消耗时间片，耗尽则抢占。
pub fn on_tick() {
    if PROCESSOR.exclusive_session(|p| p.tick()) {
        yield_now();
    }
}

/// 阻塞当前线程直到某个子进程退出。
pub fn block_until_child_exits() {
    let cur = PROCESSOR.exclusive_session(|p| {
        let pid = p.current_proc_id().unwrap();
        let tid = p.current_id().unwrap();
        WAITERS.exclusive_session(|w| w.entry(pid).or_default().push(tid));
        let ctx = p.current().map(|thread| {
            thread.state = ThreadState::Blocked;
            thread.ctx_ptr()
        });
        p.make_current_blocked();
        ctx
    });
    if let Some(cur) = cur {
        switch_to_idle(cur);
    }
}

/// 唤醒 `parent` 里所有等子进程的线程。
fn wake_waiters(parent: ProcId) {
    WAITERS.exclusive_session(|w| {
        if let Some(queue) = w.get_mut(&parent) {
            PROCESSOR.exclusive_session(|p| {
                while let Some(tid) = queue.pop() {
                    // 等待者可能已经和它的进程一起被杀了。
                    if p.get_task(tid).is_none() {
                        continue;
                    }
                    if let Some(thread) = p.get_task(tid) {
                        thread.state = ThreadState::Runnable;
                    }
                    p.re_enque(tid);
                }
            });
        }
    });
}

/// 进程消亡后的扫尾：摘共享内存权限、唤醒等它的父进程，再释放实体。
fn cleanup_process(proc: Box<Process>) {
    mem::shm_registry().exclusive_session(|r| r.remove_process(proc.pid.get_usize()));
    // 被杀的线程不能留在任何等待队列里。
    WAITERS.exclusive_session(|w| {
        w.remove(&proc.pid);
    });
    wake_waiters(proc.parent);
    drop(proc);
}

/// 结束当前线程，进程的其他线程继续运行。
pub fn exit_thread(code: isize) -> ! {
    depart(code, false)
}

/// 结束当前进程的全部线程。
pub fn exit_process(code: isize) -> ! {
    depart(code, true)
}

fn depart(code: isize, whole_process: bool) -> ! {
    // 即将丢弃当前地址空间，先关中断、退回内核页目录。
    arch::cpu::disable_interrupts();
    unsafe { page_table::tlb::install(mem::kernel_root_pa()) };
    let (cur, dead) = PROCESSOR.exclusive_session(|p| {
        let cur = p
            .current()
            .map(|thread| {
                thread.state = ThreadState::Zombie;
                thread.ctx_ptr()
            })
            .unwrap();
        let dead = if whole_process {
            let pid = p.current_proc_id().unwrap();
            p.make_process_exited(pid, code)
        } else {
            p.make_current_exited(code).map(|(_, proc)| proc)
        };
        (cur, dead)
    });
    if let Some(proc) = dead {
        cleanup_process(proc);
    }
    switch_to_idle(cur);
    unreachable!("departed thread rescheduled")
}

/// 杀死另一个进程。
pub fn kill(pid: ProcId, code: isize) -> Result<()> {
    let dead = PROCESSOR.exclusive_session(|p| p.make_process_exited(pid, code));
    match dead {
        Some(proc) => {
            cleanup_process(proc);
            Ok(())
        }
        None => Err(Error::NotFound),
    }
}

/// 内核线程结束的着陆点，entry 返回后跳到这里。
extern "C" fn kthread_exit() -> ! {
    exit_thread(0)
}

/// 创建内核线程，地址空间就是内核空间。
pub fn spawn_kernel(name: &str, entry: extern "C" fn(usize), arg: usize) -> Result<ProcId> {
    let proc = Process::new_kernel(name);
    let pid = proc.pid;
    let kstack = crate::process::KernelStack::new()?;
    let ctx = unsafe {
        TaskContext::kthread(kstack.top(), entry as usize, kthread_exit as usize, arg)
    };
    let thread = Thread::new(ctx, kstack);
    let tid = thread.tid;
    PROCESSOR.exclusive_session(|p| {
        p.add_proc(pid, proc, ProcId::from_usize(0));
        p.add(tid, thread, pid);
    });
    Ok(pid)
}
