use crate::{
    id::{ProcId, ThreadId},
    manager::{Manage, Schedule},
    relation::ProcThreadRel,
};
use alloc::{collections::BTreeMap, vec::Vec};
use core::marker::PhantomData;

/// 一个线程被抢占前可以运行的时钟中断数。
pub const QUANTUM: usize = 10;

/// 进程-线程两级管理器。
///
/// P 表示进程，T 表示线程。进程之间的亲缘关系、线程到进程的归属
/// 都在这里维护，调度由 MT 的就绪队列完成，时间片轮转。
///
/// 结束的线程实体先搬进 `graveyard`，等控制流离开它的栈再释放，
/// 所以回收要由别的线程驱动。
pub struct PThreadManager<P, T, MT, MP>
where
    MT: Manage<T, ThreadId> + Schedule<ThreadId>,
    MP: Manage<P, ProcId>,
{
    /// 进程之间的亲缘关系。
    relation: BTreeMap<ProcId, ProcThreadRel>,
    /// 进程实体管理。
    proc_manager: Option<MP>,
    /// 线程到进程的归属。
    tid2pid: BTreeMap<ThreadId, ProcId>,
    /// 线程实体管理和调度。
    manager: Option<MT>,
    /// 当前正在运行的线程。
    current: Option<ThreadId>,
    /// 当前线程剩余的时间片。
    quantum: usize,
    /// 等待释放的线程实体。
    graveyard: Vec<T>,
    phantom_t: PhantomData<T>,
    phantom_p: PhantomData<P>,
}

impl<P, T, MT, MP> PThreadManager<P, T, MT, MP>
where
    MT: Manage<T, ThreadId> + Schedule<ThreadId>,
    MP: Manage<P, ProcId>,
{
    /// 新建 PThreadManager。
    pub const fn new() -> Self {
        Self {
            relation: BTreeMap::new(),
            proc_manager: None,
            tid2pid: BTreeMap::new(),
            manager: None,
            current: None,
            quantum: QUANTUM,
            graveyard: Vec::new(),
            phantom_t: PhantomData,
            phantom_p: PhantomData,
        }
    }

    /// 设置线程管理器。
    pub fn set_manager(&mut self, manager: MT) {
        self.manager = Some(manager);
    }

    /// 设置进程管理器。
    pub fn set_proc_manager(&mut self, proc_manager: MP) {
        self.proc_manager = Some(proc_manager);
    }

    /// 添加进程，需要指明父进程。
    pub fn add_proc(&mut self, pid: ProcId, proc: P, parent: ProcId) {
        self.proc_manager.as_mut().unwrap().insert(pid, proc);
        if let Some(parent_rel) = self.relation.get_mut(&parent) {
            parent_rel.add_child(pid);
        }
        self.relation.insert(pid, ProcThreadRel::new(parent));
    }

    /// 添加线程并使其就绪。
    pub fn add(&mut self, tid: ThreadId, thread: T, pid: ProcId) {
        let manager = self.manager.as_mut().unwrap();
        manager.insert(tid, thread);
        manager.add(tid);
        self.tid2pid.insert(tid, pid);
        if let Some(rel) = self.relation.get_mut(&pid) {
            rel.add_thread(tid);
        }
    }

    /// 取出下一个就绪线程并充满时间片。
    ///
    /// 队列里可能残留已结束线程的编号，跳过它们。
    pub fn find_next(&mut self) -> Option<&mut T> {
        loop {
            let id = self.manager.as_mut().unwrap().fetch()?;
            if self.manager.as_mut().unwrap().get_mut(id).is_some() {
                self.current = Some(id);
                self.quantum = QUANTUM;
                return self.manager.as_mut().unwrap().get_mut(id);
            }
        }
    }

    /// 当前线程。
    pub fn current(&mut self) -> Option<&mut T> {
        let id = self.current?;
        self.manager.as_mut().unwrap().get_mut(id)
    }

    /// 当前线程号。
    pub fn current_id(&self) -> Option<ThreadId> {
        self.current
    }

    /// 当前进程号。
    pub fn current_proc_id(&self) -> Option<ProcId> {
        self.current.and_then(|tid| self.tid2pid.get(&tid).copied())
    }

    /// 当前进程。
    pub fn get_current_proc(&mut self) -> Option<&mut P> {
        let pid = self.current_proc_id()?;
        self.get_proc(pid)
    }

    /// 获取某个进程。
    pub fn get_proc(&mut self, pid: ProcId) -> Option<&mut P> {
        self.proc_manager.as_mut().unwrap().get_mut(pid)
    }

    /// 获取某个线程。
    pub fn get_task(&mut self, tid: ThreadId) -> Option<&mut T> {
        self.manager.as_mut().unwrap().get_mut(tid)
    }

    /// 某个进程的线程列表。
    pub fn get_thread(&mut self, pid: ProcId) -> Option<&Vec<ThreadId>> {
        self.relation.get(&pid).map(|rel| &rel.threads)
    }

    /// 进程是否存在。
    pub fn proc_exists(&self, pid: ProcId) -> bool {
        self.relation.contains_key(&pid)
    }

    /// 当前线程回到就绪队列尾部。
    pub fn make_current_suspend(&mut self) {
        if let Some(id) = self.current.take() {
            self.manager.as_mut().unwrap().add(id);
        }
    }

    /// 当前线程阻塞，等待 [`re_enque`](Self::re_enque) 唤醒。
    pub fn make_current_blocked(&mut self) {
        self.current = None;
    }

    /// 阻塞的线程回到就绪队列。
    pub fn re_enque(&mut self, tid: ThreadId) {
        self.manager.as_mut().unwrap().add(tid);
    }

    /// 结束当前线程。
    ///
    /// 线程实体进坟场等待回收。它是进程的最后一个线程时进程随之结束，
    /// 返回 `(进程号, 进程实体)` 交由调用者在安全的位置释放。
    pub fn make_current_exited(&mut self, exit_code: isize) -> Option<(ProcId, P)> {
        let tid = self.current.take()?;
        let pid = self.tid2pid.remove(&tid)?;
        if let Some(thread) = self.manager.as_mut().unwrap().delete(tid) {
            self.graveyard.push(thread);
        }
        let rel = self.relation.get_mut(&pid)?;
        rel.del_thread(tid);
        if rel.threads.is_empty() {
            self.exit_proc(pid, exit_code)
        } else {
            None
        }
    }

    /// 终止一个进程的全部线程。
    ///
    /// 就绪队列里的线程直接摘除，阻塞的线程不再会被唤醒。
    /// 返回进程实体交由调用者释放。
    pub fn make_process_exited(&mut self, pid: ProcId, exit_code: isize) -> Option<P> {
        let threads = self.relation.get(&pid)?.threads.clone();
        for tid in threads {
            if self.current == Some(tid) {
                self.current = None;
            }
            let manager = self.manager.as_mut().unwrap();
            manager.remove(tid);
            if let Some(thread) = manager.delete(tid) {
                self.graveyard.push(thread);
            }
            self.tid2pid.remove(&tid);
        }
        self.exit_proc(pid, exit_code).map(|(_, proc)| proc)
    }

    /// 摘掉进程实体并整理亲缘关系。
    fn exit_proc(&mut self, pid: ProcId, exit_code: isize) -> Option<(ProcId, P)> {
        let proc = self.proc_manager.as_mut().unwrap().delete(pid)?;
        let rel = self.relation.remove(&pid)?;
        // 通知父进程。
        if let Some(parent_rel) = self.relation.get_mut(&rel.parent) {
            parent_rel.del_child(pid, exit_code);
        }
        // 孤儿全部过继给 0 号进程。
        let init = ProcId::from_usize(0);
        for child in rel.children {
            if let Some(child_rel) = self.relation.get_mut(&child) {
                child_rel.parent = init;
            }
            if let Some(init_rel) = self.relation.get_mut(&init) {
                init_rel.add_child(child);
            }
        }
        for dead in rel.dead_children {
            if let Some(init_rel) = self.relation.get_mut(&init) {
                init_rel.dead_children.push(dead);
            }
        }
        Some((pid, proc))
    }

    /// wait 系统调用。
    ///
    /// 返回结束的子进程号和退出码；子进程还在运行返回 `(-2, -1)`；
    /// 没有可等的子进程返回 None。`usize::MAX` 表示等待任意子进程。
    pub fn wait(&mut self, child_pid: ProcId) -> Option<(ProcId, isize)> {
        let id = self.current_proc_id()?;
        let rel = self.relation.get_mut(&id)?;
        if child_pid.get_usize() == usize::MAX {
            rel.wait_any_child()
        } else {
            rel.wait_child(child_pid)
        }
    }

    /// 时钟中断：消耗当前线程的时间片，耗尽时返回 true 要求抢占。
    pub fn tick(&mut self) -> bool {
        if self.current.is_none() {
            return false;
        }
        if self.quantum > 0 {
            self.quantum -= 1;
        }
        self.quantum == 0
    }

    /// 释放坟场里的线程实体。
    ///
    /// 只能由其他线程的控制流调用，不能在刚结束的线程自己的栈上调用。
    pub fn reap(&mut self) {
        self.graveyard.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::VecDeque;

    struct TestThreads {
        tasks: BTreeMap<ThreadId, u32>,
        queue: VecDeque<ThreadId>,
    }

    impl TestThreads {
        fn new() -> Self {
            Self {
                tasks: BTreeMap::new(),
                queue: VecDeque::new(),
            }
        }
    }

    impl Manage<u32, ThreadId> for TestThreads {
        fn insert(&mut self, id: ThreadId, item: u32) {
            self.tasks.insert(id, item);
        }
        fn delete(&mut self, id: ThreadId) -> Option<u32> {
            self.tasks.remove(&id)
        }
        fn get_mut(&mut self, id: ThreadId) -> Option<&mut u32> {
            self.tasks.get_mut(&id)
        }
    }

    impl Schedule<ThreadId> for TestThreads {
        fn add(&mut self, id: ThreadId) {
            self.queue.push_back(id);
        }
        fn fetch(&mut self) -> Option<ThreadId> {
            self.queue.pop_front()
        }
        fn remove(&mut self, id: ThreadId) {
            self.queue.retain(|&x| x != id);
        }
    }

    struct TestProcs {
        procs: BTreeMap<ProcId, &'static str>,
    }

    impl Manage<&'static str, ProcId> for TestProcs {
        fn insert(&mut self, id: ProcId, item: &'static str) {
            self.procs.insert(id, item);
        }
        fn delete(&mut self, id: ProcId) -> Option<&'static str> {
            self.procs.remove(&id)
        }
        fn get_mut(&mut self, id: ProcId) -> Option<&mut &'static str> {
            self.procs.get_mut(&id)
        }
    }

    type Manager = PThreadManager<&'static str, u32, TestThreads, TestProcs>;

    fn manager() -> Manager {
        let mut m = Manager::new();
        m.set_manager(TestThreads::new());
        m.set_proc_manager(TestProcs {
            procs: BTreeMap::new(),
        });
        m
    }

    #[test]
    fn round_robin_is_fair() {
        let mut m = manager();
        let pid = ProcId::from_usize(10);
        m.add_proc(pid, "proc", ProcId::from_usize(usize::MAX));
        let (ta, tb) = (ThreadId::from_usize(10), ThreadId::from_usize(11));
        m.add(ta, 0, pid);
        m.add(tb, 1, pid);

        // 两个算力饱和的线程轮流执行，运行次数各占一半。
        let mut runs = [0u32; 2];
        for _ in 0..100 {
            let mark = *m.find_next().unwrap();
            runs[mark as usize] += 1;
            m.make_current_suspend();
        }
        assert_eq!(runs[0], 50);
        assert_eq!(runs[1], 50);
    }

    #[test]
    fn quantum_expires_after_fixed_ticks() {
        let mut m = manager();
        let pid = ProcId::from_usize(20);
        m.add_proc(pid, "proc", ProcId::from_usize(usize::MAX));
        m.add(ThreadId::from_usize(20), 0, pid);
        m.find_next().unwrap();
        for _ in 0..QUANTUM - 1 {
            assert!(!m.tick());
        }
        assert!(m.tick());
    }

    #[test]
    fn no_current_no_preempt() {
        let mut m = manager();
        assert!(!m.tick());
    }

    #[test]
    fn exit_reparents_children_and_wait_reaps() {
        let mut m = manager();
        let init = ProcId::from_usize(0);
        m.add_proc(init, "init", ProcId::from_usize(usize::MAX));
        let parent = ProcId::from_usize(31);
        m.add_proc(parent, "parent", init);
        let child = ProcId::from_usize(32);
        m.add_proc(child, "child", parent);

        // parent 运行一个线程然后退出。
        let t = ThreadId::from_usize(31);
        m.add(t, 0, parent);
        m.find_next().unwrap();
        let (dead_pid, _proc) = m.make_current_exited(7).unwrap();
        assert_eq!(dead_pid, parent);

        // 孤儿过继给 0 号进程。
        assert!(m.proc_exists(child));
        m.add(ThreadId::from_usize(32), 1, init);
        m.find_next().unwrap();
        // init 可以等到 parent 的退出码。
        assert_eq!(m.wait(parent), Some((parent, 7)));
        // child 还活着，继续等会得到“要等”标记。
        assert_eq!(
            m.wait(ProcId::from_usize(usize::MAX)),
            Some((ProcId::from_usize(-2isize as usize), -1))
        );
    }

    #[test]
    fn kill_removes_queued_threads() {
        let mut m = manager();
        let pid_a = ProcId::from_usize(41);
        let pid_b = ProcId::from_usize(42);
        m.add_proc(pid_a, "a", ProcId::from_usize(usize::MAX));
        m.add_proc(pid_b, "b", ProcId::from_usize(usize::MAX));
        let (ta, tb) = (ThreadId::from_usize(41), ThreadId::from_usize(42));
        m.add(ta, 0, pid_a);
        m.add(tb, 1, pid_b);

        assert_eq!(m.make_process_exited(pid_b, -9), Some("b"));
        m.reap();
        // b 的线程不会再被调度。
        assert_eq!(*m.find_next().unwrap(), 0);
        m.make_current_suspend();
        assert_eq!(*m.find_next().unwrap(), 0);
    }

    #[test]
    fn blocked_thread_waits_for_re_enque() {
        let mut m = manager();
        let pid = ProcId::from_usize(50);
        m.add_proc(pid, "proc", ProcId::from_usize(usize::MAX));
        let t = ThreadId::from_usize(50);
        m.add(t, 0, pid);
        m.find_next().unwrap();
        m.make_current_blocked();
        assert!(m.find_next().is_none());
        m.re_enque(t);
        assert!(m.find_next().is_some());
    }
}
