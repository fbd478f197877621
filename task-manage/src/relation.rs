use super::id::{ProcId, ThreadId};
use alloc::vec::Vec;

/// 进程的亲缘关系和它的线程，通过进程 Id 查询。
pub struct ProcThreadRel {
    /// 父进程 Id。
    pub parent: ProcId,
    /// 子进程列表。
    pub children: Vec<ProcId>,
    /// 已经结束、等待父进程收割的子进程。
    pub dead_children: Vec<(ProcId, isize)>,
    /// 进程的线程。
    pub threads: Vec<ThreadId>,
}

impl ProcThreadRel {
    /// new/fork 创建进程时使用。
    pub fn new(parent_pid: ProcId) -> Self {
        Self {
            parent: parent_pid,
            children: Vec::new(),
            dead_children: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// 添加子进程 Id。
    pub fn add_child(&mut self, child_pid: ProcId) {
        self.children.push(child_pid);
    }

    /// 子进程结束，移入 dead_children 等待 wait 系统调用处理。
    pub fn del_child(&mut self, child_pid: ProcId, exit_code: isize) {
        if let Some(idx) = self.children.iter().position(|&id| id == child_pid) {
            let dead = self.children.remove(idx);
            self.dead_children.push((dead, exit_code));
        }
    }

    /// 添加线程。
    pub fn add_thread(&mut self, tid: ThreadId) {
        self.threads.push(tid);
    }

    /// 删除线程。
    pub fn del_thread(&mut self, tid: ThreadId) {
        if let Some(idx) = self.threads.iter().position(|&id| id == tid) {
            self.threads.remove(idx);
        }
    }

    /// 等待任意一个结束的子进程。
    ///
    /// 有结束的返回它，还有活着的返回 `(-2, -1)` 表示要等，
    /// 一个子进程都没有返回 None。
    pub fn wait_any_child(&mut self) -> Option<(ProcId, isize)> {
        if self.dead_children.is_empty() {
            if self.children.is_empty() {
                None
            } else {
                Some((ProcId::from_usize(-2isize as usize), -1))
            }
        } else {
            self.dead_children.pop()
        }
    }

    /// 等待特定的子进程，约定同 [`wait_any_child`](Self::wait_any_child)。
    pub fn wait_child(&mut self, child_pid: ProcId) -> Option<(ProcId, isize)> {
        if let Some(idx) = self
            .dead_children
            .iter()
            .position(|&(id, _)| id == child_pid)
        {
            Some(self.dead_children.remove(idx))
        } else if self.children.contains(&child_pid) {
            Some((ProcId::from_usize(-2isize as usize), -1))
        } else {
            None
        }
    }
}
