use core::sync::atomic::{AtomicUsize, Ordering};

/// 进程 Id。
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct ProcId(usize);

impl ProcId {
    /// 分配一个新的进程号，自增不复用。
    pub fn new() -> Self {
        static PID_COUNTER: AtomicUsize = AtomicUsize::new(0);
        Self(PID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// 由数值构造。
    pub const fn from_usize(v: usize) -> Self {
        Self(v)
    }

    /// 数值。
    pub const fn get_usize(&self) -> usize {
        self.0
    }
}

/// 线程 Id。
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct ThreadId(usize);

impl ThreadId {
    /// 分配一个新的线程号，自增不复用。
    pub fn new() -> Self {
        static TID_COUNTER: AtomicUsize = AtomicUsize::new(0);
        Self(TID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// 由数值构造。
    pub const fn from_usize(v: usize) -> Self {
        Self(v)
    }

    /// 数值。
    pub const fn get_usize(&self) -> usize {
        self.0
    }
}
