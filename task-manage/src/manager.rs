/// 管理任务实体的能力。
pub trait Manage<T, I: Copy + Ord> {
    /// 插入 item。
    fn insert(&mut self, id: I, item: T);
    /// 删除 item，返回实体交由调用者处置。
    fn delete(&mut self, id: I) -> Option<T>;
    /// 获取 mut item。
    fn get_mut(&mut self, id: I) -> Option<&mut T>;
}

/// 根据 id 调度任务的能力。
pub trait Schedule<I: Copy + Ord> {
    /// 添加 id 进入调度队列。
    fn add(&mut self, id: I);
    /// 从调度队列中取出 id。
    fn fetch(&mut self) -> Option<I>;
    /// 把 id 从调度队列中摘除，杀死排队中的任务时使用。
    fn remove(&mut self, id: I);
}
