//! 单核环境下的独占访问容器。

use core::{
    cell::{RefCell, RefMut},
    ops::{Deref, DerefMut},
};

/// 可在中断上下文使用的内部可变容器。
///
/// 独占借用期间关闭中断，借用可以嵌套，退出最外层时恢复之前的中断状态。
/// 中断处理函数因此可以安全地获取同一容器而不会死锁。
pub struct UPIntrFreeCell<T> {
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPIntrFreeCell<T> {}

/// 中断屏蔽的嵌套计数，单核全局唯一。
struct IntrMasking {
    depth: usize,
    enabled_before: bool,
}

static mut MASKING: IntrMasking = IntrMasking {
    depth: 0,
    enabled_before: false,
};

impl IntrMasking {
    fn enter() {
        let enabled = intr_get();
        intr_off();
        unsafe {
            let m = &mut *core::ptr::addr_of_mut!(MASKING);
            if m.depth == 0 {
                m.enabled_before = enabled;
            }
            m.depth += 1;
        }
    }

    fn exit() {
        unsafe {
            let m = &mut *core::ptr::addr_of_mut!(MASKING);
            m.depth -= 1;
            if m.depth == 0 && m.enabled_before {
                intr_on();
            }
        }
    }
}

impl<T> UPIntrFreeCell<T> {
    /// 新建容器。
    ///
    /// # Safety
    ///
    /// 仅限单核环境使用。
    pub const unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// 关中断并独占借用。借用存续期间不会发生抢占。
    pub fn exclusive_access(&self) -> UPIntrRefMut<'_, T> {
        IntrMasking::enter();
        UPIntrRefMut(Some(self.inner.borrow_mut()))
    }

    /// 在独占会话中执行闭包。
    #[inline]
    pub fn exclusive_session<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        f(&mut self.exclusive_access())
    }
}

/// 独占借用的守卫，释放时恢复中断状态。
pub struct UPIntrRefMut<'a, T>(Option<RefMut<'a, T>>);

impl<T> Drop for UPIntrRefMut<'_, T> {
    fn drop(&mut self) {
        self.0.take();
        IntrMasking::exit();
    }
}

impl<T> Deref for UPIntrRefMut<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        self.0.as_ref().unwrap()
    }
}

impl<T> DerefMut for UPIntrRefMut<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.0.as_mut().unwrap()
    }
}

#[cfg(target_arch = "x86")]
#[inline]
fn intr_get() -> bool {
    let flags: usize;
    unsafe { core::arch::asm!("pushfd", "pop {}", out(reg) flags) };
    flags & (1 << 9) != 0
}

#[cfg(target_arch = "x86")]
#[inline]
fn intr_on() {
    unsafe { core::arch::asm!("sti") };
}

#[cfg(target_arch = "x86")]
#[inline]
fn intr_off() {
    unsafe { core::arch::asm!("cli") };
}

#[cfg(not(target_arch = "x86"))]
#[inline]
fn intr_get() -> bool {
    false
}

#[cfg(not(target_arch = "x86"))]
#[inline]
fn intr_on() {}

#[cfg(not(target_arch = "x86"))]
#[inline]
fn intr_off() {}
