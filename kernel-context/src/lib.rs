//! 内核上下文控制。
//!
//! 每个线程有自己的内核栈。切换线程就是在两个内核栈之间搬移
//! 被调用者保存的寄存器；进入用户态则是从内核栈顶的陷入帧 iret。

#![no_std]
#![deny(warnings, missing_docs)]

use core::mem::size_of;

/// 内核代码段选择子。
pub const KERNEL_CODE: u16 = 0x08;
/// 内核数据段选择子。
pub const KERNEL_DATA: u16 = 0x10;
/// 用户代码段选择子，RPL = 3。
pub const USER_CODE: u16 = 0x18 | 3;
/// 用户数据段选择子，RPL = 3。
pub const USER_DATA: u16 = 0x20 | 3;

const IF: u32 = 1 << 9;
/// eflags 第 1 位恒为 1。
const FLAGS_BASE: u32 = 1 << 1;

/// 陷入上下文。
///
/// 陷入桩按这个布局把现场压在当前内核栈上，字段顺序即压栈顺序的倒序。
/// 从内核态陷入时硬件不压 `user_esp`/`user_ss`，这两个字段只有
/// `cs` 的低两位是 3 时才有意义。
#[repr(C)]
#[derive(Clone)]
pub struct TrapFrame {
    /// 附加段。
    pub gs: u32,
    /// 附加段。
    pub fs: u32,
    /// 附加段。
    pub es: u32,
    /// 数据段。
    pub ds: u32,
    /// 通用寄存器，pushad 布局。
    pub edi: u32,
    /// 通用寄存器。
    pub esi: u32,
    /// 通用寄存器。
    pub ebp: u32,
    esp_scratch: u32,
    /// 通用寄存器。
    pub ebx: u32,
    /// 系统调用参数 2。
    pub edx: u32,
    /// 系统调用参数 1。
    pub ecx: u32,
    /// 系统调用号和返回值。
    pub eax: u32,
    /// 陷入向量号。
    pub vec: u32,
    /// 硬件错误码，没有的向量补 0。
    pub err: u32,
    /// 陷入时的指令指针。
    pub eip: u32,
    /// 陷入时的代码段。
    pub cs: u32,
    /// 陷入时的标志寄存器。
    pub eflags: u32,
    /// 用户栈指针，仅来自用户态的陷入有效。
    pub user_esp: u32,
    /// 用户栈段，仅来自用户态的陷入有效。
    pub user_ss: u32,
}

impl TrapFrame {
    /// 初始化指定入口的用户态陷入帧。
    ///
    /// iret 回用户态时打开中断。
    pub const fn user(entry: usize, user_sp: usize) -> Self {
        Self {
            gs: USER_DATA as u32,
            fs: USER_DATA as u32,
            es: USER_DATA as u32,
            ds: USER_DATA as u32,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_scratch: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            vec: 0,
            err: 0,
            eip: entry as u32,
            cs: USER_CODE as u32,
            eflags: FLAGS_BASE | IF,
            user_esp: user_sp as u32,
            user_ss: USER_DATA as u32,
        }
    }

    /// 陷入是否来自用户态。
    #[inline]
    pub const fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// 系统调用参数，依次取 ebx、ecx、edx、esi、edi。
    #[inline]
    pub fn arg(&self, n: usize) -> usize {
        (match n {
            0 => self.ebx,
            1 => self.ecx,
            2 => self.edx,
            3 => self.esi,
            _ => self.edi,
        }) as usize
    }
}

/// 任务切换时保存的最小上下文：内核栈指针。
///
/// 栈顶依次放着 eflags 和被调用者保存的寄存器，见 `__switch`。
#[repr(C)]
pub struct TaskContext {
    sp: usize,
}

impl TaskContext {
    /// 占位上下文，首次切换前被覆盖。
    pub const ZERO: Self = Self { sp: 0 };

    /// 在内核栈顶伪造一个首次切换帧。
    ///
    /// 切换过来后从 `entry(arg)` 开始执行，`entry` 返回时跳到 `ret`。
    ///
    /// # Safety
    ///
    /// `kstack_top` 必须指向一段可写的、16 字节对齐的栈顶。
    pub unsafe fn kthread(kstack_top: usize, entry: usize, ret: usize, arg: usize) -> Self {
        let mut sp = kstack_top;
        // 依次是 entry 的参数、返回地址、切换帧的 ret 目标、
        // 四个被调用者寄存器和 eflags。
        let frame = [
            arg,
            ret,
            entry,
            0,
            0,
            0,
            0,
            (FLAGS_BASE | IF) as usize,
        ];
        for val in frame {
            sp -= size_of::<usize>();
            (sp as *mut usize).write(val);
        }
        Self { sp }
    }

    /// 在内核栈顶放一个陷入帧，切换过来后直接从它返回用户态。
    ///
    /// fork 出的子线程和新装载的进程都走这条路。
    ///
    /// # Safety
    ///
    /// 同 [`kthread`](Self::kthread)。
    pub unsafe fn returning_to_user(kstack_top: usize, tf: TrapFrame) -> Self {
        let tf_ptr = (kstack_top - size_of::<TrapFrame>()) as *mut TrapFrame;
        tf_ptr.write(tf);
        let mut sp = tf_ptr as usize;
        // 陷入返回路径上保持关中断，iret 才恢复用户的 eflags。
        let frame = [user_return_entry(), 0, 0, 0, 0, FLAGS_BASE as usize];
        for val in frame {
            sp -= size_of::<usize>();
            (sp as *mut usize).write(val);
        }
        Self { sp }
    }

    /// 某线程陷入帧的固定位置：内核栈顶向下一个帧。
    ///
    /// 用户线程每次陷入时内核栈都是空的，所以位置是确定的。
    #[inline]
    pub fn trap_frame_of(kstack_top: usize) -> *mut TrapFrame {
        (kstack_top - size_of::<TrapFrame>()) as *mut TrapFrame
    }
}

#[cfg(target_arch = "x86")]
mod imp {
    use super::TaskContext;

    // 上下文切换和陷入出入口。
    //
    // __switch 把被调用者寄存器和 eflags 压在旧栈上，换栈后反着弹回来。
    // 陷入桩把现场压成 TrapFrame 交给 trap_handler（kernel 侧定义），
    // 返回后从 __user_return 恢复现场 iret。
    core::arch::global_asm!(
        "   .global __switch
            __switch:
            mov eax, [esp + 4]
            mov edx, [esp + 8]
            push ebp
            push ebx
            push esi
            push edi
            pushfd
            mov [eax], esp
            mov esp, [edx]
            popfd
            pop edi
            pop esi
            pop ebx
            pop ebp
            ret
        ",
        "   trap_common:
            pushad
            push ds
            push es
            push fs
            push gs
            mov ax, 0x10
            mov ds, ax
            mov es, ax
            mov fs, ax
            mov gs, ax
            push esp
            call trap_handler
            add esp, 4
            .global __user_return
            __user_return:
            pop gs
            pop fs
            pop es
            pop ds
            popad
            add esp, 8
            iretd
        ",
        // 没有硬件错误码的向量补一个 0 占位。
        "   .global __vector_de
            __vector_de:
            push 0
            push 0
            jmp trap_common
            .global __vector_bp
            __vector_bp:
            push 0
            push 3
            jmp trap_common
            .global __vector_ud
            __vector_ud:
            push 0
            push 6
            jmp trap_common
            .global __vector_df
            __vector_df:
            push 8
            jmp trap_common
            .global __vector_gp
            __vector_gp:
            push 13
            jmp trap_common
            .global __vector_pf
            __vector_pf:
            push 14
            jmp trap_common
            .global __vector_timer
            __vector_timer:
            push 0
            push 32
            jmp trap_common
            .global __vector_syscall
            __vector_syscall:
            push 0
            push 128
            jmp trap_common
            .global __vector_unknown
            __vector_unknown:
            push 0
            push 255
            jmp trap_common
        ",
    );

    extern "C" {
        fn __switch(old: *mut TaskContext, new: *const TaskContext);
        fn __user_return();
        fn __vector_de();
        fn __vector_bp();
        fn __vector_ud();
        fn __vector_df();
        fn __vector_gp();
        fn __vector_pf();
        fn __vector_timer();
        fn __vector_syscall();
        fn __vector_unknown();
    }

    pub unsafe fn switch(old: *mut TaskContext, new: *const TaskContext) {
        __switch(old, new);
    }

    pub fn user_return_entry() -> usize {
        __user_return as usize
    }

    pub fn trap_entries() -> [(u8, usize); 9] {
        [
            (0, __vector_de as usize),
            (3, __vector_bp as usize),
            (6, __vector_ud as usize),
            (8, __vector_df as usize),
            (13, __vector_gp as usize),
            (14, __vector_pf as usize),
            (32, __vector_timer as usize),
            (0x80, __vector_syscall as usize),
            (255, __vector_unknown as usize),
        ]
    }
}

#[cfg(not(target_arch = "x86"))]
mod imp {
    //! 宿主机上的占位实现，保证依赖方可以编译和测试。

    use super::TaskContext;

    pub unsafe fn switch(_old: *mut TaskContext, _new: *const TaskContext) {
        unimplemented!("context switch is only available on x86")
    }

    pub fn user_return_entry() -> usize {
        0
    }

    pub fn trap_entries() -> [(u8, usize); 9] {
        [(0, 0); 9]
    }
}

/// 切换到另一个线程的上下文。
///
/// # Safety
///
/// 两个上下文都必须指向结构完好的切换帧，调用者不能持有跨切换的锁。
#[inline]
pub unsafe fn switch(old: &mut TaskContext, new: &TaskContext) {
    imp::switch(old, new)
}

/// 陷入返回路径的入口地址。
#[inline]
pub fn user_return_entry() -> usize {
    imp::user_return_entry()
}

/// 各陷入向量的入口，`(向量号, 入口地址)`。
#[inline]
pub fn trap_entries() -> [(u8, usize); 9] {
    imp::trap_entries()
}
