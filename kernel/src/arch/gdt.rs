//! 段表和任务状态段。
//!
//! 平坦模型：内核和用户各一对代码、数据段，外加一个 TSS。
//! 特权级切换时硬件从 TSS 取内核栈，所以每次调度都要更新 esp0。

use kernel_context::KERNEL_DATA;

const TSS_SELECTOR: u16 = 0x28;

#[repr(C, packed)]
struct Tss {
    prev: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 23],
}

static mut TSS: Tss = Tss {
    prev: 0,
    esp0: 0,
    ss0: KERNEL_DATA as u32,
    unused: [0; 23],
};

static mut GDT: [u64; 6] = [0; 6];

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// 组装一个段描述符。
const fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    (limit as u64 & 0xffff)
        | ((base as u64 & 0xff_ffff) << 16)
        | ((access as u64) << 40)
        | (((limit as u64 >> 16) & 0xf) << 48)
        | ((flags as u64 & 0xf) << 52)
        | (((base as u64 >> 24) & 0xff) << 56)
}

/// 装载段表和 TSS。
pub fn init() {
    unsafe {
        let tss_base = core::ptr::addr_of!(TSS) as u32;
        let tss_limit = core::mem::size_of::<Tss>() as u32 - 1;
        let gdt = &mut *core::ptr::addr_of_mut!(GDT);
        gdt[0] = 0;
        // 代码段 0x9a / 数据段 0x92，用户态再置上 DPL=3。
        gdt[1] = descriptor(0, 0xf_ffff, 0x9a, 0xc);
        gdt[2] = descriptor(0, 0xf_ffff, 0x92, 0xc);
        gdt[3] = descriptor(0, 0xf_ffff, 0xfa, 0xc);
        gdt[4] = descriptor(0, 0xf_ffff, 0xf2, 0xc);
        // 32 位可用 TSS。
        gdt[5] = descriptor(tss_base, tss_limit, 0x89, 0x0);

        let pointer = DescriptorPointer {
            limit: core::mem::size_of::<[u64; 6]>() as u16 - 1,
            base: gdt.as_ptr() as u32,
        };
        load(&pointer);
    }
}

/// 特权级切换进内核时使用的栈顶。
pub fn set_kernel_stack(esp0: usize) {
    unsafe { (*core::ptr::addr_of_mut!(TSS)).esp0 = esp0 as u32 };
}

#[cfg(target_arch = "x86")]
unsafe fn load(pointer: &DescriptorPointer) {
    use core::arch::asm;
    use kernel_context::KERNEL_CODE;
    asm!("lgdt [{}]", in(reg) pointer as *const DescriptorPointer);
    // 数据段立即生效。
    asm!(
        "mov ds, {0:x}",
        "mov es, {0:x}",
        "mov fs, {0:x}",
        "mov gs, {0:x}",
        "mov ss, {0:x}",
        in(reg) KERNEL_DATA as u32,
    );
    // 换 cs 要借一次远返回。
    asm!(
        "lea {tmp}, [2f]",
        "push {code}",
        "push {tmp}",
        "retf",
        "2:",
        code = const KERNEL_CODE as u32,
        tmp = out(reg) _,
    );
    asm!("ltr {0:x}", in(reg) TSS_SELECTOR as u32);
}

#[cfg(not(target_arch = "x86"))]
unsafe fn load(_pointer: &DescriptorPointer) {}
