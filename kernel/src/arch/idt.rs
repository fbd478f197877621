//! 中断描述符表。

use kernel_context::KERNEL_CODE;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Gate {
    offset_low: u16,
    selector: u16,
    zero: u8,
    attributes: u8,
    offset_high: u16,
}

impl Gate {
    const EMPTY: Self = Self {
        offset_low: 0,
        selector: 0,
        zero: 0,
        attributes: 0,
        offset_high: 0,
    };

    fn new(handler: usize, dpl: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CODE,
            zero: 0,
            // 中断门：进入时自动关中断。
            attributes: 0x8e | (dpl << 5),
            offset_high: (handler >> 16) as u16,
        }
    }
}

static mut IDT: [Gate; 256] = [Gate::EMPTY; 256];

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// 注册陷入入口并装载 IDT。
///
/// 系统调用门的 DPL 是 3，用户态才允许 `int 0x80`；
/// 其余向量全部填上兜底入口。
pub fn init() {
    let entries = kernel_context::trap_entries();
    let unknown = entries[entries.len() - 1].1;
    unsafe {
        let idt = &mut *core::ptr::addr_of_mut!(IDT);
        for gate in idt.iter_mut() {
            *gate = Gate::new(unknown, 0);
        }
        for (vec, handler) in entries {
            let dpl = if vec == 0x80 { 3 } else { 0 };
            idt[vec as usize] = Gate::new(handler, dpl);
        }
        let pointer = DescriptorPointer {
            limit: core::mem::size_of::<[Gate; 256]>() as u16 - 1,
            base: idt.as_ptr() as u32,
        };
        load(&pointer);
    }
}

#[cfg(target_arch = "x86")]
unsafe fn load(pointer: &DescriptorPointer) {
    core::arch::asm!("lidt [{}]", in(reg) pointer as *const DescriptorPointer);
}

#[cfg(not(target_arch = "x86"))]
unsafe fn load(_pointer: &DescriptorPointer) {}
