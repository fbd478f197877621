//! 在 kernel 的 build.rs 和 src 之间共享链接布局与引导约定。

#![no_std]
#![deny(warnings, missing_docs)]

mod multiboot;

pub use multiboot::{
    BootModule, MemoryArea, MemoryAreaIter, ModuleIter, MultibootInfo, BOOT_MAGIC,
};

/// 内核半空间的起始虚地址，之下是用户半空间。
pub const HIGHER_HALF: usize = 0xc000_0000;

/// 内核映像的物理装载地址。
pub const KERNEL_LOAD: usize = 0x0010_0000;

/// 链接脚本。
///
/// 引导桩连同 multiboot 头放在低端，引导器按物理地址跳进来；
/// 其余部分链接在高半空间，装载地址仍然贴着引导桩。
pub const SCRIPT: &[u8] = b"\
OUTPUT_ARCH(i386)
ENTRY(_start)
SECTIONS {
    . = 0x100000;
    .boot : {
        KEEP(*(.text.multiboot))
        *(.text.entry)
    }
    . = 0xc0101000;
    .text : AT(ADDR(.text) - 0xc0000000) {
        __text = .;
        *(.text .text.*)
    }
    .rodata : ALIGN(4K) AT(ADDR(.rodata) - 0xc0000000) {
        __rodata = .;
        *(.rodata .rodata.*)
    }
    .data : ALIGN(4K) AT(ADDR(.data) - 0xc0000000) {
        __data = .;
        *(.data .data.*)
    }
    .bss : AT(ADDR(.bss) - 0xc0000000) {
        *(.bss.uninit)
        . = ALIGN(4);
        __bss = .;
        *(.bss .bss.*)
    }
    __end = .;
}";

/// 内核地址信息。
#[derive(Debug)]
pub struct KernelLayout {
    /// 代码段开头。
    pub text: usize,
    /// 只读数据段开头。
    pub rodata: usize,
    /// 数据段开头。
    pub data: usize,
    /// .bss 段开头。
    bss: usize,
    /// 内核结束位置。
    pub end: usize,
}

impl KernelLayout {
    /// 定位内核布局。
    #[inline]
    pub fn locate() -> Self {
        extern "C" {
            fn __text();
            fn __rodata();
            fn __data();
            fn __bss();
            fn __end();
        }

        Self {
            text: __text as *const () as _,
            rodata: __rodata as *const () as _,
            data: __data as *const () as _,
            bss: __bss as *const () as _,
            end: __end as *const () as _,
        }
    }

    /// 内核起始虚地址。
    #[inline]
    pub const fn start(&self) -> usize {
        self.text
    }

    /// 内核映像占用的字节数。
    #[inline]
    pub const fn len(&self) -> usize {
        self.end - self.text
    }

    /// 映像是否为空，链接正确时恒为假。
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.end == self.text
    }

    /// 内核映像的物理地址区间，引导桩也算在内。
    #[inline]
    pub const fn p_range(&self) -> core::ops::Range<usize> {
        KERNEL_LOAD..self.end - HIGHER_HALF
    }

    /// 清零 .bss 段。
    ///
    /// # Safety
    ///
    /// 只能在使用任何静态变量之前调用一次。
    #[inline]
    pub unsafe fn zero_bss(&self) {
        core::ptr::write_bytes(self.bss as *mut u8, 0, self.end - self.bss);
    }

    /// 遍历内核映像的各个区域。
    #[inline]
    pub fn iter(&self) -> KernelRegionIter<'_> {
        KernelRegionIter { layout: self, i: 0 }
    }
}

/// 内核映像中一个区域的名字。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelRegionTitle {
    /// 代码段。
    Text,
    /// 只读数据段。
    Rodata,
    /// 数据段。
    Data,
}

/// 内核映像中的一个区域。
pub struct KernelRegion {
    /// 名字。
    pub title: KernelRegionTitle,
    /// 虚地址区间。
    pub range: core::ops::Range<usize>,
}

impl core::fmt::Display for KernelRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self.title {
            KernelRegionTitle::Text => ".text",
            KernelRegionTitle::Rodata => ".rodata",
            KernelRegionTitle::Data => ".data+.bss",
        };
        write!(
            f,
            "{:>11}: {:#10x}..{:#10x}",
            name, self.range.start, self.range.end
        )
    }
}

/// 内核区域迭代器。
pub struct KernelRegionIter<'a> {
    layout: &'a KernelLayout,
    i: usize,
}

impl Iterator for KernelRegionIter<'_> {
    type Item = KernelRegion;

    fn next(&mut self) -> Option<Self::Item> {
        self.i += 1;
        match self.i {
            1 => Some(KernelRegion {
                title: KernelRegionTitle::Text,
                range: self.layout.text..self.layout.rodata,
            }),
            2 => Some(KernelRegion {
                title: KernelRegionTitle::Rodata,
                range: self.layout.rodata..self.layout.data,
            }),
            3 => Some(KernelRegion {
                title: KernelRegionTitle::Data,
                range: self.layout.data..self.layout.end,
            }),
            _ => None,
        }
    }
}

/// 定义内核入口。
///
/// 生成 multiboot 头和 `_start`：建立临时的 4 MiB 大页页目录，
/// 打开分页，把栈搬进高半空间，再把 multiboot 参数传给入口函数。
#[macro_export]
macro_rules! boot0 {
    ($entry:ident; stack = $stack:expr) => {
        #[no_mangle]
        #[link_section = ".bss.uninit"]
        static mut BOOT_STACK: [u8; $stack] = [0u8; $stack];

        #[cfg(target_arch = "x86")]
        core::arch::global_asm!(
            // multiboot 1 头：魔数、flags（模块页对齐 + 内存图）、校验和。
            "   .section .text.multiboot
                .align 4
                .long 0x1badb002
                .long 0x00000003
                .long -(0x1badb002 + 0x00000003)
            ",
            // 引导页目录：
            // 第 0 项把最低 4 MiB 恒等映射，跳转期间代码还在低地址；
            // 第 768 项起把 0xc0000000 映射到物理 0，共 16 MiB。
            "   .section .data
                .align 4096
                boot_page_directory:
                .long 0x00000083
                .fill 767, 4, 0
                .long 0x00000083
                .long 0x00400083
                .long 0x00800083
                .long 0x00c00083
                .fill 252, 4, 0
            ",
            "   .section .text.entry
                .global _start
                _start:
            ",
            // eax = multiboot 魔数，ebx = 信息结构物理地址。
            "   mov ecx, offset boot_page_directory
                sub ecx, {higher_half}
                mov cr3, ecx
                mov ecx, cr4
                or  ecx, 0x10
                mov cr4, ecx
                mov ecx, cr0
                or  ecx, 0x80000000
                mov cr0, ecx
                jmp 2f
                2:
            ",
            "   mov esp, offset BOOT_STACK + {stack_size}
                xor ebp, ebp
                push ebx
                push eax
                call {entry}
                3:
                hlt
                jmp 3b
            ",
            higher_half = const $crate::HIGHER_HALF,
            stack_size = const $stack,
            entry = sym $entry,
        );
    };
}
