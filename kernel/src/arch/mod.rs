//! x86 硬件杂务：端口、段表、中断控制器和串口。
//!
//! 所有直接碰硬件的函数在非 x86 目标上退化成空操作，
//! 让整个 crate 可以在宿主机上编译和测试。

pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;
pub mod serial;
