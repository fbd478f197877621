//! 8253/8254 可编程间隔定时器。

use super::cpu::outb;

const CHANNEL0: u16 = 0x40;
const COMMAND: u16 = 0x43;
const INPUT_HZ: u32 = 1193182;

/// 时钟中断频率。
pub const TICK_HZ: u32 = 100;

/// 通道 0 设为方波模式，按 [`TICK_HZ`] 触发 IRQ0。
pub fn init() {
    let divisor = INPUT_HZ / TICK_HZ;
    outb(COMMAND, 0x36);
    outb(CHANNEL0, divisor as u8);
    outb(CHANNEL0, (divisor >> 8) as u8);
}
