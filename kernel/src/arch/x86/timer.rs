//! Programmable interval timer (channel 0).

use super::port::outb;

/// PIT input clock in Hz.
const PIT_HZ: u32 = 1_193_180;

/// Program the PIT to fire IRQ0 at `frequency` Hz. The scheduler's tick
/// accounting assumes this runs exactly once at boot.
pub fn init(frequency: u32) {
    let divisor = PIT_HZ / frequency;
    // SAFETY: command 0x36 selects channel 0, lobyte/hibyte, mode 3;
    // the divisor follows in two writes.
    unsafe {
        outb(0x43, 0x36);
        outb(0x40, (divisor & 0xFF) as u8);
        outb(0x40, ((divisor >> 8) & 0xFF) as u8);
    }
    log::info!("pit: {} Hz", frequency);
}
