//! The two legacy 8259 interrupt controllers.
//!
//! The kernel drives interrupts exclusively through the local APICs, so both
//! PICs are masked completely before the IDT is put in place.

use x86_64::instructions::port::Port;

const PIC1_DATA_PORT: u16 = 0x21;
const PIC2_DATA_PORT: u16 = 0xA1;

/// Masks every IRQ line on both PICs.
pub fn mask_all() {
	unsafe {
		Port::<u8>::new(PIC1_DATA_PORT).write(0xFF);
		Port::<u8>::new(PIC2_DATA_PORT).write(0xFF);
	}
}
