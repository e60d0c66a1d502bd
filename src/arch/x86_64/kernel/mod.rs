use core::sync::atomic::{AtomicUsize, Ordering};

pub mod acpi;
pub mod apic;
pub mod interrupts;
pub mod mb2;
pub mod pic;
pub mod processor;
pub mod serial;
pub mod smp;
#[cfg(target_os = "none")]
mod smp_boot;
pub mod switch;
pub mod vga;

/// Physical address of the multiboot2 information blob, handed over by the loader.
static BOOT_INFO_ADDRESS: AtomicUsize = AtomicUsize::new(0);

pub fn set_boot_info_address(address: usize) {
	BOOT_INFO_ADDRESS.store(address, Ordering::Release);
}

pub fn boot_info_address() -> usize {
	BOOT_INFO_ADDRESS.load(Ordering::Acquire)
}

#[cfg(target_os = "none")]
unsafe extern "C" {
	static _kernel_end: u8;
}

/// First address past the kernel image, as placed by the linker script.
#[cfg(target_os = "none")]
pub fn kernel_end_address() -> usize {
	(&raw const _kernel_end) as usize
}

/// Initializes the serial port so that early boot messages reach the host.
pub fn message_output_init() {
	#[cfg(target_os = "none")]
	serial::init();
}
