//! Driver for the memory-mapped local APIC (xAPIC mode).
//!
//! Every core owns one local APIC. The BSP programs the APIC base MSR once
//! through [`init`]; application processors only flip the software-enable
//! bit via [`enable_local`] after they reach long mode.

use core::hint::spin_loop;

use hermit_sync::OnceCell;
use memory_addresses::PhysAddr;
use x86_64::registers::model_specific::Msr;

use crate::arch::x86_64::kernel::processor;

/// The IA32_APIC_BASE model-specific register.
const IA32_APIC_BASE: u32 = 0x1B;

const APIC_ID: usize = 0x0020;
const APIC_SVR: usize = 0x00F0;
const APIC_EOI: usize = 0x00B0;
const APIC_ICR1: usize = 0x0300;
const APIC_ICR2: usize = 0x0310;
const APIC_LVT_TIMER: usize = 0x0320;
const APIC_TIMER_INIT_COUNT: usize = 0x0380;
const APIC_TIMER_DIV_CONF: usize = 0x03E0;

const APIC_EOI_ACK: u32 = 0;
const APIC_SVR_ENABLED: u32 = 1 << 8;
const APIC_ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;
const APIC_LVT_TIMER_PERIODIC: u32 = 1 << 17;

/// ICR command for an INIT IPI (assert, edge-triggered).
const APIC_ICR_INIT: u32 = 0x0000_4500;
/// ICR command for a STARTUP IPI; the low byte carries the target page vector.
const APIC_ICR_STARTUP: u32 = 0x0000_4600;

/// Divide configuration code for "divide by 16".
pub const APIC_TIMER_DIVIDE_16: u32 = 0b0011;

/// Bounded retry count for the ICR delivery-status poll.
const DELIVERY_STATUS_RETRIES: u32 = 2_000_000;

bitflags! {
	struct ApicBaseFlags: u64 {
		const X2APIC_ENABLE = 1 << 10;
		const GLOBAL_ENABLE = 1 << 11;
	}
}

#[derive(Debug, thiserror::Error)]
#[error("IPI to local APIC {apic_id} stuck in delivery")]
pub struct DeliveryTimeout {
	pub apic_id: u32,
}

/// MMIO base of the local APIC, identical for every core.
static LOCAL_APIC_ADDRESS: OnceCell<usize> = OnceCell::new();

fn local_apic_base() -> usize {
	*LOCAL_APIC_ADDRESS
		.get()
		.expect("local APIC is not initialized")
}

fn local_apic_read(register: usize) -> u32 {
	unsafe { core::ptr::read_volatile((local_apic_base() + register) as *const u32) }
}

fn local_apic_write(register: usize, value: u32) {
	unsafe {
		core::ptr::write_volatile((local_apic_base() + register) as *mut u32, value);
		// Read back to make sure the write has been posted.
		core::ptr::read_volatile((local_apic_base() + register) as *const u32);
	}
}

/// Initializes the local APIC of the boot processor.
///
/// Sets the global-enable bit in IA32_APIC_BASE, forces xAPIC (MMIO) mode by
/// clearing the x2APIC bit, programs the base field with the address the
/// firmware advertised, and finally software-enables the APIC through the
/// spurious-interrupt-vector register.
pub fn init(lapic_physical_address: PhysAddr) {
	let mut apic_base_msr = Msr::new(IA32_APIC_BASE);
	let mut value = unsafe { apic_base_msr.read() };

	value |= ApicBaseFlags::GLOBAL_ENABLE.bits();
	value &= !ApicBaseFlags::X2APIC_ENABLE.bits();
	value = (value & 0xFFF) | (lapic_physical_address.as_u64() & 0xFFFF_F000);

	unsafe {
		apic_base_msr.write(value);
	}

	LOCAL_APIC_ADDRESS
		.set(lapic_physical_address.as_u64() as usize)
		.ok();

	enable_local();
	debug!(
		"Initialized local APIC at {:#x}",
		lapic_physical_address.as_u64()
	);
}

/// Software-enables the local APIC of the calling core.
///
/// Called by every application processor once it has landed in 64-bit code;
/// the MSR setup of [`init`] does not need to be repeated because the base
/// address is already architectural state.
pub fn enable_local() {
	local_apic_write(
		APIC_SVR,
		local_apic_read(APIC_SVR)
			| APIC_SVR_ENABLED
			| u32::from(crate::config::SPURIOUS_INTERRUPT_NUMBER),
	);
}

/// Local APIC ID of the calling core.
pub fn lapic_id() -> u32 {
	local_apic_read(APIC_ID) >> 24
}

/// Signals end-of-interrupt for the interrupt currently in service.
pub fn eoi() {
	local_apic_write(APIC_EOI, APIC_EOI_ACK);
}

/// Programs the APIC timer on the given vector.
///
/// `divide` is one of the hardware divide-configuration codes (see
/// [`APIC_TIMER_DIVIDE_16`]); writing the initial count starts the timer.
pub fn timer_init(vector: u8, initial_count: u32, divide: u32, periodic: bool) {
	let mut lvt = u32::from(vector);
	if periodic {
		lvt |= APIC_LVT_TIMER_PERIODIC;
	}

	local_apic_write(APIC_TIMER_DIV_CONF, divide);
	local_apic_write(APIC_LVT_TIMER, lvt);
	local_apic_write(APIC_TIMER_INIT_COUNT, initial_count);
}

/// Waits until the previous IPI has left the local APIC's queue.
fn wait_for_delivery(apic_id: u32) -> Result<(), DeliveryTimeout> {
	for _ in 0..DELIVERY_STATUS_RETRIES {
		if local_apic_read(APIC_ICR1) & APIC_ICR_DELIVERY_STATUS_PENDING == 0 {
			return Ok(());
		}
		spin_loop();
	}

	Err(DeliveryTimeout { apic_id })
}

/// Sends an INIT IPI to the given local APIC and waits the mandated ~10 ms.
pub fn send_init_ipi(apic_id: u32) -> Result<(), DeliveryTimeout> {
	local_apic_write(APIC_ICR2, apic_id << 24);
	local_apic_write(APIC_ICR1, APIC_ICR_INIT);
	wait_for_delivery(apic_id)?;

	processor::udelay(10_000);
	Ok(())
}

/// Sends a STARTUP IPI with the given page vector and waits ~200 µs.
pub fn send_startup_ipi(apic_id: u32, vector: u8) -> Result<(), DeliveryTimeout> {
	local_apic_write(APIC_ICR2, apic_id << 24);
	local_apic_write(APIC_ICR1, APIC_ICR_STARTUP | u32::from(vector));
	wait_for_delivery(apic_id)?;

	processor::udelay(200);
	Ok(())
}

pub fn print_information() {
	infoheader!(" MULTIPROCESSOR INFORMATION ");
	infoentry!("APIC in use", "xAPIC");
	infoentry!("Boot processor APIC ID", lapic_id());
	infoentry!("Initialized CPUs", crate::scheduler::registered_cpus());
	infofooter!();
}
