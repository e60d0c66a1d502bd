//! A small multiprocessor kernel for 64-bit x86 machines.
//!
//! The loader drops the boot processor into [`kernel_main`] with a
//! multiboot2 information blob. From there the kernel brings up physical
//! memory management, a heap, per-core scheduling with timer-driven
//! preemption, and every application processor the firmware advertises.

#![no_std]
#![allow(clippy::missing_safety_doc)]
// The host build only exists for the unit tests; whatever they leave
// untouched is still wired up in the bare-metal image.
#![cfg_attr(not(target_os = "none"), allow(dead_code))]

// EXTERNAL CRATES
#[macro_use]
extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;

use core::alloc::Layout;

#[macro_use]
mod macros;

mod arch;
mod config;
mod console;
mod logging;
mod mm;
#[cfg(target_os = "none")]
mod runtime_glue;
mod scheduler;

#[cfg(target_os = "none")]
use arch::kernel::processor;
#[cfg(target_os = "none")]
use arch::kernel::smp::InitHooks;
use arch::kernel::{apic, interrupts};
use mm::allocator::LockedAllocator;

#[cfg_attr(target_os = "none", global_allocator)]
static ALLOCATOR: LockedAllocator = LockedAllocator::new();

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments<'_>) {
	#[cfg(target_os = "none")]
	{
		use core::fmt::Write;
		console::CONSOLE.lock().write_fmt(args).unwrap();
	}
	#[cfg(not(target_os = "none"))]
	std::print!("{args}");
}

extern "C" fn worker_hello() {
	println!("[T1] cpu={:#x} hello", apic::lapic_id());
	scheduler::yield_now();
}

extern "C" fn worker_world() {
	println!("[T2] cpu={:#x} world", apic::lapic_id());
	scheduler::yield_now();
}

extern "C" fn worker_heap() {
	let layout = Layout::from_size_align(64, 16).unwrap();
	let probe = unsafe { alloc::alloc::alloc(layout) };
	if !probe.is_null() {
		unsafe {
			alloc::alloc::dealloc(probe, layout);
		}
	}
	println!("[TH] cpu={:#x} heap ok", apic::lapic_id());
	scheduler::yield_now();
}

/// Entry point for every application processor, invoked by SMP bring-up
/// after the low-level wake-up bookkeeping.
fn application_processor_main(apic_id: u32) {
	interrupts::init();
	scheduler::init_cpu();

	debug!("Application processor {apic_id} enters the scheduler");
	interrupts::enable();
	scheduler::run();
}

/// Entry point of the kernel on the boot processor.
///
/// `boot_info` is the physical address of the multiboot2 information blob.
/// The magic value is passed through by the loader but not validated.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(_mb_magic: u32, boot_info: usize) -> ! {
	arch::kernel::set_boot_info_address(boot_info);
	arch::kernel::message_output_init();
	console::clear();
	println!("Booting cinder {} (long mode)", env!("CARGO_PKG_VERSION"));

	logging::init();
	processor::detect_frequency();

	mm::init();
	scheduler::init();

	arch::kernel::smp::init(
		boot_info,
		InitHooks {
			ap_entry: Some(application_processor_main),
			apic_ready: Some(scheduler::apic_ready),
			register_cpu: Some(scheduler::register_cpu),
		},
	);

	interrupts::init();
	info!(
		"{} core(s) registered, {} AP(s) online",
		scheduler::registered_cpus(),
		arch::kernel::smp::online_application_processors()
	);
	mm::physicalmem::print_information();
	apic::print_information();

	// Heap smoke test before anything depends on it.
	let layout = Layout::from_size_align(32, 16).unwrap();
	let probe = unsafe { alloc::alloc::alloc(layout) };
	if probe.is_null() {
		println!("heap: kfree FAILED");
	} else {
		unsafe {
			alloc::alloc::dealloc(probe, layout);
		}
		println!("heap: kfree OK");
	}

	let t1 = scheduler::spawn(worker_hello, config::DEFAULT_STACK_SIZE);
	let t2 = scheduler::spawn(worker_world, config::DEFAULT_STACK_SIZE);
	let th = scheduler::spawn(worker_heap, config::DEFAULT_STACK_SIZE);
	if t1.is_none() || t2.is_none() || th.is_none() {
		error!("Thread creation failed, out of heap memory");
		loop {
			processor::halt();
		}
	}

	interrupts::enable();
	println!("Starting scheduler...");
	scheduler::yield_now();

	println!("DONE");
	interrupts::print_statistics();

	// Keep servicing the timer; new work may still be spawned by the APs.
	interrupts::enable();
	loop {
		processor::halt();
	}
}
