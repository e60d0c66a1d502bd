//! Bring-up of the application processors.
//!
//! The boot processor resolves the MADT, initializes its own local APIC
//! with the advertised base and then wakes every other enabled Local APIC
//! with the INIT-SIPI-SIPI sequence. Each woken processor runs the
//! real-mode trampoline, lands in [`ap_startup`] and hands over to the
//! kernel through the configured hooks.

use core::sync::atomic::{AtomicU32, Ordering};

use hermit_sync::SpinMutex;
use memory_addresses::PhysAddr;

use crate::arch::x86_64::kernel::{acpi, apic};

/// Architectural default base of the local APIC, used when no MADT exists.
const LAPIC_DEFAULT_ADDRESS: u32 = 0xFEE0_0000;

/// Entry hook invoked on each application processor after the low-level
/// wake-up bookkeeping. May return, in which case the processor halts.
pub type ApEntryHook = fn(apic_id: u32);

/// Callbacks decoupling SMP bring-up from the scheduler.
#[derive(Clone, Copy, Default)]
pub struct InitHooks {
	/// Runs on every woken application processor.
	pub ap_entry: Option<ApEntryHook>,
	/// Signals that `apic::lapic_id()` may be used for core indexing.
	pub apic_ready: Option<fn()>,
	/// Admits a core to the scheduler's roster.
	pub register_cpu: Option<fn(u32)>,
}

static HOOKS: SpinMutex<InitHooks> = SpinMutex::new(InitHooks {
	ap_entry: None,
	apic_ready: None,
	register_cpu: None,
});

/// Number of application processors that have reported in.
static AP_ONLINE: AtomicU32 = AtomicU32::new(0);

pub fn online_application_processors() -> u32 {
	AP_ONLINE.load(Ordering::Relaxed)
}

/// Enumerates processors and starts every enabled application processor.
///
/// Falls back to a single core (with the APIC at its architectural default
/// base) when the firmware tables are missing or invalid.
pub fn init(boot_info_address: usize, hooks: InitHooks) {
	*HOOKS.lock() = hooks;
	AP_ONLINE.store(0, Ordering::Relaxed);

	let root = acpi::find_root(boot_info_address);
	let Some(madt) = acpi::find_madt(&root) else {
		println!("SMP: MADT not found, staying single-core.");
		// The timer still needs a working local APIC.
		apic::init(PhysAddr::new(u64::from(LAPIC_DEFAULT_ADDRESS)));
		if let Some(apic_ready) = hooks.apic_ready {
			apic_ready();
		}
		if let Some(register_cpu) = hooks.register_cpu {
			register_cpu(apic::lapic_id());
		}
		return;
	};

	apic::init(PhysAddr::new(u64::from({ madt.local_apic_address })));
	if let Some(apic_ready) = hooks.apic_ready {
		apic_ready();
	}

	let bsp_id = apic::lapic_id();
	if let Some(register_cpu) = hooks.register_cpu {
		register_cpu(bsp_id);
	}

	if hooks.ap_entry.is_none() {
		info!("SMP: no AP entry, staying single-core.");
		return;
	}

	#[cfg(target_os = "none")]
	boot_application_processors(madt, bsp_id, hooks);
}

/// First Rust code executed on a woken application processor.
///
/// Called by the trampoline in long mode with the prepared stack. Reports
/// the core as online, enables its local APIC and enters the kernel hook.
#[cfg(target_os = "none")]
extern "C" fn ap_startup(apic_id: u32) -> ! {
	AP_ONLINE.fetch_add(1, Ordering::Relaxed);
	apic::enable_local();
	info!("AP online, apic_id={apic_id}");

	let ap_entry = HOOKS.lock().ap_entry;
	if let Some(ap_entry) = ap_entry {
		ap_entry(apic_id);
	}

	loop {
		super::processor::halt();
	}
}

#[cfg(target_os = "none")]
fn boot_application_processors(madt: &acpi::Madt, bsp_id: u32, hooks: InitHooks) {
	use core::{mem, ptr};

	use crossbeam_utils::Backoff;
	use x86_64::registers::control::Cr3;

	use super::smp_boot::{ap_trampoline_begin, ap_trampoline_end};
	use crate::config::{
		AP_BOOT_PARAMS_ADDRESS, AP_STACK_SIZE, AP_TRAMPOLINE_ADDRESS, MAX_AP_COUNT,
	};

	/// Parameter block consumed by the trampoline; lives at physical 0x8000.
	#[repr(C)]
	struct ApBootParams {
		pml4_phys: u64,
		entry: u64,
		stack_top: u64,
		apic_id: u32,
		reserved: u32,
	}

	#[repr(align(16))]
	struct ApStackPool(core::cell::UnsafeCell<[[u8; AP_STACK_SIZE]; MAX_AP_COUNT]>);

	// Each stack is handed to exactly one application processor.
	unsafe impl Sync for ApStackPool {}

	static AP_STACKS: ApStackPool =
		ApStackPool(core::cell::UnsafeCell::new([[0; AP_STACK_SIZE]; MAX_AP_COUNT]));

	/// Iterations spent waiting for one processor to report in.
	const ONLINE_WAIT_ITERATIONS: u32 = 2_000_000;

	// Copy the trampoline blob into its fixed low-memory home.
	let code_start = ap_trampoline_begin as usize;
	let code_len = ap_trampoline_end as usize - code_start;
	assert!(
		AP_TRAMPOLINE_ADDRESS + code_len <= AP_BOOT_PARAMS_ADDRESS,
		"AP trampoline does not fit below its parameter block"
	);
	unsafe {
		ptr::copy_nonoverlapping(
			code_start as *const u8,
			AP_TRAMPOLINE_ADDRESS as *mut u8,
			code_len,
		);
	}

	let params = AP_BOOT_PARAMS_ADDRESS as *mut ApBootParams;
	unsafe {
		ptr::write_bytes(params.cast::<u8>(), 0, mem::size_of::<ApBootParams>());
		(&raw mut (*params).pml4_phys).write_volatile(Cr3::read().0.start_address().as_u64());
		(&raw mut (*params).entry).write_volatile(ap_startup as usize as u64);
	}

	let startup_vector = (AP_TRAMPOLINE_ADDRESS >> 12) as u8;
	let mut started: u32 = 0;

	for record in acpi::local_apics(madt) {
		if !record.is_enabled() || u32::from(record.apic_id) == bsp_id {
			continue;
		}
		if started as usize >= MAX_AP_COUNT {
			warn!(
				"Skipping local APIC {}: the static AP stack pool is exhausted",
				record.apic_id
			);
			continue;
		}

		let apic_id = u32::from(record.apic_id);
		let stack_top = unsafe {
			(*AP_STACKS.0.get())[started as usize]
				.as_ptr()
				.add(AP_STACK_SIZE) as u64
		};
		unsafe {
			(&raw mut (*params).stack_top).write_volatile(stack_top);
			(&raw mut (*params).apic_id).write_volatile(apic_id);
		}

		debug!("Waking up core with local APIC ID {apic_id}");

		if let Err(err) = apic::send_init_ipi(apic_id) {
			warn!("{err}, skipping this core");
			continue;
		}
		if let Err(err) = apic::send_startup_ipi(apic_id, startup_vector) {
			warn!("{err}, skipping this core");
			continue;
		}
		// Second STARTUP IPI, as mandated by the MP specification.
		if let Err(err) = apic::send_startup_ipi(apic_id, startup_vector) {
			warn!("{err}, skipping this core");
			continue;
		}

		// Wait for the processor to report in, bounded so that a dead core
		// does not stall boot.
		let backoff = Backoff::new();
		for _ in 0..ONLINE_WAIT_ITERATIONS {
			if AP_ONLINE.load(Ordering::Relaxed) == started + 1 {
				break;
			}
			backoff.spin();
		}
		if AP_ONLINE.load(Ordering::Relaxed) != started + 1 {
			warn!("Core with local APIC ID {apic_id} did not report in time");
		}

		// The core is admitted either way; a late riser still finds its
		// run queue in place.
		if let Some(register_cpu) = hooks.register_cpu {
			register_cpu(apic_id);
		}
		started += 1;
	}

	println!("SMP: started APs.");
}
