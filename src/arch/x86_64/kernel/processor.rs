use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

use raw_cpuid::CpuId;

/// TSC frequency in MHz, detected once at boot.
static CPU_FREQUENCY_MHZ: AtomicU32 = AtomicU32::new(0);

/// Assumed frequency when CPUID does not report one (old CPUs, some VMMs).
const FALLBACK_FREQUENCY_MHZ: u32 = 2_000;

/// Determines the processor frequency used for calibrated busy-waits.
pub fn detect_frequency() {
	let cpuid = CpuId::new();

	let mhz = cpuid
		.get_processor_frequency_info()
		.map(|info| u32::from(info.processor_base_frequency()))
		.filter(|&mhz| mhz > 0)
		.unwrap_or(FALLBACK_FREQUENCY_MHZ);

	CPU_FREQUENCY_MHZ.store(mhz, Ordering::Relaxed);

	if let Some(brand) = cpuid.get_processor_brand_string() {
		info!("CPU: {} ({mhz} MHz)", brand.as_str().trim());
	} else {
		info!("CPU frequency: {mhz} MHz");
	}
}

fn get_frequency() -> u64 {
	let mhz = CPU_FREQUENCY_MHZ.load(Ordering::Relaxed);
	u64::from(if mhz == 0 { FALLBACK_FREQUENCY_MHZ } else { mhz })
}

fn get_timestamp() -> u64 {
	unsafe { core::arch::x86_64::_rdtsc() }
}

/// Busy-waits for at least the given number of microseconds.
pub fn udelay(usecs: u64) {
	let end = get_timestamp() + get_frequency() * usecs;
	while get_timestamp() < end {
		spin_loop();
	}
}

/// Waits for the next interrupt on this core.
pub fn halt() {
	x86_64::instructions::hlt();
}
