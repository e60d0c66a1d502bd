#[allow(dead_code)]
pub const KERNEL_STACK_SIZE: usize = 0x8000;

/// Default stack size of a kernel thread created through the scheduler.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

/// Stack size of one entry in the static pool used to boot application processors.
pub const AP_STACK_SIZE: usize = 16 * 1024;

/// Number of stacks in the static AP boot pool. Enabled MADT entries beyond
/// this count are skipped during SMP bring-up.
pub const MAX_AP_COUNT: usize = 8;

/// Upper bound of logical processors, keyed by Local APIC ID.
pub const MAX_CORES: usize = 256;

/// Number of contiguous 4 KiB frames reserved for the kernel heap at boot.
pub const KERNEL_HEAP_PAGES: usize = 128;

pub const TIMER_INTERRUPT_NUMBER: u8 = 0x20;
pub const SPURIOUS_INTERRUPT_NUMBER: u8 = 0xFF;

/// Initial count of the periodic LAPIC timer (divide configuration is 16).
pub const TIMER_INITIAL_COUNT: u32 = 1_000_000;

/// Physical address the AP real-mode trampoline is copied to. The STARTUP
/// vector is derived from it (page number 0x07).
pub const AP_TRAMPOLINE_ADDRESS: usize = 0x7000;

/// Physical address of the parameter block read by the AP trampoline.
pub const AP_BOOT_PARAMS_ADDRESS: usize = 0x8000;

/// End of the low-memory region reserved for trampoline and parameters.
pub const AP_RESERVED_REGION_END: usize = 0xA000;
