//! Interrupt descriptor table and vector dispatch.
//!
//! All 256 vectors funnel through generated stubs that push the vector
//! number (and a dummy error code where the CPU supplies none), spill the
//! general-purpose registers into an [`InterruptFrame`] and call the common
//! dispatcher. The IDT is built exactly once and loaded on every core.

use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use hermit_sync::SpinMutex;
use x86_64::registers::segmentation::{CS, Segment};
use x86_64::structures::DescriptorTablePointer;

use crate::arch::x86_64::kernel::{apic, pic, processor};
use crate::config::{
	SPURIOUS_INTERRUPT_NUMBER, TIMER_INITIAL_COUNT, TIMER_INTERRUPT_NUMBER,
};
use crate::scheduler;

pub use x86_64::instructions::interrupts::{disable, enable, enable_and_hlt};

const IDT_ENTRIES: usize = 256;
const EXCEPTION_VECTORS: u64 = 0x20;

/// Register state spilled by the interrupt stubs, in push order.
///
/// `vector` and `error` are placed by the stub, everything from `rip` on by
/// the CPU. The layout must match the assembly in [`switch`](super::switch).
#[repr(C)]
pub struct InterruptFrame {
	pub r15: u64,
	pub r14: u64,
	pub r13: u64,
	pub r12: u64,
	pub r11: u64,
	pub r10: u64,
	pub r9: u64,
	pub r8: u64,
	pub rdi: u64,
	pub rsi: u64,
	pub rbp: u64,
	pub rbx: u64,
	pub rdx: u64,
	pub rcx: u64,
	pub rax: u64,
	pub vector: u64,
	pub error: u64,
	pub rip: u64,
	pub cs: u64,
	pub rflags: u64,
	pub rsp: u64,
	pub ss: u64,
}

const _: () = assert!(mem::size_of::<InterruptFrame>() == 22 * 8);

pub type InterruptHandler = fn(&mut InterruptFrame);

/// An interrupt gate descriptor.
///
/// See Intel manual 3a, section "6.14.1 64-Bit Mode IDT".
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
	base_lo: u16,
	selector: u16,
	ist_index: u8,
	flags: u8,
	base_mid: u16,
	base_hi: u32,
	reserved: u32,
}

impl IdtEntry {
	/// Present, DPL 0, 64-bit interrupt gate.
	const FLAGS: u8 = 0x8E;

	const MISSING: Self = Self {
		base_lo: 0,
		selector: 0,
		ist_index: 0,
		flags: 0,
		base_mid: 0,
		base_hi: 0,
		reserved: 0,
	};

	fn new(handler: usize, selector: u16) -> Self {
		Self {
			base_lo: (handler & 0xFFFF) as u16,
			selector,
			ist_index: 0,
			flags: Self::FLAGS,
			base_mid: ((handler >> 16) & 0xFFFF) as u16,
			base_hi: (handler >> 32) as u32,
			reserved: 0,
		}
	}
}

struct IdtTable(core::cell::UnsafeCell<[IdtEntry; IDT_ENTRIES]>);

// The table is written only inside the one-shot build transaction and read
// by the CPU afterwards.
unsafe impl Sync for IdtTable {}

static IDT: IdtTable = IdtTable(core::cell::UnsafeCell::new(
	[IdtEntry::MISSING; IDT_ENTRIES],
));
static IDT_BUILT: AtomicBool = AtomicBool::new(false);
static IDT_BUILD_LOCK: SpinMutex<()> = SpinMutex::new(());

/// Registered handler per vector, stored as a function-pointer address.
static INTERRUPT_HANDLERS: [AtomicUsize; IDT_ENTRIES] =
	[const { AtomicUsize::new(0) }; IDT_ENTRIES];

/// How often each vector has been dispatched, over all cores.
static IRQ_COUNTERS: [AtomicU64; IDT_ENTRIES] = [const { AtomicU64::new(0) }; IDT_ENTRIES];

unsafe extern "C" {
	#[link_name = "isr_stub_table"]
	static ISR_STUB_TABLE: [usize; IDT_ENTRIES];
}

static EXCEPTION_NAMES: [&str; 32] = [
	"Divide Error",
	"Debug",
	"Non-Maskable Interrupt",
	"Breakpoint",
	"Overflow",
	"BOUND Range Exceeded",
	"Invalid Opcode",
	"Device Not Available",
	"Double Fault",
	"Coprocessor Segment Overrun",
	"Invalid TSS",
	"Segment Not Present",
	"Stack Segment Fault",
	"General Protection",
	"Page Fault",
	"Reserved",
	"Floating-Point Error",
	"Alignment Check",
	"Machine Check",
	"SIMD Floating-Point",
	"Virtualization",
	"Control Protection",
	"Reserved",
	"Reserved",
	"Reserved",
	"Reserved",
	"Reserved",
	"Reserved",
	"Hypervisor Injection",
	"VMM Communication",
	"Security",
	"Reserved",
];

/// Installs a handler for the given vector.
///
/// The handler table is process-wide: the same handler serves the vector on
/// every core. Handlers for external interrupts are responsible for sending
/// the end-of-interrupt themselves.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
	INTERRUPT_HANDLERS[usize::from(vector)].store(handler as usize, Ordering::Release);
}

fn timer_handler(frame: &mut InterruptFrame) {
	apic::eoi();
	scheduler::yield_from_irq(frame);
}

fn spurious_handler(_frame: &mut InterruptFrame) {
	apic::eoi();
}

/// Builds the IDT exactly once, no matter how many cores race into it.
fn build_idt_once() {
	if IDT_BUILT.load(Ordering::Acquire) {
		return;
	}

	let _guard = IDT_BUILD_LOCK.lock();
	if IDT_BUILT.load(Ordering::Relaxed) {
		return;
	}

	// The legacy PICs must not deliver anything once interrupts are enabled.
	pic::mask_all();

	let selector = CS::get_reg().0;
	let idt = IDT.0.get();
	for vector in 0..IDT_ENTRIES {
		let stub = unsafe { ISR_STUB_TABLE[vector] };
		unsafe {
			(*idt)[vector] = IdtEntry::new(stub, selector);
		}
	}

	register_handler(TIMER_INTERRUPT_NUMBER, timer_handler);
	register_handler(SPURIOUS_INTERRUPT_NUMBER, spurious_handler);

	IDT_BUILT.store(true, Ordering::Release);
}

fn load_idt() {
	let pointer = DescriptorTablePointer {
		limit: (mem::size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
		base: x86_64::VirtAddr::new(IDT.0.get() as u64),
	};

	unsafe {
		x86_64::instructions::tables::lidt(&pointer);
	}
}

/// Prepares interrupt handling on the calling core.
///
/// Builds the shared IDT on first use, loads it, and starts the periodic
/// APIC timer that drives preemption. The local APIC must already be
/// enabled on this core.
pub fn init() {
	build_idt_once();
	load_idt();

	apic::timer_init(
		TIMER_INTERRUPT_NUMBER,
		TIMER_INITIAL_COUNT,
		apic::APIC_TIMER_DIVIDE_16,
		true,
	);
}

pub fn print_statistics() {
	infoheader!(" INTERRUPT STATISTICS ");
	for (vector, counter) in IRQ_COUNTERS.iter().enumerate() {
		let count = counter.load(Ordering::Relaxed);
		if count > 0 {
			infoentry!("Vector", "{:#04x}: {} interrupt(s)", vector, count);
		}
	}
	infofooter!();
}

/// Common dispatcher behind all 256 stubs.
#[unsafe(no_mangle)]
extern "C" fn isr_dispatch(frame: *mut InterruptFrame) {
	if frame.is_null() {
		return;
	}
	let frame = unsafe { &mut *frame };
	let vector = (frame.vector & 0xFF) as usize;
	IRQ_COUNTERS[vector].fetch_add(1, Ordering::Relaxed);

	let handler = INTERRUPT_HANDLERS[vector].load(Ordering::Acquire);
	if handler != 0 {
		let handler: InterruptHandler = unsafe { mem::transmute(handler) };
		handler(frame);
		return;
	}

	if frame.vector < EXCEPTION_VECTORS {
		let name = EXCEPTION_NAMES[vector];
		error!(
			"Unhandled {name} exception, vector={:#x} error={:#x} rip={:#x}",
			frame.vector, frame.error, frame.rip
		);
		loop {
			processor::halt();
		}
	}

	// Unhandled external interrupt: acknowledge and carry on.
	apic::eoi();
}

// Stub generation. Every vector gets a tiny stub that pushes a dummy error
// code (unless the CPU pushed a real one), pushes its vector number and
// jumps into the common register-spill path. `irq_return_trampoline` is the
// shared exit: a preempted thread whose saved context points at its
// interrupt frame is resumed by jumping here with RSP set to that frame.
core::arch::global_asm!(
	r#"
.altmacro

.macro isr_stub vector
	.balign 16
isr_stub_\vector:
.if \vector == 8 || \vector == 10 || \vector == 11 || \vector == 12 || \vector == 13 || \vector == 14 || \vector == 17 || \vector == 21 || \vector == 29 || \vector == 30
.else
	push 0
.endif
	push \vector
	jmp isr_common
.endm

.macro isr_stub_entry vector
	.quad isr_stub_\vector
.endm

.section .text
.balign 16
isr_common:
	push rax
	push rcx
	push rdx
	push rbx
	push rbp
	push rsi
	push rdi
	push r8
	push r9
	push r10
	push r11
	push r12
	push r13
	push r14
	push r15
	cld
	mov rdi, rsp
	call {dispatch}

.global irq_return_trampoline
irq_return_trampoline:
	pop r15
	pop r14
	pop r13
	pop r12
	pop r11
	pop r10
	pop r9
	pop r8
	pop rdi
	pop rsi
	pop rbp
	pop rbx
	pop rdx
	pop rcx
	pop rax
	add rsp, 16
	iretq

.set vector, 0
.rept 256
	isr_stub %vector
	.set vector, vector + 1
.endr

.section .rodata
.balign 8
.global isr_stub_table
isr_stub_table:
.set vector, 0
.rept 256
	isr_stub_entry %vector
	.set vector, vector + 1
.endr

.text
"#,
	dispatch = sym isr_dispatch,
);

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn frame_field_offsets_match_stub_layout() {
		assert_eq!(mem::offset_of!(InterruptFrame, r15), 0);
		assert_eq!(mem::offset_of!(InterruptFrame, rax), 14 * 8);
		assert_eq!(mem::offset_of!(InterruptFrame, vector), 15 * 8);
		assert_eq!(mem::offset_of!(InterruptFrame, error), 16 * 8);
		assert_eq!(mem::offset_of!(InterruptFrame, rip), 17 * 8);
		assert_eq!(mem::offset_of!(InterruptFrame, ss), 21 * 8);
	}

	#[test]
	fn stub_table_has_distinct_entries() {
		let table = unsafe { &ISR_STUB_TABLE };
		assert!(table.iter().all(|&stub| stub != 0));
		for window in table.windows(2) {
			assert_ne!(window[0], window[1]);
		}
	}

	#[test]
	fn handlers_are_registered_per_vector() {
		fn probe(_frame: &mut InterruptFrame) {}

		register_handler(0x41, probe);
		assert_eq!(
			INTERRUPT_HANDLERS[0x41].load(Ordering::Acquire),
			probe as usize
		);
		assert_eq!(INTERRUPT_HANDLERS[0x42].load(Ordering::Acquire), 0);
	}
}
