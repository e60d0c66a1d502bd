//! Stack switching between kernel threads.

use core::arch::naked_asm;

use crate::scheduler::task::ThreadContext;

/// Saves the callee-saved state of the current flow into `old_context` and
/// resumes `new_context`.
///
/// The return address of this very call becomes the saved instruction
/// pointer, so a thread suspended here continues right after the call when
/// it is switched back in. The target context is entered with a plain jump;
/// fresh threads therefore carry a fabricated call frame (see the
/// scheduler's thread setup).
///
/// # Safety
///
/// Both pointers must reference valid [`ThreadContext`] records and
/// interrupts must be disabled around the switch.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
	_old_context: *mut ThreadContext,
	_new_context: *const ThreadContext,
) {
	// rdi = old context, rsi = new context; offsets match ThreadContext.
	naked_asm!(
		"mov [rdi + 0x00], rbx",
		"mov [rdi + 0x08], rbp",
		"mov [rdi + 0x10], r12",
		"mov [rdi + 0x18], r13",
		"mov [rdi + 0x20], r14",
		"mov [rdi + 0x28], r15",
		// The stack pointer to restore is the one after `ret` would have
		// popped the return address.
		"lea rax, [rsp + 8]",
		"mov [rdi + 0x30], rax",
		"mov rax, [rsp]",
		"mov [rdi + 0x38], rax",
		"mov rbx, [rsi + 0x00]",
		"mov rbp, [rsi + 0x08]",
		"mov r12, [rsi + 0x10]",
		"mov r13, [rsi + 0x18]",
		"mov r14, [rsi + 0x20]",
		"mov r15, [rsi + 0x28]",
		"mov rsp, [rsi + 0x30]",
		"jmp qword ptr [rsi + 0x38]",
	)
}

unsafe extern "C" {
	/// Exit path for threads that were preempted from the timer interrupt.
	///
	/// Entered with the stack pointer set to the thread's saved
	/// [`InterruptFrame`](super::interrupts::InterruptFrame); pops the
	/// spilled registers and performs `iretq`.
	pub fn irq_return_trampoline();
}
