//! Real-mode boot code for application processors.
//!
//! A STARTUP IPI drops the target processor into 16-bit real mode at
//! `CS:IP = (trampoline page):0`. This blob is copied verbatim to physical
//! 0x7000 and walks the processor up into long mode: enable PAE, install
//! the page-table root from the parameter block at 0x8000, set EFER.LME,
//! enable paging and jump through an embedded GDT into 64-bit code, where
//! it loads the prepared stack and calls the configured entry function with
//! the APIC ID as its argument.
//!
//! The parameter block layout is
//! `{u64 pml4_phys, u64 entry, u64 stack_top, u32 apic_id, u32 reserved}`.

core::arch::global_asm!(
	r#"
.code16
.global ap_trampoline_begin
ap_trampoline_begin:
	cli
	cld

	// Address everything through segment zero; the blob sits below 64 KiB.
	xorw %ax, %ax
	movw %ax, %ds
	movw %ax, %es
	movw %ax, %ss

	lgdtl ap_boot_gdt_pointer - ap_trampoline_begin + {trampoline}

	// Physical address extension, required before activating long mode.
	movl %cr4, %eax
	orl $(1 << 5), %eax
	movl %eax, %cr4

	// Page-table root prepared by the boot processor.
	movl {params}, %eax
	movl %eax, %cr3

	// EFER.LME: the paging enable below switches straight into long mode.
	movl $0xC0000080, %ecx
	rdmsr
	orl $(1 << 8), %eax
	wrmsr

	// Protected mode + paging in one go.
	movl %cr0, %eax
	orl $((1 << 31) | (1 << 0)), %eax
	movl %eax, %cr0

	ljmpl $0x08, $(ap_boot_long_mode - ap_trampoline_begin + {trampoline})

.code64
ap_boot_long_mode:
	movw $0x10, %ax
	movw %ax, %ds
	movw %ax, %es
	movw %ax, %ss

	movq {params} + 0x10, %rsp
	movl {params} + 0x18, %edi
	movq {params} + 0x08, %rax
	callq *%rax

1:
	cli
	hlt
	jmp 1b

.balign 8
ap_boot_gdt:
	.quad 0x0000000000000000
	.quad 0x00209A0000000000	// 64-bit code, ring 0
	.quad 0x0000920000000000	// data, ring 0
ap_boot_gdt_pointer:
	.short ap_boot_gdt_pointer - ap_boot_gdt - 1
	.long ap_boot_gdt - ap_trampoline_begin + {trampoline}

.global ap_trampoline_end
ap_trampoline_end:
"#,
	trampoline = const crate::config::AP_TRAMPOLINE_ADDRESS,
	params = const crate::config::AP_BOOT_PARAMS_ADDRESS,
	options(att_syntax),
);

unsafe extern "C" {
	pub fn ap_trampoline_begin();
	pub fn ap_trampoline_end();
}
