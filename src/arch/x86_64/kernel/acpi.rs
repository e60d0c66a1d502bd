//! Locating the ACPI tables relevant for multiprocessor bring-up.
//!
//! The loader copies the RSDP into the multiboot2 blob; from there we follow
//! the XSDT (ACPI 2.0+) or the RSDT down to the "Multiple APIC Description
//! Table". All tables live in identity-mapped firmware memory and are only
//! ever read.

use core::{mem, str};

use crate::arch::x86_64::kernel::mb2;

/// Length in bytes of the structure over which the basic (ACPI 1.0) checksum is calculated.
const RSDP_CHECKSUM_LENGTH: usize = 20;

const MADT_SIGNATURE: [u8; 4] = *b"APIC";
const RSDT_SIGNATURE: [u8; 4] = *b"RSDT";
const XSDT_SIGNATURE: [u8; 4] = *b"XSDT";

/// Bit 0 of the Local APIC record flags: the processor is enabled.
pub const CPU_FLAG_ENABLED: u32 = 1 << 0;

/// MADT record type of a Processor Local APIC entry.
const MADT_RECORD_LOCAL_APIC: u8 = 0;

/// The "Root System Description Pointer" structure providing pointers to all other ACPI tables.
#[repr(C, packed)]
struct AcpiRsdp {
	signature: [u8; 8],
	checksum: u8,
	oem_id: [u8; 6],
	revision: u8,
	rsdt_physical_address: u32,
	length: u32,
	xsdt_physical_address: u64,
	extended_checksum: u8,
	reserved: [u8; 3],
}

/// The header of (almost) every ACPI table.
#[repr(C, packed)]
pub struct AcpiSdtHeader {
	signature: [u8; 4],
	pub length: u32,
	revision: u8,
	checksum: u8,
	oem_id: [u8; 6],
	oem_table_id: [u8; 8],
	oem_revision: u32,
	creator_id: u32,
	creator_revision: u32,
}

impl AcpiSdtHeader {
	fn signature(&self) -> &str {
		str::from_utf8(&self.signature).unwrap_or("????")
	}

	fn start_address(&self) -> usize {
		core::ptr::from_ref(self) as usize
	}
}

/// The payload of the "Multiple APIC Description Table".
#[repr(C, packed)]
pub struct Madt {
	pub header: AcpiSdtHeader,
	pub local_apic_address: u32,
	pub flags: u32,
}

#[repr(C, packed)]
struct AcpiMadtRecordHeader {
	entry_type: u8,
	length: u8,
}

/// A type-0 MADT record describing one Local APIC (and thus one processor).
#[repr(C, packed)]
pub struct ProcessorLocalApicRecord {
	entry_type: u8,
	length: u8,
	pub acpi_processor_id: u8,
	pub apic_id: u8,
	pub flags: u32,
}

impl ProcessorLocalApicRecord {
	pub fn is_enabled(&self) -> bool {
		(self.flags & CPU_FLAG_ENABLED) != 0
	}
}

/// Root of the ACPI table hierarchy as recovered from the boot information.
///
/// A zeroed value (no RSDT, no XSDT) means no valid RSDP was found.
#[derive(Clone, Copy, Default)]
pub struct AcpiRoot {
	pub revision: u8,
	pub rsdt_address: Option<usize>,
	pub xsdt_address: Option<usize>,
}

fn verify_checksum(start_address: usize, length: usize) -> Result<(), ()> {
	let slice = unsafe { core::slice::from_raw_parts(start_address as *const u8, length) };
	let checksum = slice
		.iter()
		.fold(0_u8, |acc, &byte| acc.wrapping_add(byte));

	if checksum == 0 { Ok(()) } else { Err(()) }
}

/// Recovers the ACPI root pointers from the boot information.
///
/// The ACPI 2.0+ RSDP tag is preferred and validated with the full-length
/// checksum; the ACPI 1.0 tag is the fallback, validated over its first
/// 20 bytes. If both fail, a zeroed root is returned and SMP bring-up will
/// degrade to a single core.
pub fn find_root(boot_info_address: usize) -> AcpiRoot {
	if let Some(tag) = mb2::find_tag(boot_info_address, mb2::TAG_ACPI_NEW_RSDP) {
		let rsdp = mb2::tag_payload::<AcpiRsdp>(tag);
		let length = { rsdp.length } as usize;
		if length >= mem::size_of::<AcpiRsdp>()
			&& verify_checksum(core::ptr::from_ref(rsdp) as usize, length).is_ok()
		{
			return AcpiRoot {
				revision: rsdp.revision,
				rsdt_address: match rsdp.rsdt_physical_address {
					0 => None,
					address => Some(address as usize),
				},
				xsdt_address: match rsdp.xsdt_physical_address {
					0 => None,
					address => Some(address as usize),
				},
			};
		}
	}

	if let Some(tag) = mb2::find_tag(boot_info_address, mb2::TAG_ACPI_OLD_RSDP) {
		let rsdp = mb2::tag_payload::<AcpiRsdp>(tag);
		if verify_checksum(core::ptr::from_ref(rsdp) as usize, RSDP_CHECKSUM_LENGTH).is_ok() {
			return AcpiRoot {
				revision: rsdp.revision,
				rsdt_address: match rsdp.rsdt_physical_address {
					0 => None,
					address => Some(address as usize),
				},
				xsdt_address: None,
			};
		}
	}

	debug!("No valid RSDP found in the boot information");
	AcpiRoot::default()
}

/// Checks that `address` holds a plausible, checksummed SDT with the wanted signature.
fn validate_sdt(address: usize, signature: [u8; 4]) -> Option<&'static AcpiSdtHeader> {
	if address == 0 {
		return None;
	}

	let header = unsafe { &*(address as *const AcpiSdtHeader) };
	let length = { header.length } as usize;
	if length < mem::size_of::<AcpiSdtHeader>() {
		return None;
	}
	if header.signature != signature {
		return None;
	}
	verify_checksum(address, length).ok()?;

	Some(header)
}

/// Walks the XSDT (64-bit entries) for a table with the given signature.
fn find_in_xsdt(xsdt: &AcpiSdtHeader, signature: [u8; 4]) -> Option<&'static AcpiSdtHeader> {
	let entries_start = xsdt.start_address() + mem::size_of::<AcpiSdtHeader>();
	let count = ({ xsdt.length } as usize - mem::size_of::<AcpiSdtHeader>()) / 8;

	for i in 0..count {
		// The entry array is only 4-byte aligned, so read unaligned.
		let entry =
			unsafe { ((entries_start + i * 8) as *const u64).read_unaligned() } as usize;
		if let Some(header) = validate_sdt(entry, signature) {
			return Some(header);
		}
	}

	None
}

/// Walks the RSDT (32-bit entries) for a table with the given signature.
fn find_in_rsdt(rsdt: &AcpiSdtHeader, signature: [u8; 4]) -> Option<&'static AcpiSdtHeader> {
	let entries_start = rsdt.start_address() + mem::size_of::<AcpiSdtHeader>();
	let count = ({ rsdt.length } as usize - mem::size_of::<AcpiSdtHeader>()) / 4;

	for i in 0..count {
		let entry =
			unsafe { ((entries_start + i * 4) as *const u32).read_unaligned() } as usize;
		if let Some(header) = validate_sdt(entry, signature) {
			return Some(header);
		}
	}

	None
}

/// Resolves the MADT starting from the recovered ACPI root.
///
/// With an ACPI 2.0+ root the XSDT is walked first; the RSDT serves as a
/// safety net when the XSDT path fails.
pub fn find_madt(root: &AcpiRoot) -> Option<&'static Madt> {
	if root.revision >= 2 {
		if let Some(xsdt_address) = root.xsdt_address {
			if let Some(xsdt) = validate_sdt(xsdt_address, XSDT_SIGNATURE) {
				if let Some(madt) = find_in_xsdt(xsdt, MADT_SIGNATURE) {
					debug!("Found MADT via XSDT, signature {}", madt.signature());
					return Some(unsafe {
						&*(core::ptr::from_ref(madt) as *const Madt)
					});
				}
			}
		}
	}

	if let Some(rsdt_address) = root.rsdt_address {
		if let Some(rsdt) = validate_sdt(rsdt_address, RSDT_SIGNATURE) {
			if let Some(madt) = find_in_rsdt(rsdt, MADT_SIGNATURE) {
				debug!("Found MADT via RSDT, signature {}", madt.signature());
				return Some(unsafe { &*(core::ptr::from_ref(madt) as *const Madt) });
			}
		}
	}

	None
}

/// Iterator over the Processor Local APIC records of a MADT.
pub struct LocalApicIter {
	current: usize,
	end: usize,
}

impl Iterator for LocalApicIter {
	type Item = &'static ProcessorLocalApicRecord;

	fn next(&mut self) -> Option<Self::Item> {
		while self.current + mem::size_of::<AcpiMadtRecordHeader>() <= self.end {
			let record = unsafe { &*(self.current as *const AcpiMadtRecordHeader) };
			let length = record.length as usize;
			if length < mem::size_of::<AcpiMadtRecordHeader>() {
				return None;
			}

			let start = self.current;
			self.current += length;

			if record.entry_type == MADT_RECORD_LOCAL_APIC
				&& length >= mem::size_of::<ProcessorLocalApicRecord>()
			{
				return Some(unsafe { &*(start as *const ProcessorLocalApicRecord) });
			}
		}

		None
	}
}

/// Iterates over all type-0 (Processor Local APIC) entries of the MADT.
pub fn local_apics(madt: &Madt) -> LocalApicIter {
	let start = core::ptr::from_ref(madt) as usize;

	LocalApicIter {
		current: start + mem::size_of::<Madt>(),
		end: start + { madt.header.length } as usize,
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec::Vec;

	use super::*;

	fn patch_checksum(table: &mut [u8], at: usize, range: core::ops::Range<usize>) {
		table[at] = 0;
		let sum = table[range.clone()]
			.iter()
			.fold(0_u8, |acc, &b| acc.wrapping_add(b));
		table[at] = 0_u8.wrapping_sub(sum);
	}

	fn sdt_header(signature: [u8; 4], length: u32) -> Vec<u8> {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(&signature);
		bytes.extend_from_slice(&length.to_le_bytes());
		bytes.push(2); // revision
		bytes.push(0); // checksum, patched later
		bytes.extend_from_slice(b"CINDER"); // oem_id
		bytes.extend_from_slice(b"CINDERTB"); // oem_table_id
		bytes.extend_from_slice(&1_u32.to_le_bytes()); // oem_revision
		bytes.extend_from_slice(&0_u32.to_le_bytes()); // creator_id
		bytes.extend_from_slice(&0_u32.to_le_bytes()); // creator_revision
		bytes
	}

	/// A MADT with four enabled Local APIC records (IDs 0..=3).
	fn build_madt() -> Vec<u8> {
		let length = 36 + 8 + 4 * 8;
		let mut bytes = sdt_header(MADT_SIGNATURE, length as u32);
		bytes.extend_from_slice(&0xFEE0_0000_u32.to_le_bytes()); // local_apic_address
		bytes.extend_from_slice(&1_u32.to_le_bytes()); // flags

		for id in 0..4_u8 {
			bytes.push(0); // type: Processor Local APIC
			bytes.push(8); // length
			bytes.push(id); // acpi_processor_id
			bytes.push(id); // apic_id
			bytes.extend_from_slice(&CPU_FLAG_ENABLED.to_le_bytes());
		}

		patch_checksum(&mut bytes, 9, 0..length);
		bytes
	}

	fn build_xsdt(entry: u64) -> Vec<u8> {
		let length = 36 + 8;
		let mut bytes = sdt_header(XSDT_SIGNATURE, length as u32);
		bytes.extend_from_slice(&entry.to_le_bytes());
		patch_checksum(&mut bytes, 9, 0..length);
		bytes
	}

	#[test]
	fn checksum_detects_corruption() {
		let madt = build_madt();
		assert!(verify_checksum(madt.as_ptr() as usize, madt.len()).is_ok());

		let mut broken = madt.clone();
		broken[20] ^= 0xFF;
		assert!(verify_checksum(broken.as_ptr() as usize, broken.len()).is_err());
	}

	#[test]
	fn madt_found_through_xsdt() {
		let madt = build_madt();
		let xsdt = build_xsdt(madt.as_ptr() as u64);

		let root = AcpiRoot {
			revision: 2,
			rsdt_address: None,
			xsdt_address: Some(xsdt.as_ptr() as usize),
		};

		let found = find_madt(&root).unwrap();
		assert_eq!({ found.local_apic_address }, 0xFEE0_0000);
	}

	#[test]
	fn corrupt_xsdt_yields_no_madt() {
		let madt = build_madt();
		let mut xsdt = build_xsdt(madt.as_ptr() as u64);
		xsdt[9] ^= 0x55; // break the checksum

		let root = AcpiRoot {
			revision: 2,
			rsdt_address: None,
			xsdt_address: Some(xsdt.as_ptr() as usize),
		};

		assert!(find_madt(&root).is_none());
	}

	#[test]
	fn zeroed_root_yields_no_madt() {
		assert!(find_madt(&AcpiRoot::default()).is_none());
	}

	#[test]
	fn local_apic_records_are_enumerated() {
		let madt_bytes = build_madt();
		let madt = unsafe { &*(madt_bytes.as_ptr() as *const Madt) };

		let ids: Vec<u8> = local_apics(madt).map(|r| r.apic_id).collect();
		assert_eq!(ids, [0, 1, 2, 3]);
		assert!(local_apics(madt).all(|r| r.is_enabled()));
	}
}
