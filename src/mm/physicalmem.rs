//! Physical frame management over a packed bitmap.
//!
//! One bit per 4 KiB frame, set meaning "in use". The bitmap itself lives
//! in the first page-aligned region past the kernel image and is accounted
//! as used, like every other region the kernel must never hand out.

use core::sync::atomic::{AtomicBool, Ordering};

use align_address::Align;
use hermit_sync::InterruptTicketMutex;
use memory_addresses::PhysAddr;

use crate::mm::PAGE_SIZE;

static PHYSICAL_FRAME_ALLOCATOR: InterruptTicketMutex<FrameBitmap> =
	InterruptTicketMutex::new(FrameBitmap::empty());

/// Release/acquire pair making `init` happen-before every allocation.
static READY: AtomicBool = AtomicBool::new(false);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
	#[error("physical memory manager is not initialized")]
	NotReady,
	#[error("out of physical memory")]
	OutOfMemory,
}

/// The frame bitmap with its bookkeeping counters.
pub(crate) struct FrameBitmap {
	bitmap: *mut u8,
	total_frames: usize,
	free_frames: usize,
}

// The raw bitmap pointer is only ever used under the owning mutex.
unsafe impl Send for FrameBitmap {}

impl FrameBitmap {
	const fn empty() -> Self {
		Self {
			bitmap: core::ptr::null_mut(),
			total_frames: 0,
			free_frames: 0,
		}
	}

	/// Number of bytes needed to track `total_frames` frames.
	pub(crate) fn storage_size(total_frames: usize) -> usize {
		total_frames.div_ceil(8)
	}

	/// Takes over `storage` as the backing bit array and marks every frame
	/// as used. Regions are opened up afterwards via [`Self::mark_range_free`].
	///
	/// # Safety
	///
	/// `storage` must point to at least [`Self::storage_size`] writable
	/// bytes that stay exclusively owned by this bitmap.
	pub(crate) unsafe fn reset(&mut self, storage: *mut u8, total_frames: usize) {
		self.bitmap = storage;
		self.total_frames = total_frames;
		self.free_frames = 0;

		unsafe {
			core::ptr::write_bytes(storage, 0xFF, Self::storage_size(total_frames));
		}
	}

	fn bit_get(&self, frame: usize) -> bool {
		unsafe { (self.bitmap.add(frame >> 3).read() >> (frame & 7)) & 1 != 0 }
	}

	fn bit_set(&mut self, frame: usize) {
		unsafe {
			let byte = self.bitmap.add(frame >> 3);
			byte.write(byte.read() | 1 << (frame & 7));
		}
	}

	fn bit_clear(&mut self, frame: usize) {
		unsafe {
			let byte = self.bitmap.add(frame >> 3);
			byte.write(byte.read() & !(1 << (frame & 7)));
		}
	}

	/// Marks every frame lying entirely within `[base, base + length)` as
	/// free: the base is rounded up, the end rounded down.
	pub(crate) fn mark_range_free(&mut self, base: u64, length: u64) {
		let start = base.align_up(PAGE_SIZE as u64);
		let end = (base + length).align_down(PAGE_SIZE as u64);

		let mut address = start;
		while address < end {
			let frame = (address / PAGE_SIZE as u64) as usize;
			if frame < self.total_frames && self.bit_get(frame) {
				self.bit_clear(frame);
				self.free_frames += 1;
			}
			address += PAGE_SIZE as u64;
		}
	}

	/// Marks every frame touched by `[base, base + length)` as used: both
	/// bounds are rounded outward.
	pub(crate) fn mark_range_used(&mut self, base: u64, length: u64) {
		let start = base.align_down(PAGE_SIZE as u64);
		let end = (base + length).align_up(PAGE_SIZE as u64);

		let mut address = start;
		while address < end {
			let frame = (address / PAGE_SIZE as u64) as usize;
			if frame < self.total_frames && !self.bit_get(frame) {
				self.bit_set(frame);
				self.free_frames -= 1;
			}
			address += PAGE_SIZE as u64;
		}
	}

	/// First-fit scan for a clear bit; lowest address wins.
	pub(crate) fn allocate(&mut self) -> Option<u64> {
		for frame in 0..self.total_frames {
			if !self.bit_get(frame) {
				self.bit_set(frame);
				self.free_frames -= 1;
				return Some(frame as u64 * PAGE_SIZE as u64);
			}
		}

		None
	}

	/// Releases a frame. Out-of-range addresses and frames that are already
	/// free are silently ignored.
	pub(crate) fn deallocate(&mut self, address: u64) {
		let frame = (address / PAGE_SIZE as u64) as usize;
		if frame >= self.total_frames {
			return;
		}
		if self.bit_get(frame) {
			self.bit_clear(frame);
			self.free_frames += 1;
		}
	}

	pub(crate) fn total_frames(&self) -> usize {
		self.total_frames
	}

	pub(crate) fn free_frames(&self) -> usize {
		self.free_frames
	}
}

/// Sizes and populates the frame bitmap from the loader's memory map.
///
/// Without a memory-map tag the manager stays unready and every allocation
/// fails; the kernel keeps running single-core without a heap.
#[cfg(target_os = "none")]
pub fn init(boot_info_address: usize) {
	use crate::arch::x86_64::kernel::{kernel_end_address, mb2};
	use crate::config::{AP_RESERVED_REGION_END, AP_TRAMPOLINE_ADDRESS};

	let Some(memory_map) = mb2::memory_map(boot_info_address) else {
		warn!("No memory map in the boot information, physical memory stays unmanaged");
		return;
	};

	// The bitmap covers everything up to the highest reported address.
	let max_address = mb2::memory_map(boot_info_address)
		.unwrap()
		.map(|entry| entry.base + entry.length)
		.max()
		.unwrap_or(0);
	let total_frames = (max_address.div_ceil(PAGE_SIZE as u64)) as usize;
	if total_frames == 0 {
		warn!("Empty memory map, physical memory stays unmanaged");
		return;
	}

	let bitmap_address = kernel_end_address().align_up(PAGE_SIZE);
	let bitmap_end = bitmap_address + FrameBitmap::storage_size(total_frames);

	let mut allocator = PHYSICAL_FRAME_ALLOCATOR.lock();
	unsafe {
		allocator.reset(bitmap_address as *mut u8, total_frames);
	}

	for entry in memory_map {
		if entry.entry_type == mb2::MEMORY_AVAILABLE {
			allocator.mark_range_free(entry.base, entry.length);
		}
	}

	// Everything the kernel must never hand out: the BIOS/real-mode low
	// megabyte (includes the AP trampoline region, reserved once more for
	// clarity), the kernel image together with the bitmap behind it, and
	// the boot information blob.
	allocator.mark_range_used(0, 0x10_0000);
	allocator.mark_range_used(
		AP_TRAMPOLINE_ADDRESS as u64,
		(AP_RESERVED_REGION_END - AP_TRAMPOLINE_ADDRESS) as u64,
	);
	allocator.mark_range_used(0x10_0000, bitmap_end as u64 - 0x10_0000);
	allocator.mark_range_used(
		boot_info_address as u64,
		mb2::info_total_size(boot_info_address) as u64,
	);

	info!(
		"Physical memory: {} of {} frames free, bitmap at {:#x}",
		allocator.free_frames(),
		allocator.total_frames(),
		bitmap_address
	);
	drop(allocator);

	READY.store(true, Ordering::Release);
}

pub fn is_ready() -> bool {
	READY.load(Ordering::Acquire)
}

/// Allocates one 4 KiB frame.
pub fn allocate_frame() -> Result<PhysAddr, FrameAllocError> {
	if !is_ready() {
		return Err(FrameAllocError::NotReady);
	}

	PHYSICAL_FRAME_ALLOCATOR
		.lock()
		.allocate()
		.map(PhysAddr::new)
		.ok_or(FrameAllocError::OutOfMemory)
}

/// Releases one 4 KiB frame. Bogus addresses are ignored.
pub fn deallocate_frame(address: PhysAddr) {
	if !is_ready() {
		return;
	}

	PHYSICAL_FRAME_ALLOCATOR.lock().deallocate(address.as_u64());
}

pub fn free_frames() -> usize {
	PHYSICAL_FRAME_ALLOCATOR.lock().free_frames()
}

pub fn total_frames() -> usize {
	PHYSICAL_FRAME_ALLOCATOR.lock().total_frames()
}

pub fn print_information() {
	let total = total_frames();
	let free = free_frames();

	infoheader!(" PHYSICAL MEMORY INFORMATION ");
	infoentry!("Total memory", "{} MiB", total * PAGE_SIZE >> 20);
	infoentry!("Free memory", "{} MiB", free * PAGE_SIZE >> 20);
	infoentry!("Frames in use", total - free);
	infofooter!();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec::Vec;

	use super::*;

	const TEST_FRAMES: usize = 1024;

	fn bitmap_with_free_range(storage: &mut Vec<u8>, base: u64, length: u64) -> FrameBitmap {
		storage.resize(FrameBitmap::storage_size(TEST_FRAMES), 0);
		let mut bitmap = FrameBitmap::empty();
		unsafe {
			bitmap.reset(storage.as_mut_ptr(), TEST_FRAMES);
		}
		bitmap.mark_range_free(base, length);
		bitmap
	}

	#[test]
	fn counts_stay_consistent_over_alloc_free_sequences() {
		let mut storage = Vec::new();
		let mut bitmap = bitmap_with_free_range(&mut storage, 0, (TEST_FRAMES * PAGE_SIZE) as u64);

		let total = bitmap.total_frames();
		let mut held = Vec::new();

		for _ in 0..100 {
			held.push(bitmap.allocate().unwrap());
			assert_eq!(bitmap.free_frames() + held.len(), total);
		}
		for address in held.drain(..) {
			bitmap.deallocate(address);
		}
		assert_eq!(bitmap.free_frames(), total);
	}

	#[test]
	fn no_double_allocation() {
		let mut storage = Vec::new();
		let mut bitmap = bitmap_with_free_range(&mut storage, 0, (TEST_FRAMES * PAGE_SIZE) as u64);

		let mut seen = std::collections::HashSet::new();
		while let Some(address) = bitmap.allocate() {
			assert!(seen.insert(address), "frame {address:#x} handed out twice");
		}
		assert_eq!(seen.len(), TEST_FRAMES);
		assert_eq!(bitmap.free_frames(), 0);
	}

	#[test]
	fn first_fit_prefers_lowest_address_and_reuses_freed_frames() {
		let mut storage = Vec::new();
		let mut bitmap = bitmap_with_free_range(&mut storage, 0, (TEST_FRAMES * PAGE_SIZE) as u64);

		let first = bitmap.allocate().unwrap();
		let second = bitmap.allocate().unwrap();
		assert_eq!(first, 0);
		assert_eq!(second, PAGE_SIZE as u64);

		bitmap.deallocate(first);
		assert_eq!(bitmap.allocate().unwrap(), first);
	}

	#[test]
	fn partial_frames_at_region_edges_stay_reserved() {
		// A usable region starting and ending mid-frame only opens up the
		// frames that lie entirely inside it.
		let mut storage = Vec::new();
		let bitmap = bitmap_with_free_range(&mut storage, 0x1800, 0x3000);

		// [0x1800, 0x4800) fully contains only frames 2 and 3.
		assert_eq!(bitmap.free_frames(), 2);
		assert!(bitmap.bit_get(1));
		assert!(!bitmap.bit_get(2));
		assert!(!bitmap.bit_get(3));
		assert!(bitmap.bit_get(4));
	}

	#[test]
	fn reservations_round_outward() {
		let mut storage = Vec::new();
		let mut bitmap = bitmap_with_free_range(&mut storage, 0, (TEST_FRAMES * PAGE_SIZE) as u64);
		let free_before = bitmap.free_frames();

		// One byte into frame 5 and one byte out of frame 6: both reserved.
		bitmap.mark_range_used(5 * PAGE_SIZE as u64 + 0xFFF, 2);
		assert_eq!(bitmap.free_frames(), free_before - 2);
		assert!(bitmap.bit_get(5));
		assert!(bitmap.bit_get(6));
	}

	#[test]
	fn bogus_frees_are_ignored() {
		let mut storage = Vec::new();
		let mut bitmap = bitmap_with_free_range(&mut storage, 0, (TEST_FRAMES * PAGE_SIZE) as u64);

		let address = bitmap.allocate().unwrap();
		let free_before = bitmap.free_frames();

		// Out of range.
		bitmap.deallocate((TEST_FRAMES * PAGE_SIZE) as u64 * 2);
		assert_eq!(bitmap.free_frames(), free_before);

		// Double free: the second call must not bump the counter again.
		bitmap.deallocate(address);
		bitmap.deallocate(address);
		assert_eq!(bitmap.free_frames(), free_before + 1);
	}

	#[test]
	fn frame_bitmap_coverage_matches_memory_map_scenario() {
		// One usable region {base: 0x100000, len: 0x7F00000} and a kernel
		// image ending at 0x200000 with the bitmap placed behind it.
		const TOTAL: usize = 0x800_0000 / PAGE_SIZE;
		let mut storage = vec![0_u8; FrameBitmap::storage_size(TOTAL)];
		let mut bitmap = FrameBitmap::empty();
		unsafe {
			bitmap.reset(storage.as_mut_ptr(), TOTAL);
		}

		assert_eq!(bitmap.total_frames(), 32768);

		bitmap.mark_range_free(0x10_0000, 0x7F0_0000);
		let bitmap_end = 0x20_0000 + FrameBitmap::storage_size(TOTAL) as u64;
		bitmap.mark_range_used(0, 0x10_0000);
		bitmap.mark_range_used(0x10_0000, bitmap_end - 0x10_0000);

		// Everything from the page-rounded bitmap end up to the top of the
		// region is free.
		let reserved_frames = bitmap_end.div_ceil(PAGE_SIZE as u64) as usize;
		assert_eq!(bitmap.free_frames(), 32768 - reserved_frames);
	}
}
