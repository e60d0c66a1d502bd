pub mod allocator;
pub mod physicalmem;

/// Size of one physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Collects up to `count` frames into an address-contiguous run.
///
/// The first-fit frame allocator hands out ascending addresses, so under
/// normal conditions the run covers all `count` frames. When a hole in the
/// physical map breaks the run, the frame beyond the hole is returned to
/// the allocator and the shorter run is used.
#[cfg(target_os = "none")]
fn allocate_contiguous_frames(count: usize) -> Option<(u64, usize)> {
	let mut first = None;
	let mut previous = 0_u64;
	let mut frames = 0_usize;

	for _ in 0..count {
		let Ok(frame) = physicalmem::allocate_frame() else {
			break;
		};
		let address = frame.as_u64();

		match first {
			None => first = Some(address),
			Some(_) => {
				if address != previous + PAGE_SIZE as u64 {
					physicalmem::deallocate_frame(frame);
					break;
				}
			}
		}
		previous = address;
		frames += 1;
	}

	first.map(|start| (start, frames))
}

/// Initializes the physical memory manager and carves the kernel heap out
/// of a contiguous frame run.
#[cfg(target_os = "none")]
pub fn init() {
	use crate::arch::kernel::boot_info_address;
	use crate::config::KERNEL_HEAP_PAGES;

	physicalmem::init(boot_info_address());

	let Some((start, frames)) = allocate_contiguous_frames(KERNEL_HEAP_PAGES) else {
		warn!("No frames available, the kernel heap stays unavailable");
		return;
	};
	if frames < KERNEL_HEAP_PAGES {
		warn!(
			"Contiguous run ended early, the heap covers {frames} of {KERNEL_HEAP_PAGES} pages"
		);
	}

	let size = frames * PAGE_SIZE;
	if unsafe { crate::ALLOCATOR.init(start as usize, size) } {
		info!("Kernel heap: {} KiB at {:#x}", size >> 10, start);
	} else {
		warn!("Heap region too small, the kernel heap stays unavailable");
	}
}
