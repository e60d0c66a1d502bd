//! Per-core cooperative and preemptive scheduling.
//!
//! Every core owns a FIFO run queue keyed by its local APIC ID. Threads are
//! placed round-robin over the admitted cores at creation time and never
//! migrate afterwards. Preemption is driven by the APIC timer, whose
//! handler funnels into [`yield_from_irq`].

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use hermit_sync::{InterruptSpinMutex, SpinMutex};

use crate::arch::x86_64::kernel::interrupts::{self, InterruptFrame};
use crate::arch::x86_64::kernel::switch::{context_switch, irq_return_trampoline};
use crate::arch::x86_64::kernel::{apic, processor};
use crate::config::MAX_CORES;
use crate::scheduler::task::{Thread, ThreadContext, ThreadFn, ThreadQueue, ThreadRoster};

pub mod task;

/// Scheduler state of one core.
struct CoreScheduler {
	/// Thread currently executing on this core. Written only by the owning
	/// core during a switch, read by the same core otherwise.
	current: AtomicPtr<Thread>,
	/// Threads ready to run here. The interrupt-saving mutex keeps a
	/// spawn on this core from deadlocking against the timer handler.
	run_queue: InterruptSpinMutex<ThreadQueue>,
	/// Finished threads parked until their final switch has completed.
	reap_queue: SpinMutex<ThreadQueue>,
	/// Context save area for the flow of control that entered the kernel on
	/// this core (the "idle" bootstrap thread).
	bootstrap: UnsafeCell<Thread>,
}

// `bootstrap` is only touched by the owning core.
unsafe impl Sync for CoreScheduler {}

impl CoreScheduler {
	const fn new() -> Self {
		Self {
			current: AtomicPtr::new(core::ptr::null_mut()),
			run_queue: InterruptSpinMutex::new(ThreadQueue::new()),
			reap_queue: SpinMutex::new(ThreadQueue::new()),
			bootstrap: UnsafeCell::new(Thread::bootstrap()),
		}
	}
}

static CORES: [CoreScheduler; MAX_CORES] = [const { CoreScheduler::new() }; MAX_CORES];

/// Global roster of every live thread, for diagnostics and reclamation.
/// Interrupt-saving so a holder can never be preempted mid-append.
static THREADS: InterruptSpinMutex<ThreadRoster> = InterruptSpinMutex::new(ThreadRoster::new());

/// APIC IDs of all admitted cores, in admission order.
static CPU_ROSTER: SpinMutex<heapless::Vec<u32, MAX_CORES>> =
	SpinMutex::new(heapless::Vec::new());

/// Round-robin ticket for initial thread placement.
static NEXT_PLACEMENT: AtomicUsize = AtomicUsize::new(0);

/// Once set, cores are indexed by their local APIC ID instead of 0.
static APIC_READY: AtomicBool = AtomicBool::new(false);

/// Index of the calling core into the per-core tables.
///
/// Before the APIC is usable everything runs on the boot processor, which
/// is mapped to index 0.
pub fn core_id() -> usize {
	if !APIC_READY.load(Ordering::Acquire) {
		return 0;
	}
	let id = apic::lapic_id() as usize;
	if id >= MAX_CORES { 0 } else { id }
}

/// Prepares the scheduler on the boot processor.
pub fn init() {
	let core = &CORES[0];
	core.current.store(core.bootstrap.get(), Ordering::Relaxed);
}

/// Registers the calling core's bootstrap context. Called by every
/// application processor once it can be indexed.
pub fn init_cpu() {
	let core = &CORES[core_id()];
	core.current.store(core.bootstrap.get(), Ordering::Relaxed);
}

/// Switches core indexing over to local APIC IDs.
pub fn apic_ready() {
	APIC_READY.store(true, Ordering::Release);

	// The boot processor's state so far lives at index 0; adopt it under
	// the core's real APIC ID.
	let core = &CORES[core_id()];
	if core.current.load(Ordering::Relaxed).is_null() {
		core.current
			.store(CORES[0].current.load(Ordering::Relaxed), Ordering::Relaxed);
	}
}

/// Admits a core to the placement roster. Duplicate and out-of-range IDs
/// are ignored; the roster only ever grows.
pub fn register_cpu(apic_id: u32) {
	if apic_id as usize >= MAX_CORES {
		return;
	}

	let mut roster = CPU_ROSTER.lock();
	if !roster.contains(&apic_id) {
		roster.push(apic_id).ok();
	}
}

pub fn registered_cpus() -> usize {
	CPU_ROSTER.lock().len()
}

/// Round-robin choice over an admission roster.
fn round_robin_pick(roster: &[u32], ticket: usize) -> Option<u32> {
	if roster.is_empty() {
		return None;
	}
	Some(roster[ticket % roster.len()])
}

fn pick_target_core() -> usize {
	let roster = CPU_ROSTER.lock();
	let ticket = NEXT_PLACEMENT.fetch_add(1, Ordering::Relaxed);
	match round_robin_pick(&roster, ticket) {
		Some(apic_id) => apic_id as usize,
		None => {
			drop(roster);
			core_id()
		}
	}
}

/// Creates a thread with record and stack on the kernel heap and enqueues
/// it on the next core in round-robin order.
///
/// Returns `None` when either allocation fails; a partially constructed
/// thread is rolled back.
pub fn spawn(entry: ThreadFn, stack_size: usize) -> Option<NonNull<Thread>> {
	let thread = Thread::allocate(entry, stack_size, thread_entry_trampoline);
	let thread = NonNull::new(thread)?;

	THREADS.lock().push(thread.as_ptr());
	CORES[pick_target_core()]
		.run_queue
		.lock()
		.push(thread.as_ptr());

	Some(thread)
}

/// Frees threads whose final context switch has completed.
///
/// Entries land on the reap queue in `yield_now` right before the switch
/// away from them; once the owning core schedules again, that switch is
/// over and the parked threads are quiescent.
fn reap_finished(core: &CoreScheduler) {
	loop {
		let finished = core.reap_queue.lock().pop();
		let Some(finished) = finished else {
			return;
		};
		THREADS.lock().remove(finished);
		unsafe {
			Thread::release(finished);
		}
	}
}

/// Voluntarily hands the core to the next runnable thread.
///
/// With an empty run queue the bootstrap context sleeps interruptibly and
/// retries; a finished thread instead resumes the bootstrap context, so the
/// flow that started the scheduler regains control once all work is done.
/// Interrupts are disabled across the switch; they are re-enabled by the
/// entry trampoline for fresh threads or by `iretq` for preempted ones.
pub fn yield_now() {
	interrupts::disable();

	let core = &CORES[core_id()];
	reap_finished(core);

	let prev = core.current.load(Ordering::Relaxed);
	if prev.is_null() {
		interrupts::enable();
		return;
	}

	let prev_thread = unsafe { &mut *prev };
	if prev_thread.is_runnable() {
		core.run_queue.lock().push(prev);
	} else if prev_thread.finished {
		core.reap_queue.lock().push(prev);
	}

	let next = loop {
		if let Some(next) = core.run_queue.lock().pop() {
			break next;
		}
		if prev_thread.finished {
			// The last runnable thread just finished: hand the core back
			// to the bootstrap context it was started from.
			break core.bootstrap.get();
		}
		// Nothing runnable: wait for the timer (or another core's spawn)
		// with interrupts briefly enabled.
		interrupts::enable_and_hlt();
		interrupts::disable();
	};

	core.current.store(next, Ordering::Relaxed);
	// Raw pointers, because prev and next may be the same thread when the
	// queue held nothing else.
	unsafe {
		context_switch(&raw mut prev_thread.ctx, &raw const (*next).ctx);
	}
}

/// Preempts the interrupted thread from the timer interrupt.
///
/// The interrupted state is the [`InterruptFrame`] itself: the saved
/// context points at it with the shared `iretq` path as resume address, so
/// the thread continues exactly where the timer hit it. Bootstrap and
/// finished contexts are not preempted, and with nobody else runnable the
/// handler simply returns to the interrupted thread.
pub fn yield_from_irq(frame: &mut InterruptFrame) {
	let core = &CORES[core_id()];

	let prev = core.current.load(Ordering::Relaxed);
	let Some(prev_thread) = (unsafe { prev.as_mut() }) else {
		return;
	};
	if !prev_thread.is_runnable() {
		return;
	}

	prev_thread.ctx.rsp = core::ptr::from_mut(frame) as u64;
	prev_thread.ctx.rip = irq_return_trampoline as usize as u64;

	let next = {
		let mut run_queue = core.run_queue.lock();
		if run_queue.is_empty() {
			return;
		}
		run_queue.push(prev);
		run_queue.pop().unwrap()
	};

	core.current.store(next, Ordering::Relaxed);

	// The dispatch call chain is abandoned; the frame stays intact on the
	// preempted thread's stack until it is resumed.
	let mut scratch = ThreadContext::zeroed();
	unsafe {
		context_switch(&raw mut scratch, &raw const (*next).ctx);
	}
}

/// First code of every fresh thread, entered by `context_switch`.
extern "C" fn thread_entry_trampoline() -> ! {
	let core = &CORES[core_id()];
	let current = core.current.load(Ordering::Relaxed);

	if let Some(entry) = unsafe { current.as_ref() }.and_then(|thread| thread.entry) {
		// The spawning context left interrupts disabled across the switch.
		interrupts::enable();
		entry();
		unsafe {
			(*current).finished = true;
		}
		yield_now();
	}

	// A finished thread is never scheduled again; this is unreachable
	// unless the scheduler state was corrupted.
	loop {
		processor::halt();
	}
}

/// The idle loop application processors live in.
pub fn run() -> ! {
	loop {
		yield_now();
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec::Vec;

	use super::*;

	#[test]
	fn round_robin_cycles_in_admission_order() {
		let roster = [0_u32, 1, 2, 3];

		let picks: Vec<u32> = (0..10)
			.map(|ticket| round_robin_pick(&roster, ticket).unwrap())
			.collect();
		assert_eq!(picks, [0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
	}

	#[test]
	fn round_robin_on_empty_roster_yields_none() {
		assert!(round_robin_pick(&[], 0).is_none());
	}

	#[test]
	fn roster_registration_deduplicates_and_bounds() {
		// Note: the roster is process-wide; use IDs no other test touches.
		register_cpu(200);
		register_cpu(201);
		register_cpu(200);
		register_cpu(MAX_CORES as u32);

		let roster = CPU_ROSTER.lock();
		assert_eq!(roster.iter().filter(|&&id| id == 200).count(), 1);
		assert_eq!(roster.iter().filter(|&&id| id == 201).count(), 1);
		assert!(!roster.contains(&(MAX_CORES as u32)));
	}

	#[test]
	fn core_id_is_zero_before_apic_ready() {
		// APIC_READY is never flipped in host tests.
		assert_eq!(core_id(), 0);
	}
}
