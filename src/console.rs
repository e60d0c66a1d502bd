use core::fmt;

use hermit_sync::InterruptTicketMutex;

/// The console sink shared by all cores.
///
/// The ticket mutex saves and disables interrupts while held, so console
/// output from interrupt handlers cannot deadlock against a preempted
/// writer on the same core.
pub static CONSOLE: InterruptTicketMutex<Console> = InterruptTicketMutex::new(Console(()));

pub struct Console(());

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		#[cfg(target_os = "none")]
		{
			crate::arch::kernel::vga::print(s);
			crate::arch::kernel::serial::print(s);
		}
		#[cfg(not(target_os = "none"))]
		let _ = s;
		Ok(())
	}
}

/// Clears the screen and moves the cursor to the top-left corner.
#[cfg(target_os = "none")]
pub fn clear() {
	let _guard = CONSOLE.lock();
	crate::arch::kernel::vga::clear();
}
