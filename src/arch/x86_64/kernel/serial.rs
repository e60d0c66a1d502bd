use hermit_sync::InterruptSpinMutex;
use uart_16550::backend::PioBackend;
use uart_16550::{Config, Uart16550};

const COM1_BASE: u16 = 0x3F8;

static COM1: InterruptSpinMutex<Option<Uart16550<PioBackend>>> = InterruptSpinMutex::new(None);

/// Brings up COM1 so that console output is mirrored to the host.
pub fn init() {
	let mut port = unsafe { Uart16550::new_port(COM1_BASE).expect("valid COM1 port address") };
	port.init(Config::default())
		.expect("COM1 device should initialise successfully");
	*COM1.lock() = Some(port);
}

pub fn print(s: &str) {
	if let Some(port) = COM1.lock().as_mut() {
		for byte in s.bytes() {
			if byte == b'\n' {
				port.send_bytes_exact(&[b'\r']);
			}
			port.send_bytes_exact(&[byte]);
		}
	}
}
