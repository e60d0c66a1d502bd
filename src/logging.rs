use log::{Level, LevelFilter, Metadata, Record};

/// Forwards kernel messages to the console, prefixed with the ID of the
/// core that produced them.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= Level::Info
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			println!(
				"[{}][{}] {}",
				crate::scheduler::core_id(),
				record.level(),
				record.args()
			);
		}
	}

	fn flush(&self) {}
}

pub fn init() {
	log::set_logger(&LOGGER).expect("logging is already initialized");
	log::set_max_level(LevelFilter::Info);
}
