use tracing_subscriber::EnvFilter;

/// Install the global subscriber. The numeric level comes from the CLI;
/// `RUST_LOG` wins when set so per-target filtering stays available.
pub fn setup_logging(level: u8) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();
}

fn level_directive(level: u8) -> &'static str {
	match level {
		0 => "error",
		1 => "warn",
		2 => "info",
		3 => "debug",
		_ => "trace",
	}
}

pub mod testing {
	use tracing_subscriber::EnvFilter;

	/// Best-effort subscriber for tests; repeated installs are fine.
	pub fn setup_test_logging() {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
		let _ = tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_test_writer()
			.try_init();
	}
}
