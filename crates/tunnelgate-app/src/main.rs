use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use gate_core::scheduler::Scheduler;
use gate_core::signal::Shutdown;
use gate_core::telemetry;
use nix::sys::signal::{SigHandler, Signal, signal};
use prometheus_client::registry::Registry;
use tracing::{info, warn};
use tunnelgate::Config;
use tunnelgate::proxy::{Ingress, Splice};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static DUMP_STATS: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: libc::c_int) {
	SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_stats_signal(_: libc::c_int) {
	DUMP_STATS.store(true, Ordering::SeqCst);
}

extern "C" fn on_null_signal(_: libc::c_int) {}

#[derive(Parser, Debug)]
#[command(name = "tunnelgate", about = "High-throughput HTTP/HTTPS forward proxy")]
struct Args {
	/// Listen port for proxied traffic
	#[arg(short = 'p', long = "port", value_name = "port", default_value_t = 8080)]
	port: u16,

	/// Numeric log level: 0=error, 1=warn, 2=info, 3=debug, 4=trace
	#[arg(short = 'l', long = "log-level", value_name = "level", default_value_t = 2)]
	log_level: u8,
}

fn main() -> anyhow::Result<()> {
	let args = Args::try_parse().unwrap_or_else(|e| {
		let _ = e.print();
		process::exit(1)
	});
	telemetry::setup_logging(args.log_level);
	install_signal_handlers()?;

	let cfg = Config {
		port: args.port,
		..Config::default()
	};

	let shutdown = Shutdown::new();
	let scheduler = Scheduler::new();
	let mut registry = Registry::with_prefix("tunnelgate");

	// Leaf order: the splice stage exists before ingress feeds it.
	let splice = Splice::new(&cfg, shutdown.clone(), &mut registry);
	let ingress = Ingress::new(&cfg, shutdown.clone(), splice.clone(), &mut registry)?;
	splice.clone().start(&scheduler);
	ingress.clone().start(&scheduler);
	info!(port = ingress.local_port(), "started");

	while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
		if DUMP_STATS.swap(false, Ordering::SeqCst) {
			dump_stats(&ingress, &splice);
		}
		std::thread::sleep(Duration::from_millis(200));
	}

	info!("stopping");
	shutdown.trigger();
	ingress.join();
	splice.join();
	scheduler.stop();
	info!("exiting");
	Ok(())
}

fn install_signal_handlers() -> anyhow::Result<()> {
	unsafe {
		// Writes to a reset peer must surface as EPIPE, not kill the process.
		signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
		signal(Signal::SIGINT, SigHandler::Handler(on_shutdown_signal))?;
		signal(Signal::SIGTERM, SigHandler::Handler(on_shutdown_signal))?;
		signal(Signal::SIGHUP, SigHandler::Handler(on_stats_signal))?;
		signal(Signal::SIGUSR1, SigHandler::Handler(on_null_signal))?;
	}
	Ok(())
}

fn dump_stats(ingress: &Arc<Ingress>, splice: &Arc<Splice>) {
	let ingress = serde_json::to_string(&ingress.stats());
	let splice = serde_json::to_string(&splice.stats());
	match (ingress, splice) {
		(Ok(ingress), Ok(splice)) => info!(%ingress, %splice, "stats"),
		(ingress, splice) => warn!(?ingress, ?splice, "failed to encode stats"),
	}
}
