use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;

/// Counters for the ingress stage. Registered once at construction; the
/// admin surface that scrapes the registry lives outside this crate.
#[derive(Clone, Debug)]
pub struct IngressMetrics {
	pub accepts: Counter,
	pub accept_failures: Counter,
	pub connects: Counter,
	pub connect_failures: Counter,
	pub resolve_failures: Counter,
	pub rejected_requests: Counter,
}

impl IngressMetrics {
	pub fn new(registry: &mut Registry) -> IngressMetrics {
		let registry = registry.sub_registry_with_prefix("ingress");
		let metrics = IngressMetrics {
			accepts: Counter::default(),
			accept_failures: Counter::default(),
			connects: Counter::default(),
			connect_failures: Counter::default(),
			resolve_failures: Counter::default(),
			rejected_requests: Counter::default(),
		};
		registry.register(
			"accepts",
			"Client connections accepted",
			metrics.accepts.clone(),
		);
		registry.register(
			"accept_failures",
			"Accept syscall failures other than would-block",
			metrics.accept_failures.clone(),
		);
		registry.register(
			"connects",
			"Outbound connections established",
			metrics.connects.clone(),
		);
		registry.register(
			"connect_failures",
			"Outbound connections that failed",
			metrics.connect_failures.clone(),
		);
		registry.register(
			"resolve_failures",
			"Name resolutions that failed",
			metrics.resolve_failures.clone(),
		);
		registry.register(
			"rejected_requests",
			"Requests terminated before handoff (protocol or policy)",
			metrics.rejected_requests.clone(),
		);
		metrics
	}
}

/// Counters for the splice stage.
#[derive(Clone, Debug)]
pub struct SpliceMetrics {
	pub tunnels: Counter,
	pub closes: Counter,
	pub overflows: Counter,
	pub open_tunnels: Gauge,
}

impl SpliceMetrics {
	pub fn new(registry: &mut Registry) -> SpliceMetrics {
		let registry = registry.sub_registry_with_prefix("splice");
		let metrics = SpliceMetrics {
			tunnels: Counter::default(),
			closes: Counter::default(),
			overflows: Counter::default(),
			open_tunnels: Gauge::default(),
		};
		registry.register("tunnels", "Tunnel pairs spliced", metrics.tunnels.clone());
		registry.register(
			"closes",
			"Connections enqueued for close",
			metrics.closes.clone(),
		);
		registry.register(
			"overflows",
			"Reads that spilled into an overflow buffer",
			metrics.overflows.clone(),
		);
		registry.register(
			"open_tunnels",
			"Currently open tunnel pairs",
			metrics.open_tunnels.clone(),
		);
		metrics
	}
}

/// Point-in-time view of the ingress state maps, mirroring what the stats
/// endpoint reports.
#[derive(Clone, Debug, Serialize)]
pub struct IngressStats {
	pub read_states: usize,
	pub write_states: usize,
	pub connect_states: usize,
	pub quarantined: usize,
}

/// Point-in-time view of the splice state.
#[derive(Clone, Debug, Serialize)]
pub struct SpliceStats {
	/// Map entries, two per open tunnel.
	pub tunnel_entries: usize,
	pub quarantined: usize,
}
