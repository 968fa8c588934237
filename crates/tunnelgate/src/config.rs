use serde::{Deserialize, Serialize};

/// Runtime configuration for the proxy data plane.
///
/// The CLI only exposes the listen port and log level; everything else keeps
/// its default and exists so tests can shrink the pools.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// Listen port. 0 binds an ephemeral port.
	#[serde(default = "default_port")]
	pub port: u16,

	/// Worker threads per ingress concern (read, write, connect).
	#[serde(default = "default_ingress_workers")]
	pub ingress_workers: usize,

	/// Worker threads for name resolution. Kept separate so DNS latency
	/// never stalls a data-plane worker.
	#[serde(default = "default_dns_workers")]
	pub dns_workers: usize,

	/// Worker threads for the splice stage.
	#[serde(default = "default_splice_workers")]
	pub splice_workers: usize,

	/// Seconds a shut-down socket sits in quarantine before its fd is freed.
	#[serde(default = "default_close_grace_secs")]
	pub close_grace_secs: u64,
}

fn default_port() -> u16 {
	8080
}

fn default_ingress_workers() -> usize {
	100
}

fn default_dns_workers() -> usize {
	100
}

fn default_splice_workers() -> usize {
	50
}

fn default_close_grace_secs() -> u64 {
	5
}

impl Default for Config {
	fn default() -> Self {
		Self {
			port: default_port(),
			ingress_workers: default_ingress_workers(),
			dns_workers: default_dns_workers(),
			splice_workers: default_splice_workers(),
			close_grace_secs: default_close_grace_secs(),
		}
	}
}

impl Config {
	/// Small pools for tests; behavior is identical, the threads are fewer.
	pub fn for_tests(port: u16) -> Config {
		Config {
			port,
			ingress_workers: 2,
			dns_workers: 2,
			splice_workers: 2,
			close_grace_secs: 1,
		}
	}
}
