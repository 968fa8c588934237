use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolverError {
	#[error("failed to enumerate local interfaces: {0}")]
	Interfaces(#[from] local_ip_address::Error),
	#[error("no network interfaces available")]
	NoInterfaces,
}

/// Blocking name resolution plus the local-address knowledge needed for
/// loop prevention. `resolve` runs on the dedicated DNS pool so the event
/// threads never wait on it.
pub struct Resolver {
	listen_port: u16,
	locals: Vec<IpAddr>,
	ipv4: bool,
	ipv6: bool,
}

impl Resolver {
	pub fn new(listen_port: u16) -> Result<Resolver, ResolverError> {
		let interfaces = local_ip_address::list_afinet_netifas()?;
		if interfaces.is_empty() {
			return Err(ResolverError::NoInterfaces);
		}
		let locals: Vec<IpAddr> = interfaces.into_iter().map(|(_, addr)| addr).collect();
		let ipv4 = locals.iter().any(|a| a.is_ipv4());
		let ipv6 = locals.iter().any(|a| a.is_ipv6());
		Ok(Resolver {
			listen_port,
			locals,
			ipv4,
			ipv6,
		})
	}

	/// getaddrinfo, filtered to families a local interface can actually
	/// reach. Numeric literals for either family short-circuit inside the
	/// system resolver. Failures carry the resolver's error.
	pub fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
		let addrs = (host, port).to_socket_addrs()?;
		for addr in addrs {
			match addr {
				SocketAddr::V4(_) if self.ipv4 => return Ok(addr),
				SocketAddr::V6(_) if self.ipv6 => return Ok(addr),
				other => debug!(addr = %other, "skipping unsupported address family"),
			}
		}
		Err(io::Error::new(
			io::ErrorKind::NotFound,
			format!("no usable address for {host}"),
		))
	}

	/// True when the resolved target is this proxy itself: a local
	/// interface address on the listen port. Such requests would loop.
	pub fn is_self_target(&self, addr: &SocketAddr) -> bool {
		addr.port() == self.listen_port && self.locals.contains(&addr.ip())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn numeric_v4_literal_resolves() {
		let resolver = Resolver::new(8081).unwrap();
		let addr = resolver.resolve("127.0.0.1", 443).unwrap();
		assert_eq!(addr, "127.0.0.1:443".parse().unwrap());
	}

	#[test]
	fn loopback_on_listen_port_is_self_target() {
		let resolver = Resolver::new(8081).unwrap();
		let same: SocketAddr = "127.0.0.1:8081".parse().unwrap();
		let other_port: SocketAddr = "127.0.0.1:8082".parse().unwrap();
		let other_host: SocketAddr = "192.0.2.1:8081".parse().unwrap();
		assert!(resolver.is_self_target(&same));
		assert!(!resolver.is_self_target(&other_port));
		assert!(!resolver.is_self_target(&other_host));
	}

	#[test]
	fn unresolvable_host_surfaces_resolver_error() {
		let resolver = Resolver::new(8081).unwrap();
		assert!(resolver.resolve("no.such.host.invalid", 443).is_err());
	}
}
