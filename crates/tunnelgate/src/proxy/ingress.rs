use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gate_core::pool::WorkerPool;
use gate_core::readiness::{Event, ReadinessSet};
use gate_core::scheduler::Scheduler;
use gate_core::signal::Shutdown;
use prometheus_client::registry::Registry;
use tracing::{debug, trace, warn};

use crate::Config;
use crate::metrics::{IngressMetrics, IngressStats};
use crate::proxy::parse::{self, ParsedRequest, RequestError, RequestKind};
use crate::proxy::reaper::CloseQueue;
use crate::proxy::splice::Splice;
use crate::transport::{AcceptStatus, ConnectProgress, Connection, IoStatus, Listener, Resolver};

/// Maximum bytes of request-line plus headers.
pub const MAX_HEADER: usize = 10 * 1024;

/// Header bytes accumulated so far for one accepted socket.
struct ReadState {
	conn: Arc<Connection>,
	buffer: Vec<u8>,
	started: Instant,
}

/// A handshake or failure response being drained to the client. For the
/// CONNECT 200 the pending connect follows once the write completes.
struct WriteState {
	conn: Arc<Connection>,
	response: &'static [u8],
	written: usize,
	next: Option<PendingConnect>,
}

struct PendingConnect {
	addr: SocketAddr,
	header: Vec<u8>,
	host: String,
	port: u16,
}

/// An outbound connect awaiting completion (EINPROGRESS).
struct ConnectState {
	accepted: Arc<Connection>,
	outbound: Arc<Connection>,
	addr: SocketAddr,
	header: Vec<u8>,
	host: String,
	port: u16,
}

#[derive(Default)]
struct IngressStates {
	read: HashMap<RawFd, ReadState>,
	write: HashMap<RawFd, WriteState>,
	connect: HashMap<RawFd, ConnectState>,
}

/// Stage A: accept, read and parse the request header, resolve, answer the
/// handshake, open the outbound connection, and hand the pair to Splice.
pub struct Ingress {
	listener: Listener,
	resolver: Resolver,
	next: Arc<Splice>,

	accept_set: ReadinessSet,
	read_set: ReadinessSet,
	write_set: ReadinessSet,
	connect_set: ReadinessSet,

	dns_pool: WorkerPool,
	read_pool: WorkerPool,
	write_pool: WorkerPool,
	connect_pool: WorkerPool,

	states: Mutex<IngressStates>,
	quarantine: Arc<CloseQueue>,
	metrics: IngressMetrics,
	shutdown: Shutdown,
	pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl Ingress {
	pub fn new(
		cfg: &Config,
		shutdown: Shutdown,
		next: Arc<Splice>,
		registry: &mut Registry,
	) -> io::Result<Arc<Ingress>> {
		let listener = Listener::bind(cfg.port)?;
		let resolver = Resolver::new(listener.local_port()).map_err(io::Error::other)?;
		let ingress = Arc::new(Ingress {
			listener,
			resolver,
			next,
			accept_set: ReadinessSet::new("ingress-accept"),
			read_set: ReadinessSet::new("ingress-read"),
			write_set: ReadinessSet::new("ingress-write"),
			connect_set: ReadinessSet::new("ingress-connect"),
			dns_pool: WorkerPool::new("ingress-dns", cfg.dns_workers),
			read_pool: WorkerPool::new("ingress-rd", cfg.ingress_workers),
			write_pool: WorkerPool::new("ingress-wr", cfg.ingress_workers),
			connect_pool: WorkerPool::new("ingress-co", cfg.ingress_workers),
			states: Mutex::new(IngressStates::default()),
			quarantine: CloseQueue::new("ingress", Duration::from_secs(cfg.close_grace_secs)),
			metrics: IngressMetrics::new(registry),
			shutdown,
			pollers: Mutex::new(Vec::new()),
		});
		ingress.accept_set.add_read(&ingress.listener, true);
		debug!(port = ingress.local_port(), "ingress listening");
		Ok(ingress)
	}

	pub fn local_port(&self) -> u16 {
		self.listener.local_port()
	}

	pub fn start(self: Arc<Self>, scheduler: &Arc<Scheduler>) {
		self.quarantine.clone().install(scheduler, &self.shutdown);
		let loops: [(&str, fn(Arc<Self>)); 4] = [
			("ingress-accept", Self::accept_loop),
			("ingress-read", Self::read_loop),
			("ingress-write", Self::write_loop),
			("ingress-connect", Self::connect_loop),
		];
		let mut handles = Vec::new();
		for (name, f) in loops {
			let this = self.clone();
			handles.push(
				std::thread::Builder::new()
					.name(name.to_string())
					.spawn(move || f(this))
					.expect("failed to spawn ingress poller"),
			);
		}
		self.pollers.lock().unwrap().extend(handles);
	}

	/// Wait for the pollers and drain the worker pools. Call after shutdown
	/// has been triggered.
	pub fn join(&self) {
		let pollers = std::mem::take(&mut *self.pollers.lock().unwrap());
		for poller in pollers {
			let _ = poller.join();
		}
		self.dns_pool.shutdown();
		self.read_pool.shutdown();
		self.write_pool.shutdown();
		self.connect_pool.shutdown();
	}

	pub fn stats(&self) -> IngressStats {
		let states = self.states.lock().unwrap();
		IngressStats {
			read_states: states.read.len(),
			write_states: states.write.len(),
			connect_states: states.connect.len(),
			quarantined: self.quarantine.len(),
		}
	}

	/// Shut both halves down and quarantine the socket.
	fn discard(&self, conn: &Arc<Connection>) {
		conn.shutdown_write();
		conn.shutdown_read();
		self.quarantine.push(conn.clone());
	}

	fn accept_loop(self: Arc<Self>) {
		let mut events = Vec::new();
		while !self.shutdown.in_progress() {
			self.accept_set.wait(&mut events);
			if events.is_empty() {
				continue;
			}
			loop {
				match self.listener.accept() {
					AcceptStatus::Accepted(stream, peer) => {
						self.metrics.accepts.inc();
						trace!(%peer, "accepted");
						self.clone().handle_accept(stream);
					},
					AcceptStatus::WouldBlock => break,
					AcceptStatus::Error(e) => {
						self.metrics.accept_failures.inc();
						warn!(err = %e, "accept failed");
						break;
					},
				}
			}
			self.accept_set.rearm_read(&self.listener, true);
		}
	}

	fn read_loop(self: Arc<Self>) {
		let mut events = Vec::new();
		while !self.shutdown.in_progress() {
			self.read_set.wait(&mut events);
			for ev in &events {
				let this = self.clone();
				let ev = *ev;
				self.read_pool.execute(move || this.notify_read(ev));
			}
		}
	}

	fn write_loop(self: Arc<Self>) {
		let mut events = Vec::new();
		while !self.shutdown.in_progress() {
			self.write_set.wait(&mut events);
			for ev in &events {
				let this = self.clone();
				let ev = *ev;
				self.write_pool.execute(move || this.notify_write(ev));
			}
		}
	}

	fn connect_loop(self: Arc<Self>) {
		let mut events = Vec::new();
		while !self.shutdown.in_progress() {
			self.connect_set.wait(&mut events);
			for ev in &events {
				let this = self.clone();
				let ev = *ev;
				self.connect_pool.execute(move || this.notify_connect(ev));
			}
		}
	}

	fn handle_accept(self: Arc<Self>, stream: TcpStream) {
		let conn = match Connection::from_accepted(stream) {
			Ok(conn) => Arc::new(conn),
			Err(e) => {
				warn!(err = %e, "failed to prepare accepted socket");
				return;
			},
		};
		self.try_read_header(conn);
	}

	/// First read attempt, inline on the accept thread. The common case is
	/// a complete header in one read.
	fn try_read_header(self: Arc<Self>, conn: Arc<Connection>) {
		let mut buf = vec![0u8; MAX_HEADER];
		match conn.read(&mut buf) {
			IoStatus::Done(0) => self.discard(&conn),
			IoStatus::Done(n) => {
				buf.truncate(n);
				self.continue_header(conn, buf, false);
			},
			IoStatus::WouldBlock => {
				self.park_read_state(conn, Vec::new(), false);
			},
			IoStatus::Closed => self.discard(&conn),
			IoStatus::Error(e) => {
				warn!(fd = conn.fd(), err = %e, "error reading header");
				self.discard(&conn);
			},
		}
	}

	fn notify_read(self: Arc<Self>, ev: Event) {
		let state = self.states.lock().unwrap().read.remove(&ev.fd);
		let Some(state) = state else {
			trace!(fd = ev.fd, "late read event");
			return;
		};
		if ev.rd_hup() || ev.hup() || ev.err() {
			debug!(
				fd = ev.fd,
				age_ms = state.started.elapsed().as_millis(),
				"client went away during header read"
			);
			self.read_set.delete(&*state.conn);
			self.discard(&state.conn);
			return;
		}
		self.retry_read_header(state);
	}

	fn retry_read_header(self: Arc<Self>, state: ReadState) {
		let ReadState {
			conn, mut buffer, ..
		} = state;
		let mut chunk = vec![0u8; MAX_HEADER - buffer.len()];
		match conn.read(&mut chunk) {
			IoStatus::Done(0) | IoStatus::Closed => {
				self.read_set.delete(&*conn);
				self.discard(&conn);
			},
			IoStatus::Done(n) => {
				buffer.extend_from_slice(&chunk[..n]);
				self.continue_header(conn, buffer, true);
			},
			IoStatus::WouldBlock => {
				// Spurious wake; keep waiting.
				self.park_read_state(conn, buffer, true);
			},
			IoStatus::Error(e) => {
				warn!(fd = conn.fd(), err = %e, "error reading header");
				self.read_set.delete(&*conn);
				self.discard(&conn);
			},
		}
	}

	/// Decide what to do with the header bytes gathered so far.
	fn continue_header(self: Arc<Self>, conn: Arc<Connection>, buffer: Vec<u8>, registered: bool) {
		if let Some(end) = parse::find_header_end(&buffer) {
			if registered {
				self.read_set.delete(&*conn);
			}
			self.process_header(conn, buffer, end);
		} else if buffer.len() >= MAX_HEADER {
			if registered {
				self.read_set.delete(&*conn);
			}
			warn!(fd = conn.fd(), "request header exceeded maximum size");
			self.metrics.rejected_requests.inc();
			self.discard(&conn);
		} else {
			self.park_read_state(conn, buffer, registered);
		}
	}

	fn park_read_state(&self, conn: Arc<Connection>, buffer: Vec<u8>, registered: bool) {
		let fd = conn.fd();
		// The state must be findable before the fd can fire.
		self.states.lock().unwrap().read.insert(
			fd,
			ReadState {
				conn: conn.clone(),
				buffer,
				started: Instant::now(),
			},
		);
		if registered {
			self.read_set.rearm_read(&*conn, true);
		} else {
			self.read_set.add_read(&*conn, true);
		}
	}

	fn process_header(self: Arc<Self>, conn: Arc<Connection>, buffer: Vec<u8>, end: usize) {
		match parse::classify(&buffer, end) {
			Err(RequestError::TrailingBytes) => {
				warn!(fd = conn.fd(), "unexpected data after CONNECT header");
				self.metrics.rejected_requests.inc();
				self.discard(&conn);
			},
			Err(err) => {
				warn!(fd = conn.fd(), %err, "rejecting request");
				self.metrics.rejected_requests.inc();
				self.write_response(conn, parse::bad_request_400(err.http11()), None);
			},
			Ok(parsed) => {
				debug!(host = %parsed.host, port = parsed.port, kind = ?parsed.kind, "proxy request");
				// Forwarding mode replays every byte received so far,
				// including any body that followed the header.
				let preserved = match parsed.kind {
					RequestKind::Connect => Vec::new(),
					RequestKind::Forward => buffer,
				};
				self.resolve_and_dispatch(conn, parsed, preserved);
			},
		}
	}

	/// Name resolution runs on its own pool so the event threads never
	/// block on DNS.
	fn resolve_and_dispatch(
		self: Arc<Self>,
		conn: Arc<Connection>,
		parsed: ParsedRequest,
		preserved: Vec<u8>,
	) {
		let this = self.clone();
		self.dns_pool.execute(move || {
			let addr = match this.resolver.resolve(&parsed.host, parsed.port) {
				Ok(addr) => addr,
				Err(e) => {
					this.metrics.resolve_failures.inc();
					warn!(host = %parsed.host, err = %e, "failed to resolve target");
					this.write_response(conn, parse::not_found_403(parsed.http11), None);
					return;
				},
			};
			if this.resolver.is_self_target(&addr) {
				warn!(host = %parsed.host, %addr, "refusing connect to self");
				this.metrics.rejected_requests.inc();
				this.discard(&conn);
				return;
			}
			match parsed.kind {
				RequestKind::Connect => this.write_response(
					conn,
					parse::ok_200(parsed.http11),
					Some(PendingConnect {
						addr,
						header: Vec::new(),
						host: parsed.host,
						port: parsed.port,
					}),
				),
				RequestKind::Forward => {
					this.try_connect(conn, addr, preserved, parsed.host, parsed.port)
				},
			}
		});
	}

	fn write_response(
		&self,
		conn: Arc<Connection>,
		response: &'static [u8],
		next: Option<PendingConnect>,
	) {
		match conn.write(response) {
			IoStatus::Done(n) if n == response.len() => self.finish_response(conn, next),
			IoStatus::Done(n) => self.park_write_state(conn, response, n, next, false),
			IoStatus::WouldBlock => self.park_write_state(conn, response, 0, next, false),
			IoStatus::Closed => self.discard(&conn),
			IoStatus::Error(e) => {
				warn!(fd = conn.fd(), err = %e, "error writing response");
				self.discard(&conn);
			},
		}
	}

	fn park_write_state(
		&self,
		conn: Arc<Connection>,
		response: &'static [u8],
		written: usize,
		next: Option<PendingConnect>,
		registered: bool,
	) {
		let fd = conn.fd();
		self.states.lock().unwrap().write.insert(
			fd,
			WriteState {
				conn: conn.clone(),
				response,
				written,
				next,
			},
		);
		if registered {
			self.write_set.rearm_write(&*conn, true);
		} else {
			self.write_set.add_write(&*conn, true);
		}
	}

	/// The response has fully drained: either move on to the outbound
	/// connect (CONNECT 200) or let the failure response flush and close.
	fn finish_response(&self, conn: Arc<Connection>, next: Option<PendingConnect>) {
		match next {
			Some(p) => self.try_connect(conn, p.addr, p.header, p.host, p.port),
			None => {
				conn.shutdown_write();
				self.quarantine.push(conn);
			},
		}
	}

	fn notify_write(&self, ev: Event) {
		let state = self.states.lock().unwrap().write.remove(&ev.fd);
		let Some(state) = state else {
			trace!(fd = ev.fd, "late write event");
			return;
		};
		if ev.hup() || ev.err() {
			debug!(fd = ev.fd, "client went away during response write");
			self.write_set.delete(&*state.conn);
			self.discard(&state.conn);
			return;
		}
		self.retry_write(state);
	}

	fn retry_write(&self, state: WriteState) {
		let WriteState {
			conn,
			response,
			mut written,
			next,
		} = state;
		match conn.write(&response[written..]) {
			IoStatus::Done(n) => {
				written += n;
				if written >= response.len() {
					self.write_set.delete(&*conn);
					self.finish_response(conn, next);
				} else {
					self.park_write_state(conn, response, written, next, true);
				}
			},
			IoStatus::WouldBlock => self.park_write_state(conn, response, written, next, true),
			IoStatus::Closed => {
				self.write_set.delete(&*conn);
				self.discard(&conn);
			},
			IoStatus::Error(e) => {
				warn!(fd = conn.fd(), err = %e, "error writing response");
				self.write_set.delete(&*conn);
				self.discard(&conn);
			},
		}
	}

	fn try_connect(
		&self,
		accepted: Arc<Connection>,
		addr: SocketAddr,
		header: Vec<u8>,
		host: String,
		port: u16,
	) {
		let outbound = Arc::new(Connection::for_outbound(&addr));
		debug!(fd = outbound.fd(), host = %host, %addr, "starting outbound connect");
		match outbound.connect(&addr) {
			ConnectProgress::Connected => self.finish_connect(accepted, outbound, header, host, port),
			ConnectProgress::InProgress => {
				let fd = outbound.fd();
				self.states.lock().unwrap().connect.insert(
					fd,
					ConnectState {
						accepted,
						outbound: outbound.clone(),
						addr,
						header,
						host,
						port,
					},
				);
				self.connect_set.add_write(&*outbound, true);
			},
			ConnectProgress::Failed(e) => {
				self.metrics.connect_failures.inc();
				warn!(host = %host, err = %e, "connect failed");
				self.discard(&outbound);
				self.discard(&accepted);
			},
		}
	}

	fn notify_connect(&self, ev: Event) {
		let state = self.states.lock().unwrap().connect.remove(&ev.fd);
		let Some(state) = state else {
			trace!(fd = ev.fd, "late connect event");
			return;
		};
		// Hangup and error flags are not inspected here; retrying the
		// connect surfaces the precise error.
		self.retry_connect(state);
	}

	fn retry_connect(&self, state: ConnectState) {
		let ConnectState {
			accepted,
			outbound,
			addr,
			header,
			host,
			port,
		} = state;
		match outbound.connect(&addr) {
			ConnectProgress::Connected => {
				self.connect_set.delete(&*outbound);
				self.finish_connect(accepted, outbound, header, host, port);
			},
			ConnectProgress::InProgress => {
				let fd = outbound.fd();
				self.states.lock().unwrap().connect.insert(
					fd,
					ConnectState {
						accepted,
						outbound: outbound.clone(),
						addr,
						header,
						host,
						port,
					},
				);
				self.connect_set.rearm_write(&*outbound, true);
			},
			ConnectProgress::Failed(e) => {
				self.metrics.connect_failures.inc();
				warn!(host = %host, err = %e, "connect failed");
				self.connect_set.delete(&*outbound);
				self.discard(&outbound);
				self.discard(&accepted);
			},
		}
	}

	fn finish_connect(
		&self,
		accepted: Arc<Connection>,
		outbound: Arc<Connection>,
		header: Vec<u8>,
		host: String,
		port: u16,
	) {
		self.metrics.connects.inc();
		debug!(
			accepted = accepted.fd(),
			outbound = outbound.fd(),
			host = %host,
			"outbound connected; handing off"
		);
		self.next.add(accepted, outbound, header, host, port);
	}
}
