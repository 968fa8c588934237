use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use gate_core::pool::WorkerPool;
use gate_core::readiness::{Event, ReadinessSet};
use gate_core::scheduler::Scheduler;
use gate_core::signal::Shutdown;
use gate_core::stripe::StripeLock;
use prometheus_client::registry::Registry;
use tracing::{debug, trace};

use crate::Config;
use crate::metrics::{SpliceMetrics, SpliceStats};
use crate::proxy::reaper::CloseQueue;
use crate::transport::{Connection, IoStatus};

/// Per-syscall read/write buffer.
pub const BUFFER_SIZE: usize = 128 * 1024;

/// Buffered bytes toward one side before its reader is backpressured.
pub const MAX_OVERFLOW: usize = 1024 * 1024;

/// One side of a tunnel and the traffic pending toward it.
struct Peer {
	conn: Arc<Connection>,
	/// Bytes waiting to be written to this peer. Non-empty only while the
	/// peer is armed for write readiness or a final write-shutdown is
	/// pending.
	overflow: Mutex<VecDeque<u8>>,
	/// EPOLLOUT armed on this peer; reads toward it append to the overflow
	/// instead of writing directly.
	write_armed: AtomicBool,
	/// This peer's read interest was dropped because the opposite overflow
	/// hit the cap.
	read_blocked: AtomicBool,
	/// This peer half-closed its write side (we observed RDHUP).
	rd_hup: AtomicBool,
}

impl Peer {
	fn new(conn: Arc<Connection>) -> Peer {
		Peer {
			conn,
			overflow: Mutex::new(VecDeque::new()),
			write_armed: AtomicBool::new(false),
			read_blocked: AtomicBool::new(false),
			rd_hup: AtomicBool::new(false),
		}
	}
}

/// Shared state of one spliced pair. All field mutations happen while the
/// stripe lock is held; the lock is released around syscalls and `closed`
/// is re-checked after each re-acquire.
struct Tunnel {
	src: Peer,
	sink: Peer,
	host: String,
	port: u16,
	write_shutdown_count: AtomicU8,
	closed: AtomicBool,
	lock: StripeLock,
}

impl Tunnel {
	fn new(src: Arc<Connection>, sink: Arc<Connection>, host: String, port: u16) -> Tunnel {
		Tunnel {
			src: Peer::new(src),
			sink: Peer::new(sink),
			host,
			port,
			write_shutdown_count: AtomicU8::new(0),
			closed: AtomicBool::new(false),
			lock: StripeLock::new(),
		}
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// (peer owning `fd`, the opposite peer)
	fn peers(&self, fd: RawFd) -> Option<(&Peer, &Peer)> {
		if fd == self.src.conn.fd() {
			Some((&self.src, &self.sink))
		} else if fd == self.sink.conn.fd() {
			Some((&self.sink, &self.src))
		} else {
			None
		}
	}
}

/// Stage B: the bidirectional byte pump.
pub struct Splice {
	tunnels: Mutex<HashMap<RawFd, Arc<Tunnel>>>,
	read_set: ReadinessSet,
	write_set: ReadinessSet,
	pool: WorkerPool,
	quarantine: Arc<CloseQueue>,
	metrics: SpliceMetrics,
	shutdown: Shutdown,
	pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl Splice {
	pub fn new(cfg: &Config, shutdown: Shutdown, registry: &mut Registry) -> Arc<Splice> {
		Arc::new(Splice {
			tunnels: Mutex::new(HashMap::new()),
			read_set: ReadinessSet::new("splice-read"),
			write_set: ReadinessSet::new("splice-write"),
			pool: WorkerPool::new("splice", cfg.splice_workers),
			quarantine: CloseQueue::new("splice", Duration::from_secs(cfg.close_grace_secs)),
			metrics: SpliceMetrics::new(registry),
			shutdown,
			pollers: Mutex::new(Vec::new()),
		})
	}

	pub fn start(self: Arc<Self>, scheduler: &Arc<Scheduler>) {
		self.quarantine.clone().install(scheduler, &self.shutdown);
		let this = self.clone();
		let read = std::thread::Builder::new()
			.name("splice-read".to_string())
			.spawn(move || this.read_loop())
			.expect("failed to spawn splice read poller");
		let this = self.clone();
		let write = std::thread::Builder::new()
			.name("splice-write".to_string())
			.spawn(move || this.write_loop())
			.expect("failed to spawn splice write poller");
		self.pollers.lock().unwrap().extend([read, write]);
	}

	/// Wait for the pollers and drain the worker pool. Call after shutdown
	/// has been triggered.
	pub fn join(&self) {
		let pollers = std::mem::take(&mut *self.pollers.lock().unwrap());
		for poller in pollers {
			let _ = poller.join();
		}
		self.pool.shutdown();
	}

	/// Intake from ingress: take ownership of a connected pair. Any
	/// preserved request bytes are queued toward the origin before traffic
	/// starts flowing.
	pub fn add(
		&self,
		src: Arc<Connection>,
		sink: Arc<Connection>,
		header: Vec<u8>,
		host: String,
		port: u16,
	) {
		let state = Arc::new(Tunnel::new(src, sink, host, port));
		self.metrics.tunnels.inc();
		self.metrics.open_tunnels.inc();
		debug!(
			src = state.src.conn.fd(),
			sink = state.sink.conn.fd(),
			host = %state.host,
			port = state.port,
			"splicing pair"
		);

		let has_header = !header.is_empty();
		if has_header {
			trace!(bytes = header.len(), "seeding preserved request bytes");
			state.sink.overflow.lock().unwrap().extend(header);
			state.sink.write_armed.store(true, Ordering::SeqCst);
		}

		{
			let mut tunnels = self.tunnels.lock().unwrap();
			tunnels.insert(state.src.conn.fd(), state.clone());
			tunnels.insert(state.sink.conn.fd(), state.clone());
		}

		// Hold the stripe while arming so no handler observes a
		// half-registered pair.
		let _guard = state.lock.lock();
		self.write_set.add_write(&*state.sink.conn, has_header);
		self.read_set.add_read(&*state.sink.conn, true);
		self.read_set.add_read(&*state.src.conn, true);
		self.write_set.add_write(&*state.src.conn, false);
	}

	pub fn stats(&self) -> SpliceStats {
		SpliceStats {
			tunnel_entries: self.tunnels.lock().unwrap().len(),
			quarantined: self.quarantine.len(),
		}
	}

	fn read_loop(self: Arc<Self>) {
		let mut events = Vec::new();
		while !self.shutdown.in_progress() {
			self.read_set.wait(&mut events);
			for ev in &events {
				let this = self.clone();
				let ev = *ev;
				self.pool.execute(move || this.notify_read(ev));
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
				self.pool.execute(move || this.notify_write(ev));
			}
		}
	}

	fn lookup(&self, fd: RawFd) -> Option<Arc<Tunnel>> {
		self.tunnels.lock().unwrap().get(&fd).cloned()
	}

	fn notify_read(&self, ev: Event) {
		let Some(state) = self.lookup(ev.fd) else {
			trace!(fd = ev.fd, "late read event");
			return;
		};
		if ev.err() {
			debug!(fd = ev.fd, host = %state.host, "error event on read set");
			self.close_on_hup(&state);
			return;
		}
		if ev.hup() && !ev.readable() && !ev.rd_hup() {
			self.close_on_hup(&state);
			return;
		}
		self.handle_read(ev, &state);
	}

	fn notify_write(&self, ev: Event) {
		let Some(state) = self.lookup(ev.fd) else {
			trace!(fd = ev.fd, "late write event");
			return;
		};
		if ev.hup() || ev.err() {
			debug!(fd = ev.fd, host = %state.host, "hangup event on write set");
			self.close_on_hup(&state);
			return;
		}
		self.handle_write(ev, &state);
	}

	fn handle_read(&self, ev: Event, state: &Arc<Tunnel>) {
		let mut guard = state.lock.lock();
		if state.is_closed() {
			return;
		}
		let Some((reader, writer)) = state.peers(ev.fd) else {
			return;
		};

		reader.read_blocked.store(false, Ordering::SeqCst);

		let mut buf = vec![0u8; BUFFER_SIZE];
		let mut tail = IoStatus::WouldBlock;

		if ev.readable() {
			loop {
				drop(guard);
				let status = reader.conn.read(&mut buf);
				guard = state.lock.lock();
				if state.is_closed() {
					return;
				}

				let n = match status {
					IoStatus::Done(n) if n > 0 => n,
					other => {
						tail = other;
						break;
					},
				};

				if !writer.write_armed.load(Ordering::SeqCst) {
					// No backlog toward the writer; write directly.
					debug_assert!(writer.overflow.lock().unwrap().is_empty());
					drop(guard);
					let wstatus = writer.conn.write(&buf[..n]);
					guard = state.lock.lock();
					if state.is_closed() {
						return;
					}
					let written = match wstatus {
						IoStatus::Done(w) => w,
						IoStatus::WouldBlock => 0,
						IoStatus::Closed | IoStatus::Error(_) => {
							debug!(fd = writer.conn.fd(), host = %state.host, "write side gone; closing pair");
							self.close_under(state, guard);
							return;
						},
					};
					if written < n {
						self.metrics.overflows.inc();
						let overflow_len = {
							let mut overflow = writer.overflow.lock().unwrap();
							overflow.extend(&buf[written..n]);
							overflow.len()
						};
						writer.write_armed.store(true, Ordering::SeqCst);
						self.write_set.rearm_write(&*writer.conn, true);
						if overflow_len >= MAX_OVERFLOW {
							// Backpressure: stop reading until the writer drains.
							reader.read_blocked.store(true, Ordering::SeqCst);
							self.read_set.rearm_read(&*reader.conn, false);
							return;
						}
					}
				} else {
					self.metrics.overflows.inc();
					let overflow_len = {
						let mut overflow = writer.overflow.lock().unwrap();
						overflow.extend(&buf[..n]);
						overflow.len()
					};
					if overflow_len >= MAX_OVERFLOW {
						reader.read_blocked.store(true, Ordering::SeqCst);
						self.read_set.rearm_read(&*reader.conn, false);
						return;
					}
				}
			}
		}

		if ev.rd_hup() {
			self.note_rd_close(state, reader, writer, guard);
			return;
		}

		if ev.readable() {
			match tail {
				// EOF without an RDHUP flag re-fires once re-armed; a
				// would-block simply re-arms.
				IoStatus::Done(_) | IoStatus::WouldBlock => {
					self.read_set.rearm_read(&*reader.conn, true);
				},
				IoStatus::Closed | IoStatus::Error(_) => {
					debug!(fd = ev.fd, host = %state.host, "read failed; closing pair");
					self.close_under(state, guard);
				},
			}
		}
	}

	fn handle_write(&self, ev: Event, state: &Arc<Tunnel>) {
		let mut guard = state.lock.lock();
		if state.is_closed() {
			return;
		}
		let Some((writer, reader)) = state.peers(ev.fd) else {
			return;
		};

		writer.write_armed.store(true, Ordering::SeqCst);

		if writer.overflow.lock().unwrap().is_empty() {
			if reader.rd_hup.load(Ordering::SeqCst) {
				writer.conn.shutdown_write();
			}
			writer.write_armed.store(false, Ordering::SeqCst);
			self.write_set.rearm_write(&*writer.conn, false);
			return;
		}

		let mut buf = vec![0u8; BUFFER_SIZE];
		loop {
			let chunk_len = {
				let overflow = writer.overflow.lock().unwrap();
				let len = overflow.len().min(BUFFER_SIZE);
				let (front, back) = overflow.as_slices();
				let from_front = front.len().min(len);
				buf[..from_front].copy_from_slice(&front[..from_front]);
				if from_front < len {
					buf[from_front..len].copy_from_slice(&back[..len - from_front]);
				}
				len
			};
			if chunk_len == 0 {
				if reader.rd_hup.load(Ordering::SeqCst) {
					// Drained after the peer's half-close: finish the
					// deferred write-shutdown. The arm stays in place so the
					// resulting hangup closes the pair.
					writer.conn.shutdown_write();
				} else {
					writer.write_armed.store(false, Ordering::SeqCst);
					self.write_set.rearm_write(&*writer.conn, false);
				}
				return;
			}

			drop(guard);
			let status = writer.conn.write(&buf[..chunk_len]);
			guard = state.lock.lock();
			if state.is_closed() {
				return;
			}

			match status {
				IoStatus::Done(written) => {
					let below_cap = {
						let mut overflow = writer.overflow.lock().unwrap();
						overflow.drain(..written);
						overflow.len() < MAX_OVERFLOW
					};
					if below_cap && reader.read_blocked.load(Ordering::SeqCst) {
						reader.read_blocked.store(false, Ordering::SeqCst);
						self.read_set.rearm_read(&*reader.conn, true);
					}
					if written < chunk_len {
						self.write_set.rearm_write(&*writer.conn, true);
						return;
					}
				},
				IoStatus::WouldBlock => {
					self.write_set.rearm_write(&*writer.conn, true);
					return;
				},
				IoStatus::Closed | IoStatus::Error(_) => {
					debug!(fd = ev.fd, host = %state.host, "write failed; closing pair");
					self.close_under(state, guard);
					return;
				},
			}
		}
	}

	/// Latch a peer's read-close, schedule or perform the writer's
	/// write-shutdown, and account toward the pair's close.
	fn note_rd_close(
		&self,
		state: &Arc<Tunnel>,
		reader: &Peer,
		writer: &Peer,
		guard: MutexGuard<'static, ()>,
	) {
		if reader.rd_hup.swap(true, Ordering::SeqCst) {
			// Already latched; the shutdown count must not advance twice.
			return;
		}
		debug!(fd = reader.conn.fd(), host = %state.host, "peer read-closed");
		if writer.overflow.lock().unwrap().is_empty() {
			writer.conn.shutdown_write();
		} else if !writer.write_armed.load(Ordering::SeqCst) {
			// Defer the shutdown until the backlog drains.
			writer.write_armed.store(true, Ordering::SeqCst);
			self.write_set.rearm_write(&*writer.conn, true);
		}
		let count = state.write_shutdown_count.fetch_add(1, Ordering::SeqCst) + 1;
		if count >= 2 {
			self.close_under(state, guard);
		}
	}

	fn close_on_hup(&self, state: &Arc<Tunnel>) {
		let guard = state.lock.lock();
		self.close_under(state, guard);
	}

	/// Transition to closed (write-once) and tear the pair down. Must be
	/// called with the stripe held; the guard is released before the
	/// teardown syscalls.
	fn close_under(&self, state: &Arc<Tunnel>, guard: MutexGuard<'static, ()>) {
		if state.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		drop(guard);
		self.close_pair(state);
	}

	fn close_pair(&self, state: &Arc<Tunnel>) {
		debug!(
			src = state.src.conn.fd(),
			sink = state.sink.conn.fd(),
			host = %state.host,
			"closing tunnel pair"
		);
		{
			let mut tunnels = self.tunnels.lock().unwrap();
			tunnels.remove(&state.src.conn.fd());
			tunnels.remove(&state.sink.conn.fd());
		}
		self.read_set.delete(&*state.src.conn);
		self.read_set.delete(&*state.sink.conn);
		self.write_set.delete(&*state.src.conn);
		self.write_set.delete(&*state.sink.conn);

		state.src.conn.shutdown_write();
		state.sink.conn.shutdown_write();
		state.src.conn.shutdown_read();
		state.sink.conn.shutdown_read();

		self.quarantine.push(state.src.conn.clone());
		self.quarantine.push(state.sink.conn.clone());
		self.metrics.closes.inc_by(2);
		self.metrics.open_tunnels.dec();
	}
}

#[cfg(test)]
mod tests {
	use std::io::{self, Read, Write};
	use std::net::{TcpListener, TcpStream};

	use socket2::{Domain, Protocol, SockRef, Socket, Type};

	use super::*;

	fn conn_pair() -> (Arc<Connection>, TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let (server, _) = listener.accept().unwrap();
		(Arc::new(Connection::from_accepted(server).unwrap()), client)
	}

	/// Like `conn_pair`, but with tiny socket buffers on both ends so the
	/// kernel can absorb far less than `MAX_OVERFLOW` in flight.
	fn throttled_pair() -> (Arc<Connection>, TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let peer = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
		peer.set_recv_buffer_size(16 * 1024).unwrap();
		peer.connect(&listener.local_addr().unwrap().into()).unwrap();
		let peer: TcpStream = peer.into();
		let (server, _) = listener.accept().unwrap();
		SockRef::from(&server).set_send_buffer_size(16 * 1024).unwrap();
		(Arc::new(Connection::from_accepted(server).unwrap()), peer)
	}

	#[test]
	fn peers_resolve_both_directions() {
		let (src, _a) = conn_pair();
		let (sink, _b) = conn_pair();
		let tunnel = Tunnel::new(src.clone(), sink.clone(), "h".to_string(), 80);
		let (reader, writer) = tunnel.peers(src.fd()).unwrap();
		assert_eq!(reader.conn.fd(), src.fd());
		assert_eq!(writer.conn.fd(), sink.fd());
		let (reader, writer) = tunnel.peers(sink.fd()).unwrap();
		assert_eq!(reader.conn.fd(), sink.fd());
		assert_eq!(writer.conn.fd(), src.fd());
		assert!(tunnel.peers(-1).is_none());
	}

	#[test]
	fn intake_seeds_origin_overflow_and_maps_both_fds() {
		gate_core::telemetry::testing::setup_test_logging();
		let cfg = Config::for_tests(0);
		let shutdown = Shutdown::new();
		let mut registry = Registry::default();
		let splice = Splice::new(&cfg, shutdown.clone(), &mut registry);

		let (src, _a) = conn_pair();
		let (sink, _b) = conn_pair();
		let (src_fd, sink_fd) = (src.fd(), sink.fd());
		splice.add(src, sink, b"GET / HTTP/1.0\r\n\r\n".to_vec(), "h".to_string(), 80);

		let tunnels = splice.tunnels.lock().unwrap();
		let a = tunnels.get(&src_fd).unwrap();
		let b = tunnels.get(&sink_fd).unwrap();
		assert!(Arc::ptr_eq(a, b));
		assert_eq!(a.sink.overflow.lock().unwrap().len(), 18);
		assert!(a.sink.write_armed.load(Ordering::SeqCst));
		assert!(!a.src.write_armed.load(Ordering::SeqCst));
	}

	/// A consumer that never drains forces the overflow toward it to the
	/// cap, at which point the reader must be deregistered; draining the
	/// consumer must re-arm it. Events are pumped by hand so every
	/// transition is observed deterministically.
	#[test]
	fn backpressure_engages_at_the_cap_and_releases_on_drain() {
		gate_core::telemetry::testing::setup_test_logging();
		let cfg = Config::for_tests(0);
		let shutdown = Shutdown::new();
		let mut registry = Registry::default();
		let splice = Splice::new(&cfg, shutdown, &mut registry);

		let (src, client) = conn_pair();
		let (sink, mut origin) = throttled_pair();
		let src_fd = src.fd();
		let sink_fd = sink.fd();
		splice.add(src, sink, Vec::new(), "h".to_string(), 80);
		let state = splice.lookup(src_fd).unwrap();

		client.set_nonblocking(true).unwrap();
		origin
			.set_read_timeout(Some(Duration::from_secs(5)))
			.unwrap();

		// Pump client bytes in while the origin reads nothing. The direct
		// write stalls almost immediately (tiny buffers), so the overflow
		// grows until the cap deregisters the reader.
		let chunk = vec![0xa5u8; 64 * 1024];
		let mut events = Vec::new();
		for _ in 0..64 {
			if state.src.read_blocked.load(Ordering::SeqCst) {
				break;
			}
			loop {
				match (&client).write(&chunk) {
					Ok(_) => {},
					Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
					Err(e) => panic!("client write failed: {e}"),
				}
			}
			splice.read_set.wait(&mut events);
			for ev in events.iter().copied() {
				if ev.fd == src_fd {
					splice.notify_read(ev);
				}
			}
		}

		assert!(
			state.src.read_blocked.load(Ordering::SeqCst),
			"reader was never backpressured"
		);
		let overflow_len = state.sink.overflow.lock().unwrap().len();
		assert!(overflow_len >= MAX_OVERFLOW, "cap not reached: {overflow_len}");
		// One in-flight buffer past the cap at most.
		assert!(overflow_len < MAX_OVERFLOW + BUFFER_SIZE);
		// Overflow non-empty means the writer stays armed for write readiness.
		assert!(state.sink.write_armed.load(Ordering::SeqCst));

		// The deregistered reader stays silent even with client data pending.
		let _ = (&client).write(&chunk);
		splice.read_set.wait(&mut events);
		assert!(
			!events.iter().any(|ev| ev.fd == src_fd),
			"backpressured reader still produced events"
		);

		// Drain the origin. Once the overflow falls back under the cap the
		// reader must be released.
		let mut drained = vec![0u8; 64 * 1024];
		for _ in 0..256 {
			if !state.src.read_blocked.load(Ordering::SeqCst) {
				break;
			}
			match origin.read(&mut drained) {
				Ok(n) => assert!(n > 0, "origin saw EOF during drain"),
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
				Err(e) => panic!("origin read failed: {e}"),
			}
			splice.write_set.wait(&mut events);
			for ev in events.iter().copied() {
				if ev.fd == sink_fd {
					splice.notify_write(ev);
				}
			}
		}

		assert!(
			!state.src.read_blocked.load(Ordering::SeqCst),
			"reader was never released"
		);
		assert!(state.sink.overflow.lock().unwrap().len() < MAX_OVERFLOW);

		// The release re-armed the read interest: the client bytes still
		// parked in the socket fire a fresh read event.
		splice.read_set.wait(&mut events);
		assert!(
			events.iter().any(|ev| ev.fd == src_fd && ev.readable()),
			"released reader was not re-armed"
		);
	}
}
