use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::process;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tracing::{debug, error};

const LISTEN_BACKLOG: i32 = 10_000;

/// Outcome of one non-blocking read or write syscall.
///
/// Transient errnos never surface as errors: EAGAIN and EINTR become
/// `WouldBlock` (a readiness re-arm), a read of zero bytes is `Done(0)`
/// (orderly EOF), and EPIPE on write is `Closed` since SIGPIPE is
/// suppressed process-wide.
#[derive(Debug)]
pub enum IoStatus {
	Done(usize),
	WouldBlock,
	Closed,
	Error(io::Error),
}

/// Progress of a non-blocking connect.
#[derive(Debug)]
pub enum ConnectProgress {
	Connected,
	InProgress,
	Failed(io::Error),
}

/// A non-blocking TCP socket plus its status flags.
pub struct Connection {
	stream: TcpStream,
	read_closed: AtomicBool,
	write_closed: AtomicBool,
	errored: AtomicBool,
	last_activity: Mutex<Instant>,
}

impl Connection {
	/// Wrap a freshly accepted socket.
	pub fn from_accepted(stream: TcpStream) -> io::Result<Connection> {
		stream.set_nonblocking(true)?;
		stream.set_nodelay(true)?;
		Ok(Connection::wrap(stream))
	}

	/// Create the outbound socket for `addr` without connecting it yet.
	///
	/// Failing to create a socket is a process-level catastrophe (fd
	/// exhaustion); there is no per-request recovery from it.
	pub fn for_outbound(addr: &SocketAddr) -> Connection {
		let domain = Domain::for_address(*addr);
		let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
			Ok(s) => s,
			Err(e) => {
				error!(err = %e, "socket create failed");
				process::abort()
			},
		};
		if let Err(e) = socket.set_nonblocking(true) {
			error!(err = %e, "failed to set socket non-blocking");
			process::abort()
		}
		let _ = socket.set_nodelay(true);
		Connection::wrap(socket.into())
	}

	fn wrap(stream: TcpStream) -> Connection {
		Connection {
			stream,
			read_closed: AtomicBool::new(false),
			write_closed: AtomicBool::new(false),
			errored: AtomicBool::new(false),
			last_activity: Mutex::new(Instant::now()),
		}
	}

	pub fn fd(&self) -> RawFd {
		self.stream.as_raw_fd()
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		self.stream.peer_addr().ok()
	}

	/// Drive the connect forward. The first call typically reports
	/// `InProgress`; once the socket signals writability a retry yields
	/// `Connected` (via EISCONN) or the pending error.
	pub fn connect(&self, addr: &SocketAddr) -> ConnectProgress {
		match SockRef::from(&self.stream).connect(&SockAddr::from(*addr)) {
			Ok(()) => ConnectProgress::Connected,
			Err(e) => match e.raw_os_error() {
				Some(libc::EISCONN) => ConnectProgress::Connected,
				Some(libc::EINPROGRESS) | Some(libc::EINTR) => ConnectProgress::InProgress,
				_ => ConnectProgress::Failed(e),
			},
		}
	}

	pub fn read(&self, buf: &mut [u8]) -> IoStatus {
		match (&self.stream).read(buf) {
			Ok(n) => {
				if n > 0 {
					self.touch();
				}
				IoStatus::Done(n)
			},
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStatus::WouldBlock,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => IoStatus::WouldBlock,
			Err(e) => {
				debug!(fd = self.fd(), err = %e, "recv error");
				self.errored.store(true, Ordering::SeqCst);
				IoStatus::Error(e)
			},
		}
	}

	pub fn write(&self, buf: &[u8]) -> IoStatus {
		match (&self.stream).write(buf) {
			Ok(n) => {
				self.touch();
				IoStatus::Done(n)
			},
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoStatus::WouldBlock,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => IoStatus::WouldBlock,
			Err(e) if e.raw_os_error() == Some(libc::EPIPE) => IoStatus::Closed,
			Err(e) => {
				debug!(fd = self.fd(), err = %e, "send error");
				self.errored.store(true, Ordering::SeqCst);
				IoStatus::Error(e)
			},
		}
	}

	pub fn shutdown_write(&self) {
		debug!(fd = self.fd(), "shutdown write");
		self.write_closed.store(true, Ordering::SeqCst);
		if let Err(e) = self.stream.shutdown(Shutdown::Write) {
			if e.kind() != io::ErrorKind::NotConnected {
				debug!(fd = self.fd(), err = %e, "shutdown write failed");
			}
		}
	}

	pub fn shutdown_read(&self) {
		debug!(fd = self.fd(), "shutdown read");
		self.read_closed.store(true, Ordering::SeqCst);
		if let Err(e) = self.stream.shutdown(Shutdown::Read) {
			if e.kind() != io::ErrorKind::NotConnected {
				debug!(fd = self.fd(), err = %e, "shutdown read failed");
			}
		}
	}

	pub fn read_closed(&self) -> bool {
		self.read_closed.load(Ordering::SeqCst)
	}

	pub fn write_closed(&self) -> bool {
		self.write_closed.load(Ordering::SeqCst)
	}

	pub fn errored(&self) -> bool {
		self.errored.load(Ordering::SeqCst)
	}

	pub fn last_activity(&self) -> Instant {
		*self.last_activity.lock().unwrap()
	}

	fn touch(&self) {
		*self.last_activity.lock().unwrap() = Instant::now();
	}
}

impl AsFd for Connection {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.stream.as_fd()
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection").field("fd", &self.fd()).finish()
	}
}

/// Outcome of one accept attempt.
pub enum AcceptStatus {
	Accepted(TcpStream, SocketAddr),
	WouldBlock,
	Error(io::Error),
}

/// The non-blocking listen socket.
pub struct Listener {
	inner: TcpListener,
}

impl Listener {
	pub fn bind(port: u16) -> io::Result<Listener> {
		let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
		socket.set_reuse_address(true)?;
		socket.set_nonblocking(true)?;
		let addr = SocketAddr::from(([0, 0, 0, 0], port));
		socket.bind(&SockAddr::from(addr))?;
		socket.listen(LISTEN_BACKLOG)?;
		Ok(Listener {
			inner: socket.into(),
		})
	}

	pub fn local_port(&self) -> u16 {
		self.inner.local_addr().map(|a| a.port()).unwrap_or(0)
	}

	pub fn accept(&self) -> AcceptStatus {
		match self.inner.accept() {
			Ok((stream, peer)) => AcceptStatus::Accepted(stream, peer),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => AcceptStatus::WouldBlock,
			Err(e) => AcceptStatus::Error(e),
		}
	}
}

impl AsFd for Listener {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.inner.as_fd()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pair() -> (Connection, TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let (server, _) = listener.accept().unwrap();
		(Connection::from_accepted(server).unwrap(), client)
	}

	#[test]
	fn read_maps_empty_socket_to_would_block() {
		let (conn, _client) = pair();
		let mut buf = [0u8; 16];
		assert!(matches!(conn.read(&mut buf), IoStatus::WouldBlock));
	}

	#[test]
	fn read_maps_peer_eof_to_zero_bytes() {
		let (conn, client) = pair();
		client.shutdown(Shutdown::Write).unwrap();
		let mut buf = [0u8; 16];
		// The EOF may race the FIN delivery; spin briefly.
		for _ in 0..100 {
			match conn.read(&mut buf) {
				IoStatus::Done(0) => return,
				IoStatus::WouldBlock => std::thread::sleep(std::time::Duration::from_millis(5)),
				other => panic!("unexpected status {other:?}"),
			}
		}
		panic!("never observed EOF");
	}

	#[test]
	fn read_sees_written_bytes() {
		let (conn, mut client) = pair();
		client.write_all(b"abc").unwrap();
		let mut buf = [0u8; 16];
		loop {
			match conn.read(&mut buf) {
				IoStatus::Done(3) => {
					assert_eq!(&buf[..3], b"abc");
					return;
				},
				IoStatus::WouldBlock => std::thread::sleep(std::time::Duration::from_millis(5)),
				other => panic!("unexpected status {other:?}"),
			}
		}
	}

	#[test]
	fn shutdown_flags_latch() {
		let (conn, _client) = pair();
		assert!(!conn.write_closed());
		conn.shutdown_write();
		assert!(conn.write_closed());
		conn.shutdown_read();
		assert!(conn.read_closed());
	}

	#[test]
	fn outbound_connect_reaches_local_listener() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let conn = Connection::for_outbound(&addr);
		let mut status = conn.connect(&addr);
		for _ in 0..100 {
			match status {
				ConnectProgress::Connected => return,
				ConnectProgress::InProgress => {
					std::thread::sleep(std::time::Duration::from_millis(5));
					status = conn.connect(&addr);
				},
				ConnectProgress::Failed(e) => panic!("connect failed: {e}"),
			}
		}
		panic!("connect never completed");
	}
}
