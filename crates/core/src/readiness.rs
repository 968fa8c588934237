use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::process;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::error;

/// Maximum events drained per wait call.
pub const WAIT_BATCH: usize = 100;

/// Bounded wait so pollers observe the shutdown flag promptly.
const WAIT_TIMEOUT_MS: u16 = 2000;

/// A single edge-triggered, one-shot readiness set.
///
/// Every arm is `EPOLLET | EPOLLONESHOT`: once an event fires the fd stays
/// registered but disarmed, and the handler must re-arm it before returning
/// unless the fd is being removed. Read arms always carry
/// `RDHUP | HUP | ERR`; write arms carry `HUP | ERR`.
pub struct ReadinessSet {
	name: &'static str,
	epoll: Epoll,
}

/// One readiness event, keyed by raw fd.
#[derive(Clone, Copy, Debug)]
pub struct Event {
	pub fd: RawFd,
	flags: EpollFlags,
}

impl Event {
	pub fn readable(&self) -> bool {
		self.flags.contains(EpollFlags::EPOLLIN)
	}

	pub fn writable(&self) -> bool {
		self.flags.contains(EpollFlags::EPOLLOUT)
	}

	pub fn rd_hup(&self) -> bool {
		self.flags.contains(EpollFlags::EPOLLRDHUP)
	}

	pub fn hup(&self) -> bool {
		self.flags.contains(EpollFlags::EPOLLHUP)
	}

	pub fn err(&self) -> bool {
		self.flags.contains(EpollFlags::EPOLLERR)
	}
}

impl ReadinessSet {
	pub fn new(name: &'static str) -> ReadinessSet {
		let epoll = match Epoll::new(EpollCreateFlags::empty()) {
			Ok(e) => e,
			Err(e) => fatal(name, "epoll create failed", e),
		};
		ReadinessSet { name, epoll }
	}

	/// Register an fd for read readiness. `want_in` may be false to keep only
	/// the hangup/error interest armed (backpressure).
	pub fn add_read(&self, sock: &impl AsFd, want_in: bool) {
		let ev = EpollEvent::new(read_interest(want_in), raw(sock));
		if let Err(e) = self.epoll.add(sock, ev) {
			fatal(self.name, "epoll ctl add failed", e);
		}
	}

	/// Re-arm an already registered read fd.
	pub fn rearm_read(&self, sock: &impl AsFd, want_in: bool) {
		let mut ev = EpollEvent::new(read_interest(want_in), raw(sock));
		if let Err(e) = self.epoll.modify(sock, &mut ev) {
			fatal(self.name, "epoll ctl mod failed", e);
		}
	}

	pub fn add_write(&self, sock: &impl AsFd, want_out: bool) {
		let ev = EpollEvent::new(write_interest(want_out), raw(sock));
		if let Err(e) = self.epoll.add(sock, ev) {
			fatal(self.name, "epoll ctl add failed", e);
		}
	}

	pub fn rearm_write(&self, sock: &impl AsFd, want_out: bool) {
		let mut ev = EpollEvent::new(write_interest(want_out), raw(sock));
		if let Err(e) = self.epoll.modify(sock, &mut ev) {
			fatal(self.name, "epoll ctl mod failed", e);
		}
	}

	pub fn delete(&self, sock: &impl AsFd) {
		if let Err(e) = self.epoll.delete(sock) {
			fatal(self.name, "epoll ctl del failed", e);
		}
	}

	/// Wait for the next batch of events. Returns an empty batch on timeout
	/// or EINTR so callers re-check the shutdown flag.
	pub fn wait(&self, out: &mut Vec<Event>) {
		out.clear();
		let mut events = [EpollEvent::empty(); WAIT_BATCH];
		let n = match self.epoll.wait(&mut events, EpollTimeout::from(WAIT_TIMEOUT_MS)) {
			Ok(n) => n,
			Err(Errno::EINTR) => 0,
			Err(e) => fatal(self.name, "epoll wait failed", e),
		};
		for ev in &events[..n] {
			out.push(Event {
				fd: ev.data() as RawFd,
				flags: ev.events(),
			});
		}
	}
}

fn raw(sock: &impl AsFd) -> u64 {
	sock.as_fd().as_raw_fd() as u64
}

fn read_interest(want_in: bool) -> EpollFlags {
	let mut flags = EpollFlags::EPOLLRDHUP
		| EpollFlags::EPOLLHUP
		| EpollFlags::EPOLLERR
		| EpollFlags::EPOLLET
		| EpollFlags::EPOLLONESHOT;
	if want_in {
		flags |= EpollFlags::EPOLLIN;
	}
	flags
}

fn write_interest(want_out: bool) -> EpollFlags {
	let mut flags = EpollFlags::EPOLLHUP
		| EpollFlags::EPOLLERR
		| EpollFlags::EPOLLET
		| EpollFlags::EPOLLONESHOT;
	if want_out {
		flags |= EpollFlags::EPOLLOUT;
	}
	flags
}

fn fatal(name: &str, msg: &str, err: Errno) -> ! {
	error!(set = name, err = %err, "{msg}");
	process::abort()
}

#[cfg(test)]
mod tests {
	use std::net::{TcpListener, TcpStream};

	use super::*;

	#[test]
	fn read_event_fires_once_until_rearmed() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let (server, _) = listener.accept().unwrap();
		server.set_nonblocking(true).unwrap();

		let set = ReadinessSet::new("test-read");
		set.add_read(&server, true);

		use std::io::Write;
		(&client).write_all(b"hello").unwrap();

		let mut events = Vec::new();
		set.wait(&mut events);
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].fd, server.as_fd().as_raw_fd());
		assert!(events[0].readable());

		// One-shot: without a re-arm the fd stays silent even with more data.
		(&client).write_all(b"again").unwrap();
		set.wait(&mut events);
		assert!(events.is_empty());

		set.rearm_read(&server, true);
		set.wait(&mut events);
		assert_eq!(events.len(), 1);
		assert!(events[0].readable());
	}

	#[test]
	fn rd_hup_reported_on_peer_shutdown() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let (server, _) = listener.accept().unwrap();
		server.set_nonblocking(true).unwrap();

		let set = ReadinessSet::new("test-hup");
		set.add_read(&server, true);
		client.shutdown(std::net::Shutdown::Write).unwrap();

		let mut events = Vec::new();
		set.wait(&mut events);
		assert_eq!(events.len(), 1);
		assert!(events[0].rd_hup());
	}
}
