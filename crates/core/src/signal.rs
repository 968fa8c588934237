use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::info;

/// Process-wide shutdown flag.
///
/// Polling loops check `in_progress()` on every iteration; a delivered
/// signal interrupts their wait syscall (EINTR) so the bound on shutdown
/// latency is the poll timeout. `trigger` is cheap and idempotent.
#[derive(Clone, Default)]
pub struct Shutdown {
	inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
	flag: AtomicBool,
	lock: Mutex<()>,
	cond: Condvar,
}

impl Shutdown {
	pub fn new() -> Shutdown {
		Shutdown::default()
	}

	pub fn in_progress(&self) -> bool {
		self.inner.flag.load(Ordering::SeqCst)
	}

	pub fn trigger(&self) {
		if !self.inner.flag.swap(true, Ordering::SeqCst) {
			info!("shutdown triggered");
		}
		self.inner.cond.notify_all();
	}

	/// Block the calling thread until shutdown is triggered.
	pub fn wait(&self) {
		let mut guard = self.inner.lock.lock().unwrap();
		while !self.in_progress() {
			guard = self
				.inner
				.cond
				.wait_timeout(guard, Duration::from_millis(500))
				.unwrap()
				.0;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn trigger_releases_waiters() {
		let shutdown = Shutdown::new();
		assert!(!shutdown.in_progress());
		let waiter = shutdown.clone();
		let handle = std::thread::spawn(move || waiter.wait());
		std::thread::sleep(Duration::from_millis(20));
		shutdown.trigger();
		handle.join().unwrap();
		assert!(shutdown.in_progress());
	}
}
