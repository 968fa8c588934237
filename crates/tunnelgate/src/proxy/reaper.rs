use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gate_core::scheduler::Scheduler;
use gate_core::signal::Shutdown;
use tracing::{debug, trace};

use crate::transport::Connection;

/// How often each stage's reap job runs.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Quarantine for sockets that have been logically shut down.
///
/// The fd must stay valid briefly after removal from the state maps so
/// in-flight readiness events that still name it resolve to "late event,
/// ignore" instead of aliasing a recycled fd. Entries are append-ordered by
/// timestamp; the reaper frees the prefix older than the grace period.
pub struct CloseQueue {
	name: &'static str,
	grace: Duration,
	entries: Mutex<VecDeque<(Instant, Arc<Connection>)>>,
}

impl CloseQueue {
	pub fn new(name: &'static str, grace: Duration) -> Arc<CloseQueue> {
		Arc::new(CloseQueue {
			name,
			grace,
			entries: Mutex::new(VecDeque::new()),
		})
	}

	/// Quarantine a connection. The caller has removed it from every state
	/// map and shut it down — at least its write half, for sockets whose
	/// final response must still drain to the peer.
	pub fn push(&self, conn: Arc<Connection>) {
		self.entries.lock().unwrap().push_back((Instant::now(), conn));
	}

	/// Free every entry older than the grace period. Dropping the last
	/// reference closes the fd.
	pub fn reap(&self) -> usize {
		let cutoff = Instant::now() - self.grace;
		let mut expired = Vec::new();
		{
			let mut entries = self.entries.lock().unwrap();
			while let Some((at, _)) = entries.front() {
				if *at < cutoff {
					expired.push(entries.pop_front().unwrap());
				} else {
					break;
				}
			}
		}
		let freed = expired.len();
		if freed > 0 {
			debug!(queue = self.name, freed, "reaped quarantined connections");
		}
		// fds close here, outside the queue lock.
		drop(expired);
		freed
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().unwrap().is_empty()
	}

	/// Run the reap job every `REAP_INTERVAL` until shutdown.
	pub fn install(self: Arc<Self>, scheduler: &Arc<Scheduler>, shutdown: &Shutdown) {
		schedule_tick(self, scheduler.clone(), shutdown.clone());
	}
}

fn schedule_tick(queue: Arc<CloseQueue>, scheduler: Arc<Scheduler>, shutdown: Shutdown) {
	let next = scheduler.clone();
	scheduler.schedule(REAP_INTERVAL, move || {
		if shutdown.in_progress() {
			trace!(queue = queue.name, "reap job stopping");
			return;
		}
		queue.reap();
		schedule_tick(queue, next, shutdown);
	});
}
