use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
	at: Instant,
	seq: u64,
	job: Job,
}

// BinaryHeap is a max-heap; invert so the earliest deadline pops first.
impl Ord for Entry {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
	}
}

impl PartialOrd for Entry {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}

impl PartialEq for Entry {
	fn eq(&self, other: &Self) -> bool {
		self.at == other.at && self.seq == other.seq
	}
}

impl Eq for Entry {}

#[derive(Default)]
struct Queue {
	heap: BinaryHeap<Entry>,
	next_seq: u64,
	stopped: bool,
}

/// Deferred-job timer. Jobs run on the scheduler thread; periodic jobs
/// re-arm themselves by scheduling their successor.
pub struct Scheduler {
	shared: Arc<(Mutex<Queue>, Condvar)>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
	pub fn new() -> Arc<Scheduler> {
		let shared = Arc::new((Mutex::new(Queue::default()), Condvar::new()));
		let runner = shared.clone();
		let thread = std::thread::Builder::new()
			.name("scheduler".to_string())
			.spawn(move || run(runner))
			.expect("failed to spawn scheduler thread");
		Arc::new(Scheduler {
			shared,
			thread: Mutex::new(Some(thread)),
		})
	}

	pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Duration, job: F) {
		let (queue, cond) = &*self.shared;
		let mut queue = queue.lock().unwrap();
		if queue.stopped {
			return;
		}
		let seq = queue.next_seq;
		queue.next_seq += 1;
		queue.heap.push(Entry {
			at: Instant::now() + delay,
			seq,
			job: Box::new(job),
		});
		cond.notify_one();
	}

	/// Stop the timer thread. Pending jobs are dropped unrun.
	pub fn stop(&self) {
		let (queue, cond) = &*self.shared;
		{
			let mut queue = queue.lock().unwrap();
			queue.stopped = true;
			queue.heap.clear();
		}
		cond.notify_one();
		if let Some(thread) = self.thread.lock().unwrap().take() {
			let _ = thread.join();
		}
	}
}

fn run(shared: Arc<(Mutex<Queue>, Condvar)>) {
	let (queue, cond) = &*shared;
	let mut guard = queue.lock().unwrap();
	loop {
		if guard.stopped {
			return;
		}
		let now = Instant::now();
		match guard.heap.peek() {
			None => {
				guard = cond.wait(guard).unwrap();
			},
			Some(entry) if entry.at <= now => {
				let entry = guard.heap.pop().unwrap();
				drop(guard);
				if catch_unwind(AssertUnwindSafe(entry.job)).is_err() {
					error!("scheduled job panicked");
				}
				guard = queue.lock().unwrap();
			},
			Some(entry) => {
				let timeout = entry.at - now;
				guard = cond.wait_timeout(guard, timeout).unwrap().0;
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn jobs_run_in_deadline_order() {
		let sched = Scheduler::new();
		let order = Arc::new(Mutex::new(Vec::new()));
		let first = order.clone();
		let second = order.clone();
		sched.schedule(Duration::from_millis(60), move || {
			second.lock().unwrap().push(2)
		});
		sched.schedule(Duration::from_millis(10), move || {
			first.lock().unwrap().push(1)
		});
		std::thread::sleep(Duration::from_millis(150));
		assert_eq!(*order.lock().unwrap(), vec![1, 2]);
		sched.stop();
	}

	#[test]
	fn rescheduling_job_fires_repeatedly() {
		let sched = Scheduler::new();
		let hits = Arc::new(AtomicUsize::new(0));

		fn tick(sched: Arc<Scheduler>, hits: Arc<AtomicUsize>) {
			hits.fetch_add(1, Ordering::SeqCst);
			let next = sched.clone();
			sched.schedule(Duration::from_millis(10), move || {
				tick(next.clone(), hits)
			});
		}

		let s = sched.clone();
		let h = hits.clone();
		sched.schedule(Duration::from_millis(10), move || tick(s, h));
		std::thread::sleep(Duration::from_millis(100));
		sched.stop();
		assert!(hits.load(Ordering::SeqCst) >= 3);
	}
}
