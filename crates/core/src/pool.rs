use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads draining a shared queue.
///
/// Each dispatched job is its own failure domain: a panicking handler is
/// caught and logged, and the worker keeps draining.
pub struct WorkerPool {
	name: &'static str,
	sender: Mutex<Option<Sender<Job>>>,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
	pub fn new(name: &'static str, size: usize) -> WorkerPool {
		assert!(size > 0);
		let (sender, receiver) = unbounded::<Job>();
		let workers = (0..size)
			.map(|i| {
				let receiver = receiver.clone();
				std::thread::Builder::new()
					.name(format!("{name}-{i}"))
					.spawn(move || run(name, receiver))
					.expect("failed to spawn worker thread")
			})
			.collect();
		WorkerPool {
			name,
			sender: Mutex::new(Some(sender)),
			workers: Mutex::new(workers),
		}
	}

	pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
		if let Some(sender) = &*self.sender.lock().unwrap() {
			// Send fails only once every worker has exited during shutdown.
			let _ = sender.send(Box::new(job));
		}
	}

	/// Disconnect the queue and wait for the workers to drain and exit.
	pub fn shutdown(&self) {
		self.sender.lock().unwrap().take();
		let workers = std::mem::take(&mut *self.workers.lock().unwrap());
		for worker in workers {
			let _ = worker.join();
		}
		trace!(pool = self.name, "worker pool stopped");
	}
}

impl Drop for WorkerPool {
	fn drop(&mut self) {
		self.shutdown();
	}
}

fn run(name: &'static str, receiver: Receiver<Job>) {
	while let Ok(job) = receiver.recv() {
		if catch_unwind(AssertUnwindSafe(job)).is_err() {
			error!(pool = name, "dispatched job panicked");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;

	#[test]
	fn runs_jobs_and_drains_on_shutdown() {
		let counter = Arc::new(AtomicUsize::new(0));
		let pool = WorkerPool::new("test", 4);
		for _ in 0..100 {
			let counter = counter.clone();
			pool.execute(move || {
				counter.fetch_add(1, Ordering::SeqCst);
			});
		}
		pool.shutdown();
		assert_eq!(counter.load(Ordering::SeqCst), 100);
	}

	#[test]
	fn panicking_job_does_not_kill_the_worker() {
		let counter = Arc::new(AtomicUsize::new(0));
		let pool = WorkerPool::new("test-panic", 1);
		pool.execute(|| panic!("boom"));
		let c = counter.clone();
		pool.execute(move || {
			c.fetch_add(1, Ordering::SeqCst);
		});
		std::thread::sleep(Duration::from_millis(50));
		pool.shutdown();
		assert_eq!(counter.load(Ordering::SeqCst), 1);
	}
}
