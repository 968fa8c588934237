use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

/// Size of the shared mutex pool.
pub const LOCK_STRIPES: usize = 10_000;

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

static STRIPES: Lazy<Vec<Mutex<()>>> =
	Lazy::new(|| (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect());

/// A handle onto one mutex drawn from the shared pool.
///
/// The index is assigned from a monotonic counter at construction and never
/// changes, so all serialized sections of one owner always contend on the
/// same stripe. Distinct owners may share a stripe; the pool is sized so
/// collisions are rare.
#[derive(Debug)]
pub struct StripeLock {
	index: usize,
}

impl StripeLock {
	pub fn new() -> StripeLock {
		StripeLock {
			index: NEXT_STRIPE.fetch_add(1, Ordering::Relaxed) % LOCK_STRIPES,
		}
	}

	pub fn lock(&self) -> MutexGuard<'static, ()> {
		match STRIPES[self.index].lock() {
			Ok(guard) => guard,
			// A stripe is shared by unrelated states; a panic elsewhere does
			// not invalidate the unit data it guards.
			Err(poisoned) => poisoned.into_inner(),
		}
	}
}

impl Default for StripeLock {
	fn default() -> Self {
		StripeLock::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn indices_advance_monotonically_mod_pool_size() {
		let a = StripeLock::new();
		let b = StripeLock::new();
		assert_eq!((a.index + 1) % LOCK_STRIPES, b.index % LOCK_STRIPES);
		assert!(a.index < LOCK_STRIPES);
		assert!(b.index < LOCK_STRIPES);
	}

	#[test]
	fn same_handle_always_locks_the_same_stripe() {
		let lock = StripeLock::new();
		let index = lock.index;
		drop(lock.lock());
		drop(lock.lock());
		assert_eq!(lock.index, index);
	}

	#[test]
	fn stripes_are_independent() {
		let a = StripeLock::new();
		let b = StripeLock::new();
		// Holding one stripe must not block a different stripe.
		let _ga = a.lock();
		let _gb = b.lock();
	}
}
