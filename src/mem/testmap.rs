//! Test-only mapping wrapper that counts drains.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::map::{AnonMap, MapBackend};

/// Wraps an anonymous mapping and counts every drain, so tests can
/// assert the at-most-one-drain property of the persistent memcpy.
pub(crate) struct CountingMap {
	inner: AnonMap,
	drains: AtomicUsize,
}

impl CountingMap {
	pub fn new(size: usize) -> Self {
		Self {
			inner: AnonMap::new(size).unwrap(),
			drains: AtomicUsize::new(0),
		}
	}

	pub fn drain_count(&self) -> usize {
		self.drains.load(Ordering::Relaxed)
	}
}

impl MapBackend for CountingMap {
	fn len(&self) -> usize {
		self.inner.len()
	}

	fn as_ptr(&self) -> *const u8 {
		self.inner.as_ptr()
	}

	fn as_mut_ptr(&self) -> *mut u8 {
		self.inner.as_mut_ptr()
	}

	fn flush(&self, offset: usize, len: usize) {
		self.inner.flush(offset, len);
	}

	fn drain(&self) {
		self.drains.fetch_add(1, Ordering::Relaxed);
		self.inner.drain();
	}
}
