use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::{
	mem::map::MapBackend,
	stream::span::{entry_check_consistency, Span, SpanType, ENTRY_HEADER_SIZE},
	StreamError, StreamResult,
};

/// Handle to a region span.
/// Copyable and trivially small; valid for as long as the stream that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Region {
	pub(crate) offset: u64,
}

impl Region {
	/// The offset of the region span within the stream.
	pub fn offset(&self) -> u64 {
		self.offset
	}
}

/// Handle to an entry span inside some region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Entry {
	pub(crate) offset: u64,
}

impl Entry {
	pub fn offset(&self) -> u64 {
		self.offset
	}
}

/// After opening a stream every region is in one of these two states.
/// The only transition is `ReadReady -> WriteReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RuntimeState {
	/// Reading from the region is safe.
	ReadReady = 0,
	/// Reading and writing are safe; the append offset is known.
	WriteReady = 1,
}

/// Volatile per-region state.
///
/// Owned by the stream's runtime map; callers hold shared handles whose
/// usefulness ends with the stream. Created lazily by the first of:
/// explicit initialization, an append/reserve, or an entry iterator
/// advancing past the last entry.
pub struct RegionRuntime {
	region: Region,
	/// First possible entry offset; cached from the region span.
	first_entry: u64,
	/// One past the last byte of the entry area.
	end: u64,
	state: AtomicU32,
	/// Where the next reservation begins. Zero until write-ready.
	append_offset: AtomicU64,
	/// Entries starting below this offset are committed and can be read
	/// from any thread. Zero until write-ready.
	committed_offset: AtomicU64,
	/// Protects the recovery transition only. Never held across user
	/// code.
	lock: Mutex<()>,
}

impl RegionRuntime {
	pub(crate) fn new(region: Region, first_entry: u64, end: u64) -> Self {
		Self {
			region,
			first_entry,
			end,
			state: AtomicU32::new(RuntimeState::ReadReady as u32),
			append_offset: AtomicU64::new(0),
			committed_offset: AtomicU64::new(0),
			lock: Mutex::new(()),
		}
	}

	pub fn region(&self) -> Region {
		self.region
	}

	pub fn state(&self) -> RuntimeState {
		if self.state.load(Ordering::Acquire) == RuntimeState::WriteReady as u32 {
			RuntimeState::WriteReady
		} else {
			RuntimeState::ReadReady
		}
	}

	pub fn is_write_ready(&self) -> bool {
		self.state() == RuntimeState::WriteReady
	}

	/// Requires write-ready; zero means not yet initialized.
	pub fn append_offset(&self) -> u64 {
		self.append_offset.load(Ordering::Acquire)
	}

	/// Requires write-ready; zero means not yet initialized.
	pub fn committed_offset(&self) -> u64 {
		self.committed_offset.load(Ordering::Acquire)
	}

	pub(crate) fn first_entry(&self) -> u64 {
		self.first_entry
	}

	pub(crate) fn end(&self) -> u64 {
		self.end
	}

	/// Reserves `need` bytes of the entry area and returns their start
	/// offset. The reservation is serialized against concurrent
	/// appenders by the CAS; a failed bound check leaves the append
	/// offset untouched.
	pub(crate) fn reserve(&self, need: u64) -> StreamResult<u64> {
		debug_assert!(self.is_write_ready());
		let mut current = self.append_offset.load(Ordering::Relaxed);
		loop {
			if need > self.end - current {
				return Err(StreamError::OutOfRange);
			}
			match self.append_offset.compare_exchange_weak(
				current,
				current + need,
				Ordering::Relaxed,
				Ordering::Relaxed,
			) {
				Ok(_) => return Ok(current),
				Err(actual) => current = actual,
			}
		}
	}

	/// Makes a persisted reservation visible to readers.
	pub(crate) fn commit(&self, need: u64) {
		self.committed_offset.fetch_add(need, Ordering::Release);
	}

	/// Performs region recovery: scans the entry sequence to find the
	/// append point and promotes the region to write-ready. Idempotent;
	/// concurrent callers serialize on the region lock and all but the
	/// first return immediately.
	pub(crate) fn initialize_for_write(&self, map: &dyn MapBackend) {
		if self.is_write_ready() {
			return;
		}
		let _guard = self.lock.lock();
		if self.is_write_ready() {
			return;
		}
		let tail = scan_entries(map, self.first_entry, self.end);
		// Everything below the tail was persisted with a drain before
		// its successor was written, so the committed and append
		// offsets coincide after recovery.
		self.append_offset.store(tail, Ordering::Relaxed);
		self.committed_offset.store(tail, Ordering::Relaxed);
		self.state
			.store(RuntimeState::WriteReady as u32, Ordering::Release);
		debug!(
			"region {:#x}: recovered, append offset {:#x}",
			self.region.offset, tail
		);
	}
}

/// Decodes the span at `offset` and returns it only if it is a whole,
/// popcount-consistent entry within `[offset, end)`. Anything else
/// (empty span, torn entry, decode failure, overrun) is the end of the
/// entry sequence.
pub(crate) fn valid_entry_at(map: &dyn MapBackend, offset: u64, end: u64) -> Option<Span> {
	if ENTRY_HEADER_SIZE > end || offset > end - ENTRY_HEADER_SIZE {
		return None;
	}
	let span = Span::decode(map, offset).ok()?;
	if span.span_type != SpanType::Entry {
		return None;
	}
	// The entry area end is span-aligned, so a payload that fits also
	// fits with its padding.
	if span.size > end - offset - ENTRY_HEADER_SIZE {
		return None;
	}
	if !entry_check_consistency(map, &span) {
		return None;
	}
	Some(span)
}

/// Walks valid entries from `first` and returns the offset of the first
/// position that does not hold one.
fn scan_entries(map: &dyn MapBackend, first: u64, end: u64) -> u64 {
	let mut offset = first;
	while let Some(span) = valid_entry_at(map, offset, end) {
		offset = span.end();
	}
	offset
}
