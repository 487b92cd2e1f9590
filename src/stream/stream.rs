use std::{marker::PhantomData, path::Path, slice, sync::Arc};

use log::debug;

use crate::{
	error::{StreamError, StreamResult},
	mem::{
		map::{FileMap, MapBackend},
		SPAN_ALIGN,
	},
	stream::{
		allocator::RegionAllocator,
		header::StreamHeader,
		iterator::{EntryIter, RegionIter},
		region::{Entry, Region, RegionRuntime},
		runtimemap::RegionRuntimeMap,
		span::{self, entry_footprint, Span, SpanType, ENTRY_HEADER_SIZE},
	},
};

/// An append-only, region-partitioned stream over a persistent mapping.
///
/// The stream exclusively owns the mapping and all per-region runtime
/// state. Opening is read-ready: no scan happens until a region sees
/// its first write (or [Stream::region_runtime_initialize] front-loads
/// it). All operations take `&self`; appends to the same region are
/// serialized by the reservation CAS, appends to different regions do
/// not contend.
pub struct Stream {
	map: Box<dyn MapBackend>,
	header: StreamHeader,
	allocator: RegionAllocator,
	runtimes: RegionRuntimeMap,
}

impl Stream {
	/// Opens a stream over `map`, formatting all-zero media in place.
	///
	/// `block_size` must be a power of two no smaller than the span
	/// alignment, and must match the stored geometry when the media was
	/// formatted before.
	pub fn from_map(map: Box<dyn MapBackend>, block_size: u64) -> StreamResult<Self> {
		StreamHeader::validate_block_size(block_size)?;
		if (map.len() as u64) < 2 * SPAN_ALIGN + block_size {
			return Err(StreamError::InvalidArgument);
		}
		let header = match StreamHeader::read_from(map.as_ref())? {
			Some(header) => {
				if header.block_size != block_size {
					return Err(StreamError::BadBlockSize(block_size));
				}
				header
			}
			None => {
				let header = StreamHeader::new(block_size);
				header.write_to(map.as_ref())?;
				debug!("stream: formatted fresh media, block size {}", block_size);
				header
			}
		};
		let allocator = RegionAllocator::open(map.as_ref(), header.first_region, header.block_size);
		debug!("stream: opened, {} bytes mapped", map.len());
		Ok(Self {
			map,
			header,
			allocator,
			runtimes: RegionRuntimeMap::new(),
		})
	}

	/// Opens or creates a file-backed stream of at least `size` bytes.
	pub fn open_file<P: AsRef<Path>>(path: P, block_size: u64, size: u64) -> StreamResult<Self> {
		Self::from_map(Box::new(FileMap::open(path, size)?), block_size)
	}

	pub fn block_size(&self) -> u64 {
		self.header.block_size
	}

	pub(crate) fn map(&self) -> &dyn MapBackend {
		self.map.as_ref()
	}

	pub(crate) fn first_region(&self) -> u64 {
		self.header.first_region
	}

	/// Allocates a region of at least `size` payload bytes (rounded up
	/// to the block size).
	pub fn region_allocate(&self, size: u64) -> StreamResult<Region> {
		self.allocator.allocate(self.map(), size)
	}

	/// Returns the region to the free list and drops its runtime.
	/// The handle must name a currently allocated region.
	pub fn region_free(&self, region: Region) -> StreamResult<()> {
		self.allocator.free(self.map(), region)?;
		self.runtimes.remove(region);
		Ok(())
	}

	/// The payload capacity of the region in bytes.
	pub fn region_size(&self, region: Region) -> StreamResult<u64> {
		let span = Span::decode(self.map(), region.offset)?;
		if span.span_type != SpanType::Region {
			return Err(StreamError::InvalidArgument);
		}
		Ok(span.size)
	}

	/// Recovers the region's append point now, so the first append does
	/// not pay for the O(entries) scan. Returns the runtime handle,
	/// which later appends may pass back to skip the map lookup.
	pub fn region_runtime_initialize(&self, region: Region) -> StreamResult<Arc<RegionRuntime>> {
		let runtime = self.runtimes.get_or_create(self.map(), region)?;
		runtime.initialize_for_write(self.map());
		Ok(runtime)
	}

	pub(crate) fn runtime(&self, region: Region) -> StreamResult<Arc<RegionRuntime>> {
		self.runtimes.get_or_create(self.map(), region)
	}

	/// Resolves the runtime for a write: the caller-supplied handle if
	/// it matches, the cached or fresh one otherwise, promoted to
	/// write-ready either way.
	fn write_ready_runtime(
		&self,
		region: Region,
		runtime: Option<&Arc<RegionRuntime>>,
	) -> StreamResult<Arc<RegionRuntime>> {
		let runtime = match runtime {
			Some(runtime) => {
				if runtime.region() != region {
					return Err(StreamError::InvalidArgument);
				}
				runtime.clone()
			}
			None => self.runtimes.get_or_create(self.map(), region)?,
		};
		runtime.initialize_for_write(self.map());
		Ok(runtime)
	}

	/// Appends `data` as one entry: reserves a slot, persists header,
	/// popcount and payload with a single drain, and makes the entry
	/// visible to readers. Durable when this returns.
	pub fn append(
		&self,
		region: Region,
		runtime: Option<&Arc<RegionRuntime>>,
		data: &[u8],
	) -> StreamResult<Entry> {
		let runtime = self.write_ready_runtime(region, runtime)?;
		let need = entry_footprint(data.len() as u64);
		let offset = runtime.reserve(need)?;
		span::entry_write(self.map(), offset, data);
		runtime.commit(need);
		Ok(Entry { offset })
	}

	/// Reserves an entry slot for `size` payload bytes and exposes it
	/// for direct writes. The slot holds no entry until
	/// [Stream::publish]; a reservation that is never published is
	/// reclaimed as a torn tail by the next recovery.
	pub fn reserve(
		&self,
		region: Region,
		runtime: Option<&Arc<RegionRuntime>>,
		size: u64,
	) -> StreamResult<ReservedEntry<'_>> {
		let runtime = self.write_ready_runtime(region, runtime)?;
		let need = entry_footprint(size);
		let offset = runtime.reserve(need)?;
		let data = unsafe {
			self.map
				.as_mut_ptr()
				.add((offset + ENTRY_HEADER_SIZE) as usize)
		};
		Ok(ReservedEntry {
			entry: Entry { offset },
			data,
			size,
			_stream: PhantomData,
		})
	}

	/// Publishes a reserved entry whose payload the caller has written
	/// into the reserved slot. `data` must be the same bytes (it is the
	/// popcount source); the payload range is flushed and the header
	/// store carries the single drain.
	///
	/// Under concurrent publishes the committed offset is advanced in
	/// completion order, which may transiently expose a slot past a
	/// still-unpublished reservation.
	pub fn publish(
		&self,
		region: Region,
		runtime: Option<&Arc<RegionRuntime>>,
		data: &[u8],
		reserved: ReservedEntry<'_>,
	) -> StreamResult<()> {
		let runtime = self.write_ready_runtime(region, runtime)?;
		if data.len() as u64 != reserved.size {
			return Err(StreamError::InvalidArgument);
		}
		self.map.flush(
			(reserved.entry.offset + ENTRY_HEADER_SIZE) as usize,
			data.len(),
		);
		span::entry_publish(self.map(), reserved.entry.offset, data);
		runtime.commit(entry_footprint(reserved.size));
		Ok(())
	}

	/// Cursor over all region spans, freed ones included.
	pub fn region_iter(&self) -> RegionIter<'_> {
		RegionIter::new(self)
	}

	/// Cursor over the entries of `region`.
	pub fn entry_iter(&self, region: Region) -> StreamResult<EntryIter<'_>> {
		EntryIter::new(self, region)
	}

	/// The payload bytes of a committed entry.
	pub fn entry_data(&self, entry: Entry) -> StreamResult<&[u8]> {
		let span = self.entry_span(entry)?;
		Ok(self
			.map
			.slice(span.data_offset() as usize, span.size as usize))
	}

	/// The payload length of a committed entry.
	pub fn entry_length(&self, entry: Entry) -> StreamResult<u64> {
		Ok(self.entry_span(entry)?.size)
	}

	fn entry_span(&self, entry: Entry) -> StreamResult<Span> {
		let span = Span::decode(self.map(), entry.offset)?;
		if span.span_type != SpanType::Entry {
			return Err(StreamError::InvalidArgument);
		}
		Ok(span)
	}
}

/// A reserved but not yet published entry slot.
///
/// The caller writes the payload through [ReservedEntry::data_mut] and
/// hands the reservation back to [Stream::publish]. Dropping it without
/// publishing leaves a hole that the next recovery treats as the torn
/// tail.
pub struct ReservedEntry<'s> {
	entry: Entry,
	data: *mut u8,
	size: u64,
	_stream: PhantomData<&'s Stream>,
}

unsafe impl<'s> Send for ReservedEntry<'s> {}

impl<'s> ReservedEntry<'s> {
	pub fn entry(&self) -> Entry {
		self.entry
	}

	pub fn len(&self) -> u64 {
		self.size
	}

	pub fn is_empty(&self) -> bool {
		self.size == 0
	}

	/// The reserved payload slot. Exclusive to this reservation: the
	/// slot lies above the committed offset until publish, so no reader
	/// observes it.
	pub fn data_mut(&mut self) -> &mut [u8] {
		unsafe { slice::from_raw_parts_mut(self.data, self.size as usize) }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mem::map::{AnonMap, MemFlags};
	use rand::{rngs::StdRng, Rng, SeedableRng};

	const BLOCK: u64 = 4096;
	const REGION_SIZE: u64 = 64 * 1024;

	fn memory_stream() -> Stream {
		Stream::from_map(Box::new(AnonMap::new(10 << 20).unwrap()), BLOCK).unwrap()
	}

	fn collect_entries(stream: &Stream, region: Region) -> Vec<Vec<u8>> {
		stream
			.entry_iter(region)
			.unwrap()
			.map(|entry| stream.entry_data(entry).unwrap().to_vec())
			.collect()
	}

	#[test]
	fn append_then_iterate() {
		let stream = memory_stream();
		let region = stream.region_allocate(REGION_SIZE).unwrap();
		assert_eq!(REGION_SIZE, stream.region_size(region).unwrap());

		for payload in [&b"a"[..], b"bb", b"ccc"] {
			stream.append(region, None, payload).unwrap();
		}

		let mut iter = stream.entry_iter(region).unwrap();
		for expected in [&b"a"[..], b"bb", b"ccc"] {
			let entry = iter.next().unwrap();
			assert_eq!(expected, stream.entry_data(entry).unwrap());
			assert_eq!(expected.len() as u64, stream.entry_length(entry).unwrap());
		}
		assert!(iter.next().is_none());
	}

	#[test]
	fn reopen_survives() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("stream.pms");
		let region = {
			let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
			let region = stream.region_allocate(REGION_SIZE).unwrap();
			for payload in [&b"a"[..], b"bb", b"ccc"] {
				stream.append(region, None, payload).unwrap();
			}
			region
		};

		let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
		assert_eq!(
			vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()],
			collect_entries(&stream, region)
		);

		stream.append(region, None, b"dddd").unwrap();
		assert_eq!(
			vec![
				b"a".to_vec(),
				b"bb".to_vec(),
				b"ccc".to_vec(),
				b"dddd".to_vec()
			],
			collect_entries(&stream, region)
		);
	}

	#[test]
	fn reopening_twice_reads_the_same_entries() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("stream.pms");
		let region = {
			let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
			let region = stream.region_allocate(REGION_SIZE).unwrap();
			for i in 0..10u32 {
				stream.append(region, None, &i.to_ne_bytes()).unwrap();
			}
			region
		};

		let first = {
			let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
			collect_entries(&stream, region)
		};
		let second = {
			let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
			collect_entries(&stream, region)
		};
		assert_eq!(10, first.len());
		assert_eq!(first, second);
	}

	#[test]
	fn free_while_iterating() {
		let stream = memory_stream();
		let r1 = stream.region_allocate(REGION_SIZE).unwrap();
		let r2 = stream.region_allocate(REGION_SIZE).unwrap();
		let r3 = stream.region_allocate(REGION_SIZE).unwrap();

		let mut iter = stream.region_iter();
		assert_eq!(Some(r1), iter.next());

		stream.region_free(r1).unwrap();
		stream.region_free(r2).unwrap();
		stream.region_free(r3).unwrap();

		let r4 = stream.region_allocate(REGION_SIZE).unwrap();
		stream.region_free(r4).unwrap();

		// Freed spans are still visited by the forward walk.
		assert_eq!(Some(r2.offset), iter.next().map(|r| r.offset()));
		assert_eq!(Some(r4.offset), iter.next().map(|r| r.offset()));
		assert!(iter.next().is_none());
	}

	#[test]
	fn torn_tail_is_dropped_on_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("stream.pms");
		let (region, torn_offset) = {
			let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
			let region = stream.region_allocate(REGION_SIZE).unwrap();
			stream.append(region, None, b"hello").unwrap();
			let torn = stream.append(region, None, b"world").unwrap();

			// Simulate a crash mid-write: flip one payload bit so the
			// stored popcount no longer matches.
			let span = Span::decode(stream.map(), torn.offset()).unwrap();
			let byte = stream.map().slice(span.data_offset() as usize, 1)[0] ^ 0x04;
			stream
				.map()
				.memcpy(span.data_offset() as usize, &[byte], MemFlags::empty());
			(region, torn.offset())
		};

		let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
		assert_eq!(vec![b"hello".to_vec()], collect_entries(&stream, region));

		// The torn slot is reclaimed by the next append.
		let entry = stream.append(region, None, b"again").unwrap();
		assert_eq!(torn_offset, entry.offset());
		assert_eq!(
			vec![b"hello".to_vec(), b"again".to_vec()],
			collect_entries(&stream, region)
		);
	}

	#[test]
	fn zero_length_append_is_enumerable() {
		let stream = memory_stream();
		let region = stream.region_allocate(REGION_SIZE).unwrap();
		stream.append(region, None, b"").unwrap();
		stream.append(region, None, b"x").unwrap();

		let entries = collect_entries(&stream, region);
		assert_eq!(vec![b"".to_vec(), b"x".to_vec()], entries);
	}

	#[test]
	fn append_past_the_region_end_is_out_of_range() {
		let stream = memory_stream();
		let region = stream.region_allocate(BLOCK).unwrap();
		let runtime = stream.region_runtime_initialize(region).unwrap();

		// One entry spanning the whole payload fits exactly.
		let payload = vec![0x5Au8; (BLOCK - ENTRY_HEADER_SIZE) as usize];
		stream.append(region, Some(&runtime), &payload).unwrap();
		assert!(matches!(
			stream.append(region, Some(&runtime), b""),
			Err(StreamError::OutOfRange)
		));
		// The failed append did not damage the region.
		assert_eq!(1, collect_entries(&stream, region).len());
	}

	#[test]
	fn reserve_and_publish() {
		let stream = memory_stream();
		let region = stream.region_allocate(REGION_SIZE).unwrap();

		stream.append(region, None, b"first").unwrap();
		let mut reserved = stream.reserve(region, None, 6).unwrap();
		reserved.data_mut().copy_from_slice(b"second");
		let entry = reserved.entry();
		stream.publish(region, None, b"second", reserved).unwrap();

		assert_eq!(b"second", stream.entry_data(entry).unwrap());
		assert_eq!(
			vec![b"first".to_vec(), b"second".to_vec()],
			collect_entries(&stream, region)
		);
	}

	#[test]
	fn unpublished_reservation_is_reclaimed_on_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("stream.pms");
		let region = {
			let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
			let region = stream.region_allocate(REGION_SIZE).unwrap();
			stream.append(region, None, b"kept").unwrap();
			// Reserved, written, never published.
			let mut reserved = stream.reserve(region, None, 4).unwrap();
			reserved.data_mut().copy_from_slice(b"lost");
			region
		};

		let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
		assert_eq!(vec![b"kept".to_vec()], collect_entries(&stream, region));

		// The hole is the new append point.
		let kept = stream.entry_iter(region).unwrap().next().unwrap();
		let entry = stream.append(region, None, b"reused").unwrap();
		assert_eq!(kept.offset() + entry_footprint(4), entry.offset());
		assert_eq!(
			vec![b"kept".to_vec(), b"reused".to_vec()],
			collect_entries(&stream, region)
		);
	}

	#[test]
	fn entry_iterator_promotes_the_region() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("stream.pms");
		let region = {
			let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
			let region = stream.region_allocate(REGION_SIZE).unwrap();
			stream.append(region, None, b"entry").unwrap();
			region
		};

		let stream = Stream::open_file(&path, BLOCK, 10 << 20).unwrap();
		let runtime = stream.runtime(region).unwrap();
		assert!(!runtime.is_write_ready());

		// Draining the iterator performs the recovery scan.
		assert_eq!(1, collect_entries(&stream, region).len());
		assert!(runtime.is_write_ready());
	}

	#[test]
	fn regions_are_independent() {
		let stream = memory_stream();
		let r1 = stream.region_allocate(REGION_SIZE).unwrap();
		let r2 = stream.region_allocate(REGION_SIZE).unwrap();

		stream.append(r1, None, b"one").unwrap();
		stream.append(r2, None, b"two").unwrap();
		stream.append(r1, None, b"three").unwrap();

		assert_eq!(
			vec![b"one".to_vec(), b"three".to_vec()],
			collect_entries(&stream, r1)
		);
		assert_eq!(vec![b"two".to_vec()], collect_entries(&stream, r2));
	}

	#[test]
	fn append_to_a_freed_region_is_rejected() {
		let stream = memory_stream();
		let region = stream.region_allocate(REGION_SIZE).unwrap();
		stream.region_free(region).unwrap();
		assert!(stream.append(region, None, b"nope").is_err());
		assert!(stream.entry_iter(region).is_err());
	}

	#[test]
	fn runtime_handle_must_match_the_region() {
		let stream = memory_stream();
		let r1 = stream.region_allocate(REGION_SIZE).unwrap();
		let r2 = stream.region_allocate(REGION_SIZE).unwrap();
		let runtime = stream.region_runtime_initialize(r1).unwrap();
		assert!(matches!(
			stream.append(r2, Some(&runtime), b"x"),
			Err(StreamError::InvalidArgument)
		));
	}

	#[test]
	fn block_size_must_match_on_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("stream.pms");
		drop(Stream::open_file(&path, BLOCK, 1 << 20).unwrap());
		assert!(matches!(
			Stream::open_file(&path, 2 * BLOCK, 1 << 20),
			Err(StreamError::BadBlockSize(_))
		));
	}

	#[test]
	fn garbage_media_is_bad_format() {
		let map = AnonMap::new(1 << 20).unwrap();
		map.memcpy(0, b"not a stream at all", MemFlags::empty());
		assert!(matches!(
			Stream::from_map(Box::new(map), BLOCK),
			Err(StreamError::BadFormat)
		));
	}

	#[test]
	fn concurrent_appends_to_one_region() {
		let stream = memory_stream();
		let region = stream.region_allocate(1 << 20).unwrap();
		let runtime = stream.region_runtime_initialize(region).unwrap();

		const THREADS: u64 = 4;
		const PER_THREAD: u64 = 100;
		std::thread::scope(|scope| {
			for t in 0..THREADS {
				let stream = &stream;
				let runtime = &runtime;
				scope.spawn(move || {
					for i in 0..PER_THREAD {
						let payload = (t * PER_THREAD + i).to_ne_bytes();
						stream.append(region, Some(runtime), &payload).unwrap();
					}
				});
			}
		});

		let mut seen: Vec<u64> = collect_entries(&stream, region)
			.into_iter()
			.map(|bytes| u64::from_ne_bytes(bytes.try_into().unwrap()))
			.collect();
		seen.sort_unstable();
		let expected: Vec<u64> = (0..THREADS * PER_THREAD).collect();
		assert_eq!(expected, seen);
	}

	#[test]
	fn randomized_roundtrip() {
		let mut rng = StdRng::seed_from_u64(0xF00D);
		let stream = memory_stream();
		let region = stream.region_allocate(1 << 20).unwrap();

		let payloads: Vec<Vec<u8>> = (0..50)
			.map(|_| {
				let len = rng.gen_range(0..512);
				(0..len).map(|_| rng.gen()).collect()
			})
			.collect();
		for payload in &payloads {
			stream.append(region, None, payload).unwrap();
		}
		assert_eq!(payloads, collect_entries(&stream, region));
	}
}
