use log::debug;
use parking_lot::Mutex;

use crate::{
	mem::{
		align_up,
		map::{MapBackend, MemFlags},
		SPAN_ALIGN,
	},
	stream::{
		region::Region,
		span::{Span, SpanType, SPAN_HEADER_SIZE},
	},
	StreamError, StreamResult,
};

/// Volatile allocator state, rebuilt from the media on open.
/// The media is the source of truth; this mirrors it for cheap reuse
/// decisions, the way a sector manager mirrors a sector table.
struct AllocatorState {
	/// Offsets of free region spans, most recently freed last.
	free_spans: Vec<u64>,
	/// Where the span sequence currently ends; new regions are
	/// appended here.
	tail: u64,
}

/// On-media region allocator.
///
/// Both lists it manages (allocated regions and the free list) are
/// threaded through the REGION span headers and enumerated by forward
/// span-walk; the mutex-guarded state above is only a volatile mirror.
/// Reuse pops the most recently freed span that fits, so a region freed
/// moments ago is the first to come back.
pub(crate) struct RegionAllocator {
	first_region: u64,
	block_size: u64,
	state: Mutex<AllocatorState>,
}

impl RegionAllocator {
	/// Walks the span sequence to rebuild the free list and find the
	/// tail.
	pub fn open(map: &dyn MapBackend, first_region: u64, block_size: u64) -> Self {
		let map_len = map.len() as u64;
		let mut free_spans = Vec::new();
		let mut tail = first_region;
		while tail + SPAN_HEADER_SIZE <= map_len {
			let span = match Span::decode(map, tail) {
				Ok(span) if span.span_type == SpanType::Region => span,
				// Empty (or undecodable) terminates the sequence.
				_ => break,
			};
			if span.is_free {
				free_spans.push(span.offset);
			}
			tail = span.end();
		}
		debug!(
			"allocator: {} free spans, tail at {:#x}",
			free_spans.len(),
			tail
		);
		Self {
			first_region,
			block_size,
			state: Mutex::new(AllocatorState { free_spans, tail }),
		}
	}

	/// Allocates a region of at least `size` payload bytes, rounded up
	/// to the block size. Reuses the most recently freed span that
	/// fits, splitting off the remainder when it can hold another span;
	/// otherwise grows the span sequence at its tail.
	pub fn allocate(&self, map: &dyn MapBackend, size: u64) -> StreamResult<Region> {
		let map_len = map.len() as u64;
		if size == 0 {
			return Err(StreamError::InvalidArgument);
		}
		if size > map_len {
			return Err(StreamError::OutOfSpace);
		}
		let need = align_up(size, self.block_size);

		let mut state = self.state.lock();
		let hit = state
			.free_spans
			.iter()
			.rposition(|&offset| match Span::decode(map, offset) {
				Ok(span) => span.size >= need,
				Err(_) => false,
			});
		if let Some(index) = hit {
			let offset = state.free_spans.remove(index);
			let span = Span::decode(map, offset)?;
			return self.reuse(map, &mut state, span, need);
		}

		// No free span fits; append past the tail.
		let tail = state.tail;
		if map_len - tail >= SPAN_ALIGN && map_len - tail - SPAN_ALIGN >= need {
			let span = Span::write(map, tail, SpanType::Region, need, false)?;
			state.tail = span.end();
			debug!("region {:#x}: allocated {} bytes at tail", tail, need);
			return Ok(Region { offset: tail });
		}
		Err(StreamError::OutOfSpace)
	}

	/// Marks the span free and remembers it for reuse. The offset must
	/// name a region span that is currently on the allocated list.
	pub fn free(&self, map: &dyn MapBackend, region: Region) -> StreamResult<()> {
		let mut state = self.state.lock();
		let span = self
			.find_region(map, &state, region.offset)
			.ok_or(StreamError::InvalidArgument)?;
		if span.is_free {
			return Err(StreamError::InvalidArgument);
		}
		Span::write(map, span.offset, SpanType::Region, span.size, true)?;
		state.free_spans.push(span.offset);
		debug!("region {:#x}: freed {} bytes", span.offset, span.size);
		Ok(())
	}

	/// Takes over a free span for `need` payload bytes.
	fn reuse(
		&self,
		map: &dyn MapBackend,
		state: &mut AllocatorState,
		span: Span,
		need: u64,
	) -> StreamResult<Region> {
		// Zero the entry area first so the recycled region recovers as
		// empty even if the headers below never land.
		let data_offset = span.offset + SPAN_ALIGN;
		map.memset(data_offset as usize, 0, need as usize, MemFlags::empty());

		let remainder = span.size - need;
		if remainder >= SPAN_ALIGN {
			// Split. The tail of the old span becomes a smaller free
			// span, written before the reused header so every
			// intermediate media state parses.
			let tail_offset = data_offset + need;
			Span::write(
				map,
				tail_offset,
				SpanType::Region,
				remainder - SPAN_ALIGN,
				true,
			)?;
			Span::write(map, span.offset, SpanType::Region, need, false)?;
			state.free_spans.push(tail_offset);
			debug!(
				"region {:#x}: reused {} bytes, split {} to free list",
				span.offset,
				need,
				remainder - SPAN_ALIGN
			);
		} else {
			// The leftover cannot hold a span header; keep it attached.
			Span::write(map, span.offset, SpanType::Region, span.size, false)?;
			debug!("region {:#x}: reused {} bytes", span.offset, span.size);
		}
		Ok(Region {
			offset: span.offset,
		})
	}

	/// Walks the span sequence looking for a region span starting at
	/// exactly `offset`.
	fn find_region(&self, map: &dyn MapBackend, state: &AllocatorState, offset: u64) -> Option<Span> {
		let mut current = self.first_region;
		while current < state.tail {
			let span = match Span::decode(map, current) {
				Ok(span) if span.span_type == SpanType::Region => span,
				_ => return None,
			};
			if span.offset == offset {
				return Some(span);
			}
			if span.offset > offset {
				return None;
			}
			current = span.end();
		}
		None
	}
}
