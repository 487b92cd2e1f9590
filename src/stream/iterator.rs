use std::sync::Arc;

use crate::{
	stream::{
		region::{valid_entry_at, Entry, Region, RegionRuntime, RuntimeState},
		span::{Span, SpanType, SPAN_HEADER_SIZE},
		stream::Stream,
	},
	StreamResult,
};

/// Forward cursor over the stream's region spans.
///
/// Every region span is visited, freed ones included; the walk
/// terminates at the first span that is not a region. Concurrent
/// allocation and freeing may be observed by a live cursor.
pub struct RegionIter<'s> {
	stream: &'s Stream,
	offset: u64,
}

impl<'s> RegionIter<'s> {
	pub(crate) fn new(stream: &'s Stream) -> Self {
		Self {
			stream,
			offset: stream.first_region(),
		}
	}
}

impl<'s> Iterator for RegionIter<'s> {
	type Item = Region;

	fn next(&mut self) -> Option<Region> {
		let map = self.stream.map();
		if self.offset + SPAN_HEADER_SIZE > map.len() as u64 {
			return None;
		}
		let span = Span::decode(map, self.offset).ok()?;
		if span.span_type != SpanType::Region {
			return None;
		}
		self.offset = span.end();
		Some(Region {
			offset: span.offset,
		})
	}
}

/// Cursor over the entries of one region.
///
/// In the write-ready state entries strictly below the committed offset
/// are yielded without re-verification. Before that, each entry is
/// verified by its popcount, and reaching the tail of the scan promotes
/// the region to write-ready so a later writer picks up the append
/// point without rescanning.
pub struct EntryIter<'s> {
	stream: &'s Stream,
	runtime: Arc<RegionRuntime>,
	offset: u64,
}

impl<'s> EntryIter<'s> {
	pub(crate) fn new(stream: &'s Stream, region: Region) -> StreamResult<Self> {
		let runtime = stream.runtime(region)?;
		let offset = runtime.first_entry();
		Ok(Self {
			stream,
			runtime,
			offset,
		})
	}

	/// The region this cursor walks.
	pub fn region(&self) -> Region {
		self.runtime.region()
	}
}

impl<'s> Iterator for EntryIter<'s> {
	type Item = Entry;

	fn next(&mut self) -> Option<Entry> {
		let map = self.stream.map();
		match self.runtime.state() {
			RuntimeState::WriteReady => {
				if self.offset >= self.runtime.committed_offset() {
					return None;
				}
				let span = Span::decode(map, self.offset).ok()?;
				if span.span_type != SpanType::Entry {
					// A hole left by an unpublished reservation; the
					// entries past it become visible once it resolves.
					return None;
				}
				self.offset = span.end();
				Some(Entry {
					offset: span.offset,
				})
			}
			RuntimeState::ReadReady => match valid_entry_at(map, self.offset, self.runtime.end()) {
				Some(span) => {
					self.offset = span.end();
					Some(Entry {
						offset: span.offset,
					})
				}
				None => {
					// Scanned tail reached: empty span, torn entry or
					// the end of the entry area.
					self.runtime.initialize_for_write(map);
					None
				}
			},
		}
	}
}
