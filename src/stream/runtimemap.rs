use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
	mem::map::MapBackend,
	stream::{
		region::{Region, RegionRuntime},
		span::{Span, SpanType},
	},
	StreamError, StreamResult,
};

/// Keyed cache of per-region volatile state.
///
/// An ordered map under a reader-writer lock: lookups take the shared
/// lock, and the rare insert (once per region first-use) takes the
/// exclusive lock and re-checks.
pub(crate) struct RegionRuntimeMap {
	runtimes: RwLock<BTreeMap<u64, Arc<RegionRuntime>>>,
}

impl RegionRuntimeMap {
	pub fn new() -> Self {
		Self {
			runtimes: RwLock::new(BTreeMap::new()),
		}
	}

	/// Looks up the runtime for `region`, constructing it in the
	/// read-ready state on first use. The handle stays valid until the
	/// region is freed or the stream goes away.
	pub fn get_or_create(
		&self,
		map: &dyn MapBackend,
		region: Region,
	) -> StreamResult<Arc<RegionRuntime>> {
		if let Some(runtime) = self.runtimes.read().get(&region.offset) {
			return Ok(runtime.clone());
		}
		// Validate the handle against the media before constructing
		// state for it; a bogus or freed offset is a caller error.
		let span = Span::decode(map, region.offset)?;
		if span.span_type != SpanType::Region || span.is_free {
			return Err(StreamError::InvalidArgument);
		}
		let mut runtimes = self.runtimes.write();
		let runtime = runtimes.entry(region.offset).or_insert_with(|| {
			Arc::new(RegionRuntime::new(
				region,
				span.data_offset(),
				span.data_offset() + span.size,
			))
		});
		Ok(runtime.clone())
	}

	/// Drops the runtime of a freed region.
	pub fn remove(&self, region: Region) {
		self.runtimes.write().remove(&region.offset);
	}
}
