use super::{
	align_up,
	map::{MapBackend, MemFlags},
	CACHELINE_SIZE, SPAN_ALIGN,
};

/// Copies the concatenation of `fragments` to `dest_offset` in the
/// mapping, leaving the bytes durable on return.
///
/// The destination is aligned to a cache line, whole cache lines are
/// streamed with non-temporal stores, and unaligned head/tail runs are
/// coalesced through a one-cache-line staging buffer so that partial
/// lines are stored at most once. Exactly one drain is issued per call,
/// carried by the final store.
pub fn pmem_memcpy(map: &dyn MapBackend, dest_offset: u64, fragments: &[&[u8]]) {
	let mut staging = [0u8; CACHELINE_SIZE];
	let mut staged = 0usize;
	let mut dest = dest_offset as usize;
	let nodrain = MemFlags::NONTEMPORAL | MemFlags::NODRAIN;

	for fragment in fragments {
		let mut src = *fragment;
		if src.is_empty() {
			continue;
		}

		// Align the destination with the cache line. Only the first
		// stored run can be misaligned; every later store advances the
		// destination by whole cache lines.
		let misalignment = align_up(dest as u64, SPAN_ALIGN) as usize - dest;
		if misalignment > 0 {
			let take = misalignment.min(src.len());
			map.memcpy(dest, &src[..take], nodrain);
			dest += take;
			if src.len() <= misalignment {
				continue;
			}
			src = &src[take..];
		}
		debug_assert_eq!(0, dest % CACHELINE_SIZE);

		// Split the fragment. The head tops up the staging buffer, the
		// body is a whole number of cache lines, the tail begins the
		// next staging fill.
		let free = CACHELINE_SIZE - staged;
		let head = if staged == 0 {
			0
		} else if free >= src.len() {
			src.len()
		} else {
			free
		};
		let tail = (src.len() - head) % CACHELINE_SIZE;
		let body = src.len() - head - tail;

		if head > 0 {
			staging[staged..staged + head].copy_from_slice(&src[..head]);
			staged += head;
		}
		debug_assert!(staged <= CACHELINE_SIZE);
		if staged == CACHELINE_SIZE {
			map.memcpy(dest, &staging, nodrain);
			dest += CACHELINE_SIZE;
			staged = 0;
		}
		if body > 0 {
			map.memcpy(dest, &src[head..head + body], nodrain);
			dest += body;
		}
		if tail > 0 {
			staging[staged..staged + tail].copy_from_slice(&src[head + body..]);
			staged += tail;
		}
	}

	// The final store carries the drain so the whole copy is durable on
	// return. With nothing left in staging the drain is issued bare.
	if staged > 0 {
		map.memcpy(dest, &staging[..staged], MemFlags::NONTEMPORAL);
	} else {
		map.drain();
	}
}
