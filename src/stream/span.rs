use crate::{
	mem::{
		align_up, is_span_aligned,
		map::MapBackend,
		memcpy::pmem_memcpy,
		popcount_memory, SPAN_ALIGN,
	},
	StreamError, StreamResult,
};

/// Size of the packed span header word.
pub const SPAN_HEADER_SIZE: u64 = 8;
/// An entry stores its popcount word right after the header.
pub const ENTRY_HEADER_SIZE: u64 = SPAN_HEADER_SIZE + 8;

/// Span header layout.
/// |size:61|is_free:1|type:2|
const TYPE_MASK: u64 = 0b11;
const FREE_BIT: u64 = 0b100;
const SIZE_SHIFT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanType {
	/// Rest of the block is empty. An all-zero header (uninitialized
	/// media) decodes as this, which is exactly the tail marker the
	/// recovery scan expects.
	Empty,
	Entry,
	Region,
}

impl SpanType {
	const fn from_bits(bits: u64) -> Option<Self> {
		match bits {
			0 => Some(SpanType::Empty),
			1 => Some(SpanType::Entry),
			2 => Some(SpanType::Region),
			// 0b11 is reserved; walkers treat the decode failure as a
			// sequence terminator.
			_ => None,
		}
	}

	const fn bits(self) -> u64 {
		match self {
			SpanType::Empty => 0,
			SpanType::Entry => 1,
			SpanType::Region => 2,
		}
	}
}

/// A decoded view of one on-media span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
	pub offset: u64,
	pub span_type: SpanType,
	/// Payload size in bytes. Block-aligned for regions; zero for empty
	/// spans.
	pub size: u64,
	/// Free-list membership. Only meaningful for region spans.
	pub is_free: bool,
}

impl Span {
	/// Decodes the span header at `offset`.
	/// The offset must be span-aligned and inside the mapping.
	pub fn decode(map: &dyn MapBackend, offset: u64) -> StreamResult<Self> {
		if !is_span_aligned(offset) || offset + SPAN_HEADER_SIZE > map.len() as u64 {
			return Err(StreamError::InvalidArgument);
		}
		let header = map.read_u64(offset as usize);
		let span_type =
			SpanType::from_bits(header & TYPE_MASK).ok_or(StreamError::InvalidArgument)?;
		Ok(Self {
			offset,
			span_type,
			size: header >> SIZE_SHIFT,
			is_free: (header & FREE_BIT) != 0,
		})
	}

	/// Writes a span header at `offset` through the persistent memcpy
	/// path and returns the decoded view of what was written.
	pub fn write(
		map: &dyn MapBackend,
		offset: u64,
		span_type: SpanType,
		size: u64,
		is_free: bool,
	) -> StreamResult<Self> {
		if !is_span_aligned(offset) || offset + SPAN_HEADER_SIZE > map.len() as u64 {
			return Err(StreamError::InvalidArgument);
		}
		let header = header_word(span_type, size, is_free);
		pmem_memcpy(map, offset, &[bytemuck::bytes_of(&header)]);
		Ok(Self {
			offset,
			span_type,
			size,
			is_free,
		})
	}

	/// The number of bytes this span occupies, header included.
	/// The next span in the sequence begins at `offset + footprint`.
	pub fn footprint(&self) -> u64 {
		match self.span_type {
			SpanType::Empty => SPAN_ALIGN,
			SpanType::Entry => entry_footprint(self.size),
			SpanType::Region => align_up(SPAN_HEADER_SIZE + self.size, SPAN_ALIGN),
		}
	}

	/// Offset one past the last byte of this span.
	pub fn end(&self) -> u64 {
		self.offset + self.footprint()
	}

	/// Where this span's data begins. For a region span that is the
	/// entry area, which starts at the first span-aligned offset past
	/// the header.
	pub fn data_offset(&self) -> u64 {
		match self.span_type {
			SpanType::Empty => self.offset + SPAN_HEADER_SIZE,
			SpanType::Entry => self.offset + ENTRY_HEADER_SIZE,
			SpanType::Region => self.offset + SPAN_ALIGN,
		}
	}
}

const fn header_word(span_type: SpanType, size: u64, is_free: bool) -> u64 {
	let free = if is_free { FREE_BIT } else { 0 };
	(size << SIZE_SHIFT) | free | span_type.bits()
}

/// Total footprint of an entry span holding `size` payload bytes.
pub const fn entry_footprint(size: u64) -> u64 {
	align_up(ENTRY_HEADER_SIZE + size, SPAN_ALIGN)
}

/// Persists a complete entry span (header, popcount, payload) at
/// `offset` with a single drain.
pub fn entry_write(map: &dyn MapBackend, offset: u64, data: &[u8]) {
	let header = header_word(SpanType::Entry, data.len() as u64, false);
	let popcount = popcount_memory(data);
	pmem_memcpy(
		map,
		offset,
		&[bytemuck::bytes_of(&header), bytemuck::bytes_of(&popcount), data],
	);
}

/// Persists the header and popcount of an already-written payload at
/// `offset` with a single drain. The reserve/publish path writes the
/// payload bytes directly into the mapping beforehand.
pub fn entry_publish(map: &dyn MapBackend, offset: u64, data: &[u8]) {
	let header = header_word(SpanType::Entry, data.len() as u64, false);
	let popcount = popcount_memory(data);
	pmem_memcpy(
		map,
		offset,
		&[bytemuck::bytes_of(&header), bytemuck::bytes_of(&popcount)],
	);
}

/// The popcount word stored with an entry span.
pub fn entry_stored_popcount(map: &dyn MapBackend, span: &Span) -> u64 {
	debug_assert_eq!(SpanType::Entry, span.span_type);
	map.read_u64((span.offset + SPAN_HEADER_SIZE) as usize)
}

/// Recomputes the payload popcount and compares it against the stored
/// word. A mismatch marks the entry as torn.
pub fn entry_check_consistency(map: &dyn MapBackend, span: &Span) -> bool {
	debug_assert_eq!(SpanType::Entry, span.span_type);
	let payload_offset = span.offset + ENTRY_HEADER_SIZE;
	if payload_offset + span.size > map.len() as u64 {
		return false;
	}
	let payload = map.slice(payload_offset as usize, span.size as usize);
	entry_stored_popcount(map, span) == popcount_memory(payload)
}
