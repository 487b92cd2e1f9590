use byteorder::{ByteOrder, NativeEndian};

use crate::{
	mem::{is_span_aligned, map::MapBackend, memcpy::pmem_memcpy, SPAN_ALIGN},
	StreamError, StreamResult,
};

pub const STREAM_MAGIC: [u8; 8] = *b"PMEMSTRM";
pub const STREAM_VERSION: u32 = 1;

/// Packed size of the metadata header at offset 0.
/// magic[8] | version u32 | block_size u32 | first_region u64
pub const HEADER_SIZE: usize = 24;

/// The stream metadata header.
/// Field values are in host byte order; the format is not portable
/// across endianness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
	pub block_size: u64,
	pub first_region: u64,
}

impl StreamHeader {
	pub fn new(block_size: u64) -> Self {
		Self {
			block_size,
			first_region: SPAN_ALIGN,
		}
	}

	/// Checks the block-size rules: a power of two, at least one span
	/// alignment unit, and representable in the header's u32 field.
	pub fn validate_block_size(block_size: u64) -> StreamResult<()> {
		if !block_size.is_power_of_two()
			|| block_size < SPAN_ALIGN
			|| block_size > u32::MAX as u64
		{
			return Err(StreamError::BadBlockSize(block_size));
		}
		Ok(())
	}

	/// Reads the header from offset 0.
	/// Returns `None` for all-zero media (a stream that was never
	/// formatted), `BadFormat` for anything else that fails to
	/// validate.
	pub fn read_from(map: &dyn MapBackend) -> StreamResult<Option<Self>> {
		if map.len() < HEADER_SIZE {
			return Err(StreamError::InvalidArgument);
		}
		let raw = map.slice(0, HEADER_SIZE);
		if raw.iter().all(|&b| b == 0) {
			return Ok(None);
		}
		if raw[0..8] != STREAM_MAGIC {
			return Err(StreamError::BadFormat);
		}
		if NativeEndian::read_u32(&raw[8..12]) != STREAM_VERSION {
			return Err(StreamError::BadFormat);
		}
		let block_size = NativeEndian::read_u32(&raw[12..16]) as u64;
		let first_region = NativeEndian::read_u64(&raw[16..24]);
		Self::validate_block_size(block_size)?;
		if !is_span_aligned(first_region) || first_region >= map.len() as u64 {
			return Err(StreamError::BadFormat);
		}
		Ok(Some(Self {
			block_size,
			first_region,
		}))
	}

	/// Persists the header at offset 0 with a single drain.
	pub fn write_to(&self, map: &dyn MapBackend) -> StreamResult<()> {
		Self::validate_block_size(self.block_size)?;
		let mut raw = [0u8; HEADER_SIZE];
		raw[0..8].copy_from_slice(&STREAM_MAGIC);
		NativeEndian::write_u32(&mut raw[8..12], STREAM_VERSION);
		NativeEndian::write_u32(&mut raw[12..16], self.block_size as u32);
		NativeEndian::write_u64(&mut raw[16..24], self.first_region);
		pmem_memcpy(map, 0, &[&raw]);
		Ok(())
	}
}
