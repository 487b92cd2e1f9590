use std::{
	fs::{File, OpenOptions},
	path::Path,
	ptr,
	slice,
	sync::atomic::{fence, Ordering},
};

use bitflags::bitflags;
use memmap2::MmapMut;

use crate::StreamResult;

bitflags! {
	/// Flags accepted by [MapBackend::memcpy] and [MapBackend::memset].
	pub struct MemFlags: u32 {
		/// Request write-combining non-temporal stores.
		/// Backends without such stores treat this as a hint.
		const NONTEMPORAL = 0b01;
		/// Do not make the write durable before returning.
		/// The caller takes responsibility for a later drain.
		const NODRAIN = 0b10;
	}
}

/// A byte-addressable persistent mapping.
///
/// The contract mirrors the one the stream core is written against:
/// a write issued through [memcpy](MapBackend::memcpy) without
/// [MemFlags::NODRAIN] is durable when the call returns, and a write
/// issued with `NODRAIN` is durable after a subsequent
/// [drain](MapBackend::drain).
pub trait MapBackend: Send + Sync {
	fn len(&self) -> usize;
	fn as_ptr(&self) -> *const u8;
	fn as_mut_ptr(&self) -> *mut u8;

	/// Queues a flush of the given range. Durability requires a drain.
	fn flush(&self, offset: usize, len: usize);

	/// Waits until all previously flushed or non-temporal stores are
	/// durable.
	fn drain(&self);

	fn memcpy(&self, offset: usize, src: &[u8], flags: MemFlags) {
		debug_assert!(offset + src.len() <= self.len());
		unsafe {
			ptr::copy_nonoverlapping(src.as_ptr(), self.as_mut_ptr().add(offset), src.len());
		}
		if !flags.contains(MemFlags::NODRAIN) {
			self.persist(offset, src.len());
		}
	}

	fn memset(&self, offset: usize, value: u8, len: usize, flags: MemFlags) {
		debug_assert!(offset + len <= self.len());
		unsafe {
			ptr::write_bytes(self.as_mut_ptr().add(offset), value, len);
		}
		if !flags.contains(MemFlags::NODRAIN) {
			self.persist(offset, len);
		}
	}

	/// Flush and drain in one step.
	fn persist(&self, offset: usize, len: usize) {
		self.flush(offset, len);
		self.drain();
	}

	fn slice(&self, offset: usize, len: usize) -> &[u8] {
		debug_assert!(offset + len <= self.len());
		unsafe { slice::from_raw_parts(self.as_ptr().add(offset), len) }
	}

	/// Reads an aligned `u64` from the mapping.
	/// Span headers are read through this so that concurrent header
	/// stores are observed whole.
	fn read_u64(&self, offset: usize) -> u64 {
		debug_assert!(offset % 8 == 0 && offset + 8 <= self.len());
		unsafe { ptr::read_volatile(self.as_ptr().add(offset) as *const u64) }
	}
}

/// A file-backed mapping.
///
/// The file is created (or grown) to the requested size on open. There is
/// no non-temporal store path through a shared file mapping, so `drain`
/// falls back to a synchronous msync of the mapping, which is the
/// strongest durability point the OS offers here.
pub struct FileMap {
	mmap: MmapMut,
	ptr: *mut u8,
	len: usize,
	// Held so the descriptor outlives the mapping.
	_file: File,
}

unsafe impl Send for FileMap {}
unsafe impl Sync for FileMap {}

impl FileMap {
	/// Opens or creates the file at `path` and maps it.
	/// An existing file is grown to `size` bytes if it is smaller;
	/// new bytes read as zero.
	pub fn open<P: AsRef<Path>>(path: P, size: u64) -> StreamResult<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(path.as_ref())?;
		if file.metadata()?.len() < size {
			file.set_len(size)?;
		}
		let mut mmap = unsafe { MmapMut::map_mut(&file)? };
		let ptr = mmap.as_mut_ptr();
		let len = mmap.len();
		Ok(Self {
			mmap,
			ptr,
			len,
			_file: file,
		})
	}
}

impl MapBackend for FileMap {
	fn len(&self) -> usize {
		self.len
	}

	fn as_ptr(&self) -> *const u8 {
		self.ptr
	}

	fn as_mut_ptr(&self) -> *mut u8 {
		self.ptr
	}

	fn flush(&self, offset: usize, len: usize) {
		// Errors here mean the device is gone; nothing sane to do
		// mid-copy, the next drain or close will surface it.
		let _ = self.mmap.flush_async_range(offset, len);
	}

	fn drain(&self) {
		let _ = self.mmap.flush();
	}
}

/// An anonymous mapping.
///
/// Volatile; useful for staging, benchmarks and tests. `drain` is a
/// store fence so the ordering contract still holds within the process.
pub struct AnonMap {
	ptr: *mut u8,
	len: usize,
	// Held so the mapping outlives the pointer.
	_mmap: MmapMut,
}

unsafe impl Send for AnonMap {}
unsafe impl Sync for AnonMap {}

impl AnonMap {
	pub fn new(size: usize) -> StreamResult<Self> {
		let mut mmap = MmapMut::map_anon(size)?;
		let ptr = mmap.as_mut_ptr();
		let len = mmap.len();
		Ok(Self {
			ptr,
			len,
			_mmap: mmap,
		})
	}
}

impl MapBackend for AnonMap {
	fn len(&self) -> usize {
		self.len
	}

	fn as_ptr(&self) -> *const u8 {
		self.ptr
	}

	fn as_mut_ptr(&self) -> *mut u8 {
		self.ptr
	}

	fn flush(&self, _offset: usize, _len: usize) {}

	fn drain(&self) {
		fence(Ordering::SeqCst);
	}
}
