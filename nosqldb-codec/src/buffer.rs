// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A growable byte buffer with amortized-growth capacity and a process-wide
//! free list pooling them across requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{ReadError, ReadResult};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// An owned, growable byte region with logical `length <= capacity`.
///
/// The exposed byte span is always `[0, length)`; bytes beyond `length` but
/// within `capacity` are uninitialized garbage from the caller's point of
/// view and must never be read.
#[derive(Debug, Default)]
pub struct ResizableBuffer {
	bytes: Vec<u8>,
	length: usize,
	id: u64,
}

impl ResizableBuffer {
	#[must_use]
	pub fn new() -> Self {
		Self {
			bytes: Vec::new(),
			length: 0,
			id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
		}
	}

	#[must_use]
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			bytes: vec![0u8; capacity],
			length: 0,
			id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
		}
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.length
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.length == 0
	}

	#[must_use]
	pub fn capacity(&self) -> usize {
		self.bytes.len()
	}

	/// Reset the logical length to zero without releasing allocated capacity.
	pub fn clear(&mut self) {
		self.length = 0;
	}

	#[must_use]
	pub fn as_slice(&self) -> &[u8] {
		&self.bytes[..self.length]
	}

	/// Returns the `[start, end)` byte span, bounds-checked against `length`.
	pub fn slice(&self, start: usize, end: usize) -> ReadResult<&[u8]> {
		if end > self.length || start > end {
			return Err(ReadError::EndOfInput {
				offset: start,
				width: end.saturating_sub(start),
				length: self.length,
			});
		}
		Ok(&self.bytes[start..end])
	}

	/// Growth policy: new capacity = `max(2*capacity, required)`.
	pub fn ensure_extra_capacity(&mut self, extra: usize) {
		let required = self.length + extra;
		self.ensure_capacity(required);
	}

	fn ensure_capacity(&mut self, required: usize) {
		if required > self.bytes.len() {
			let new_capacity = std::cmp::max(self.bytes.len() * 2, required);
			self.bytes.resize(new_capacity, 0);
		}
	}

	fn extend_length(&mut self, end: usize) {
		self.ensure_capacity(end);
		if end > self.length {
			self.length = end;
		}
	}

	fn check_bounds(&self, offset: usize, width: usize) -> ReadResult<()> {
		if offset + width > self.length {
			return Err(ReadError::EndOfInput {
				offset,
				width,
				length: self.length,
			});
		}
		Ok(())
	}

	pub fn read_u8(&self, offset: usize) -> ReadResult<u8> {
		self.check_bounds(offset, 1)?;
		Ok(self.bytes[offset])
	}

	pub fn read_i8(&self, offset: usize) -> ReadResult<i8> {
		Ok(self.read_u8(offset)? as i8)
	}

	pub fn read_u16_be(&self, offset: usize) -> ReadResult<u16> {
		self.check_bounds(offset, 2)?;
		let b = &self.bytes[offset..offset + 2];
		Ok(u16::from_be_bytes([b[0], b[1]]))
	}

	pub fn read_i16_be(&self, offset: usize) -> ReadResult<i16> {
		Ok(self.read_u16_be(offset)? as i16)
	}

	pub fn read_u32_be(&self, offset: usize) -> ReadResult<u32> {
		self.check_bounds(offset, 4)?;
		let b = &self.bytes[offset..offset + 4];
		Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
	}

	pub fn read_i32_be(&self, offset: usize) -> ReadResult<i32> {
		Ok(self.read_u32_be(offset)? as i32)
	}

	pub fn read_u64_be(&self, offset: usize) -> ReadResult<u64> {
		self.check_bounds(offset, 8)?;
		let mut arr = [0u8; 8];
		arr.copy_from_slice(&self.bytes[offset..offset + 8]);
		Ok(u64::from_be_bytes(arr))
	}

	pub fn read_i64_be(&self, offset: usize) -> ReadResult<i64> {
		Ok(self.read_u64_be(offset)? as i64)
	}

	pub fn read_f64_be(&self, offset: usize) -> ReadResult<f64> {
		Ok(f64::from_bits(self.read_u64_be(offset)?))
	}

	pub fn write_u8(&mut self, value: u8, offset: usize) -> usize {
		self.extend_length(offset + 1);
		self.bytes[offset] = value;
		offset + 1
	}

	pub fn write_i8(&mut self, value: i8, offset: usize) -> usize {
		self.write_u8(value as u8, offset)
	}

	pub fn write_u16_be(&mut self, value: u16, offset: usize) -> usize {
		let end = offset + 2;
		self.extend_length(end);
		self.bytes[offset..end].copy_from_slice(&value.to_be_bytes());
		end
	}

	pub fn write_i16_be(&mut self, value: i16, offset: usize) -> usize {
		self.write_u16_be(value as u16, offset)
	}

	pub fn write_u32_be(&mut self, value: u32, offset: usize) -> usize {
		let end = offset + 4;
		self.extend_length(end);
		self.bytes[offset..end].copy_from_slice(&value.to_be_bytes());
		end
	}

	pub fn write_i32_be(&mut self, value: i32, offset: usize) -> usize {
		self.write_u32_be(value as u32, offset)
	}

	pub fn write_u64_be(&mut self, value: u64, offset: usize) -> usize {
		let end = offset + 8;
		self.extend_length(end);
		self.bytes[offset..end].copy_from_slice(&value.to_be_bytes());
		end
	}

	pub fn write_i64_be(&mut self, value: i64, offset: usize) -> usize {
		self.write_u64_be(value as u64, offset)
	}

	pub fn write_f64_be(&mut self, value: f64, offset: usize) -> usize {
		self.write_u64_be(value.to_bits(), offset)
	}

	/// Appends `src` at the current logical end and returns the offset it
	/// was written at.
	pub fn append_bytes(&mut self, src: &[u8]) -> usize {
		let start = self.length;
		let end = start + src.len();
		self.extend_length(end);
		self.bytes[start..end].copy_from_slice(src);
		start
	}

	/// Overwrites `src` at `offset`, extending `length` as needed. Used to
	/// back-patch length-prefix headers written earlier (NSON map/array
	/// byte-length and element-count fields).
	pub fn write_bytes_at(&mut self, src: &[u8], offset: usize) {
		let end = offset + src.len();
		self.extend_length(end);
		self.bytes[offset..end].copy_from_slice(src);
	}
}

/// A process-wide free list of [`ResizableBuffer`]s.
///
/// A buffer is either owned by exactly one in-flight request or present in
/// the free list; a double-release or use of a buffer not returned by
/// [`acquire`](Self::acquire) is a programming error, caught with a debug
/// assertion rather than paid for in release builds.
pub struct BufferPool {
	free: Mutex<Vec<ResizableBuffer>>,
	#[cfg(debug_assertions)]
	checked_out: Mutex<std::collections::HashSet<u64>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
	pub free_count: usize,
}

impl Default for BufferPool {
	fn default() -> Self {
		Self::new()
	}
}

impl BufferPool {
	#[must_use]
	pub fn new() -> Self {
		Self {
			free: Mutex::new(Vec::new()),
			#[cfg(debug_assertions)]
			checked_out: Mutex::new(std::collections::HashSet::new()),
		}
	}

	/// Returns an empty buffer, reusing a released one if the free list is
	/// non-empty.
	pub fn acquire(&self) -> ResizableBuffer {
		let mut buf = self
			.free
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.pop()
			.unwrap_or_default();
		buf.clear();

		#[cfg(debug_assertions)]
		{
			let inserted = self
				.checked_out
				.lock()
				.unwrap_or_else(std::sync::PoisonError::into_inner)
				.insert(buf.id);
			debug_assert!(inserted, "buffer {} acquired while already checked out", buf.id);
		}

		buf
	}

	/// Marks `buf` as available for a future [`acquire`](Self::acquire).
	pub fn release(&self, buf: ResizableBuffer) {
		#[cfg(debug_assertions)]
		{
			let removed = self
				.checked_out
				.lock()
				.unwrap_or_else(std::sync::PoisonError::into_inner)
				.remove(&buf.id);
			debug_assert!(removed, "buffer {} released twice or not owned by this pool", buf.id);
		}

		self.free
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.push(buf);
	}

	#[must_use]
	pub fn stats(&self) -> PoolStats {
		PoolStats {
			free_count: self
				.free
				.lock()
				.unwrap_or_else(std::sync::PoisonError::into_inner)
				.len(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn growth_extends_length_to_offset_plus_width() {
		let mut buf = ResizableBuffer::new();
		let prev_len = buf.len();
		buf.write_u32_be(0xdead_beef, 10);
		assert_eq!(buf.len(), std::cmp::max(prev_len, 14));
		assert!(buf.capacity() >= 14);
	}

	#[test]
	fn slice_round_trips_written_bytes() {
		let mut buf = ResizableBuffer::new();
		buf.append_bytes(b"hello");
		buf.append_bytes(b" world");
		assert_eq!(buf.slice(0, buf.len()).unwrap(), b"hello world");
	}

	#[test]
	fn read_past_length_is_end_of_input() {
		let mut buf = ResizableBuffer::new();
		buf.append_bytes(b"ab");
		assert!(buf.read_u32_be(0).is_err());
	}

	#[test]
	fn capacity_doubles_or_jumps_to_required() {
		let mut buf = ResizableBuffer::with_capacity(4);
		buf.write_u8(1, 0);
		assert_eq!(buf.capacity(), 4);
		buf.write_u8(1, 100);
		assert_eq!(buf.capacity(), 101);
	}

	#[test]
	fn pool_reuses_released_buffers() {
		let pool = BufferPool::new();
		let mut buf = pool.acquire();
		buf.append_bytes(b"stale");
		pool.release(buf);

		let reused = pool.acquire();
		assert_eq!(reused.len(), 0, "acquire must clear stale content");
		assert_eq!(pool.stats().free_count, 0);
	}

	#[test]
	#[cfg(debug_assertions)]
	#[should_panic(expected = "released twice")]
	fn double_release_panics_in_debug() {
		let pool = BufferPool::new();
		let buf = pool.acquire();
		// Cloning the id via a second empty buffer to force a duplicate id
		// would require unsafe; instead exercise the real double-release path.
		let id = buf.id;
		pool.release(buf);
		let mut fake = ResizableBuffer::new();
		fake.id = id;
		pool.release(fake);
	}
}
