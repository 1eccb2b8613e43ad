// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sorted-prefix variable-length encoding of signed integers.
//!
//! Bytes `0x08..=0xF7` are the single-byte region `[-119, 120]`, stored as
//! `value + 127`. Below `0x08` is a negative multi-byte form (`length = 0x08
//! - b1`, the following bytes are the minimal big-endian two's-complement
//! representation of `value + 119`). Above `0xF7` is a positive multi-byte
//! form (`length = b1 - 0xF7`, the following bytes are the minimal big-endian
//! unsigned representation of `value - 121`).
//!
//! Two's-complement bytes, read as an unsigned big-endian integer of a fixed
//! length, are monotonic with the signed value they represent; the length
//! byte itself is monotonic with magnitude across different lengths. Together
//! this makes byte-lexicographic order match numeric order end to end.

use crate::buffer::ResizableBuffer;
use crate::{ReadError, ReadResult};

const MIN_SINGLE: i64 = -119;
const MAX_SINGLE: i64 = 120;
const NEG_ADJUST: i64 = 119;
const POS_ADJUST: i64 = 121;

#[must_use]
pub const fn max_sorted_int32_size() -> usize {
	5
}

#[must_use]
pub const fn max_sorted_int64_size() -> usize {
	9
}

/// Minimal number of bytes (1..=8) needed to hold `v` as big-endian two's
/// complement without a redundant sign-extension byte. `v` must be negative.
fn min_bytes_signed(v: i64) -> u8 {
	debug_assert!(v < 0);
	let mut len: u32 = 1;
	while len < 8 && v < -(1i64 << (8 * len - 1)) {
		len += 1;
	}
	len as u8
}

/// Minimal number of bytes (1..=8) needed to hold `v` as big-endian unsigned.
fn min_bytes_unsigned(v: u64) -> u8 {
	let mut len: u32 = 1;
	while len < 8 && v >= (1u64 << (8 * len)) {
		len += 1;
	}
	len as u8
}

fn write_multibyte(buf: &mut ResizableBuffer, mut off: usize, header: u8, bytes: &[u8]) -> usize {
	off = buf.write_u8(header, off);
	for &b in bytes {
		off = buf.write_u8(b, off);
	}
	off
}

/// Writes `value` using the sorted packed-integer encoding and returns the
/// offset just past the last byte written.
pub fn write_sorted_int64(buf: &mut ResizableBuffer, off: usize, value: i64) -> usize {
	if (MIN_SINGLE..=MAX_SINGLE).contains(&value) {
		return buf.write_u8((value + 127) as u8, off);
	}

	if value < MIN_SINGLE {
		let adjusted = (value as i128 + NEG_ADJUST as i128) as i64;
		let len = min_bytes_signed(adjusted);
		let header = 0x08 - len;
		let full = adjusted.to_be_bytes();
		let bytes = &full[(8 - len as usize)..];
		write_multibyte(buf, off, header, bytes)
	} else {
		let adjusted = (value as i128 - POS_ADJUST as i128) as u64;
		let len = min_bytes_unsigned(adjusted);
		let header = 0xF7 + len;
		let full = adjusted.to_be_bytes();
		let bytes = &full[(8 - len as usize)..];
		write_multibyte(buf, off, header, bytes)
	}
}

/// Writes a 32-bit value using the same encoding (at most 5 bytes).
pub fn write_sorted_int32(buf: &mut ResizableBuffer, off: usize, value: i32) -> usize {
	write_sorted_int64(buf, off, i64::from(value))
}

fn sign_extend_negative(bytes: &[u8]) -> i64 {
	let mut full = [0xFFu8; 8];
	full[(8 - bytes.len())..].copy_from_slice(bytes);
	i64::from_be_bytes(full)
}

fn zero_extend_unsigned(bytes: &[u8]) -> u64 {
	let mut full = [0u8; 8];
	full[(8 - bytes.len())..].copy_from_slice(bytes);
	u64::from_be_bytes(full)
}

/// Reads a packed signed integer, returning the decoded value and the offset
/// just past the last byte consumed.
pub fn read_sorted_int64(buf: &ResizableBuffer, off: usize) -> ReadResult<(i64, usize)> {
	let header = buf.read_u8(off)?;

	if (0x08..=0xF7).contains(&header) {
		return Ok((i64::from(header) - 127, off + 1));
	}

	if header < 0x08 {
		let len = (0x08 - header) as usize;
		if len == 0 || len > 8 {
			return Err(ReadError::Other(
				format!("invalid negative packed-int length byte {header:#x}").into(),
			));
		}
		let bytes = buf.slice(off + 1, off + 1 + len)?;
		let adjusted = sign_extend_negative(bytes);
		let value = (adjusted as i128 - NEG_ADJUST as i128) as i64;
		Ok((value, off + 1 + len))
	} else {
		let len = (header - 0xF7) as usize;
		if len == 0 || len > 8 {
			return Err(ReadError::Other(
				format!("invalid positive packed-int length byte {header:#x}").into(),
			));
		}
		let bytes = buf.slice(off + 1, off + 1 + len)?;
		let adjusted = zero_extend_unsigned(bytes);
		let value = (adjusted as i128 + POS_ADJUST as i128) as i64;
		Ok((value, off + 1 + len))
	}
}

/// Reads a packed 32-bit signed integer.
pub fn read_sorted_int32(buf: &ResizableBuffer, off: usize) -> ReadResult<(i32, usize)> {
	let (value, next) = read_sorted_int64(buf, off)?;
	if value < i64::from(i32::MIN) || value > i64::from(i32::MAX) {
		return Err(ReadError::Other(
			format!("packed int32 value {value} out of range").into(),
		));
	}
	Ok((value as i32, next))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip_i64(v: i64) {
		let mut buf = ResizableBuffer::new();
		let end = write_sorted_int64(&mut buf, 0, v);
		assert!(end <= max_sorted_int64_size());
		let (got, next) = read_sorted_int64(&buf, 0).unwrap();
		assert_eq!(got, v);
		assert_eq!(next, end);
	}

	fn round_trip_i32(v: i32) {
		let mut buf = ResizableBuffer::new();
		let end = write_sorted_int32(&mut buf, 0, v);
		assert!(end <= max_sorted_int32_size());
		let (got, next) = read_sorted_int32(&buf, 0).unwrap();
		assert_eq!(got, v);
		assert_eq!(next, end);
	}

	#[test]
	fn round_trip_boundaries_and_samples() {
		for v in [
			0,
			1,
			-1,
			120,
			121,
			-119,
			-120,
			-121,
			i32::MIN,
			i32::MAX,
			i32::MIN + 1,
			255,
			256,
			-255,
			-256,
			65535,
			65536,
		] {
			round_trip_i32(v);
		}
		for v in [
			0i64,
			1,
			-1,
			i64::MIN,
			i64::MAX,
			i64::MIN + 1,
			i32::MAX as i64 + 1,
			i32::MIN as i64 - 1,
		] {
			round_trip_i64(v);
		}
	}

	#[test]
	fn order_preserving_i32() {
		let samples: Vec<i32> = vec![
			i32::MIN,
			i32::MIN + 1,
			-100_000,
			-256,
			-255,
			-121,
			-120,
			-119,
			-1,
			0,
			1,
			120,
			121,
			255,
			256,
			100_000,
			i32::MAX - 1,
			i32::MAX,
		];
		let mut encoded: Vec<(i32, Vec<u8>)> = samples
			.into_iter()
			.map(|v| {
				let mut buf = ResizableBuffer::new();
				let end = write_sorted_int32(&mut buf, 0, v);
				(v, buf.slice(0, end).unwrap().to_vec())
			})
			.collect();
		let sorted_by_value = {
			let mut e = encoded.clone();
			e.sort_by_key(|(v, _)| *v);
			e
		};
		encoded.sort_by(|(_, a), (_, b)| a.cmp(b));
		assert_eq!(encoded, sorted_by_value);
	}

	#[test]
	fn order_preserving_i64_extremes() {
		let samples: Vec<i64> = vec![
			i64::MIN,
			i64::MIN + 1,
			i32::MIN as i64 - 1,
			-120,
			0,
			120,
			i32::MAX as i64 + 1,
			i64::MAX - 1,
			i64::MAX,
		];
		let mut encoded: Vec<(i64, Vec<u8>)> = samples
			.into_iter()
			.map(|v| {
				let mut buf = ResizableBuffer::new();
				let end = write_sorted_int64(&mut buf, 0, v);
				(v, buf.slice(0, end).unwrap().to_vec())
			})
			.collect();
		let sorted_by_value = {
			let mut e = encoded.clone();
			e.sort_by_key(|(v, _)| *v);
			e
		};
		encoded.sort_by(|(_, a), (_, b)| a.cmp(b));
		assert_eq!(encoded, sorted_by_value);
	}

	proptest::proptest! {
		#[test]
		fn prop_round_trip_i32(v: i32) {
			let mut buf = ResizableBuffer::new();
			let end = write_sorted_int32(&mut buf, 0, v);
			proptest::prop_assert!(end <= max_sorted_int32_size());
			let (got, next) = read_sorted_int32(&buf, 0).unwrap();
			proptest::prop_assert_eq!(got, v);
			proptest::prop_assert_eq!(next, end);
		}

		#[test]
		fn prop_round_trip_i64(v: i64) {
			let mut buf = ResizableBuffer::new();
			let end = write_sorted_int64(&mut buf, 0, v);
			proptest::prop_assert!(end <= max_sorted_int64_size());
			let (got, next) = read_sorted_int64(&buf, 0).unwrap();
			proptest::prop_assert_eq!(got, v);
			proptest::prop_assert_eq!(next, end);
		}

		#[test]
		fn prop_order_preserving_i32(a: i32, b: i32) {
			proptest::prop_assume!(a < b);
			let mut buf_a = ResizableBuffer::new();
			let end_a = write_sorted_int32(&mut buf_a, 0, a);
			let mut buf_b = ResizableBuffer::new();
			let end_b = write_sorted_int32(&mut buf_b, 0, b);
			let enc_a = buf_a.slice(0, end_a).unwrap();
			let enc_b = buf_b.slice(0, end_b).unwrap();
			proptest::prop_assert!(enc_a < enc_b);
		}

		#[test]
		fn prop_order_preserving_i64(a: i64, b: i64) {
			proptest::prop_assume!(a < b);
			let mut buf_a = ResizableBuffer::new();
			let end_a = write_sorted_int64(&mut buf_a, 0, a);
			let mut buf_b = ResizableBuffer::new();
			let end_b = write_sorted_int64(&mut buf_b, 0, b);
			let enc_a = buf_a.slice(0, end_a).unwrap();
			let enc_b = buf_b.slice(0, end_b).unwrap();
			proptest::prop_assert!(enc_a < enc_b);
		}
	}
}
