// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NSON (version V4): a self-describing map/array wire format, plus its
//! writer and reader (§4.4).
//!
//! The short field-key strings in [`keys`] are the frozen wire vocabulary;
//! they must match the server's table bit-exact (§4.4, §9).

use nosqldb_codec::{read_sorted_int32, read_sorted_int64, write_sorted_int32, write_sorted_int64, ResizableBuffer};

use crate::error::{NoSQLError, Result};
use crate::field_value::{FieldType, FieldValue, MapValue};

/// Upper bound on a MAP/ARRAY element count, guarding against infinite loops
/// on adversarial input.
pub const MAX_ELEMENTS: i32 = 1_000_000_000;

pub mod keys {
	//! Frozen NSON field-key strings, reproduced bit-exact against the wire
	//! protocol's short-string table.
	pub const VERSION: &str = "v";
	pub const TABLE_NAME: &str = "n";
	pub const OP_CODE: &str = "o";
	pub const TIMEOUT: &str = "t";
	pub const HEADER: &str = "h";
	pub const PAYLOAD: &str = "p";
	pub const ERROR_CODE: &str = "e";
	pub const EXCEPTION: &str = "x";
	pub const CONSUMED: &str = "c";
	pub const READ_UNITS: &str = "ru";
	pub const READ_KB: &str = "rk";
	pub const WRITE_KB: &str = "wk";
	pub const WRITE_UNITS: &str = "wu";
	pub const TOPOLOGY_INFO: &str = "tp";
	pub const PROXY_TOPO_SEQNUM: &str = "pn";
	pub const SHARD_IDS: &str = "sa";
	pub const KEY: &str = "k";
	pub const ROW: &str = "r";
	pub const ROW_VERSION: &str = "rv";
	pub const VALUE: &str = "l";
	pub const RETURN_ROW: &str = "rr";
	pub const EXISTING_VERSION: &str = "ev";
	pub const EXISTING_VALUE: &str = "el";
	pub const EXISTING_MOD_TIME: &str = "em";
	pub const MATCH_VERSION: &str = "mv";
	pub const EXPIRATION: &str = "xp";
	pub const MODIFIED: &str = "md";
	pub const TTL: &str = "tt";
	pub const UPDATE_TTL: &str = "ut";
	pub const CONSISTENCY: &str = "co";
	pub const TYPE: &str = "y";
	pub const DURABILITY: &str = "du";
	pub const SUCCESS: &str = "ss";
	pub const QUERY: &str = "q";
	pub const PREPARE: &str = "pp";
	pub const PREPARED_QUERY: &str = "pq";
	pub const PREPARED_STATEMENT: &str = "ps";
	pub const IS_PREPARED: &str = "is";
	pub const IS_SIMPLE_QUERY: &str = "iq";
	pub const QUERY_RESULTS: &str = "qr";
	pub const CONTINUATION_KEY: &str = "ck";
	pub const BIND_VARIABLES: &str = "bv";
	pub const NAME: &str = "m";
	pub const SHARD_ID: &str = "si";
	pub const FIELDS: &str = "f";
	pub const RANGE: &str = "rg";
	pub const START: &str = "sr";
	pub const END: &str = "en";
	pub const INCLUSIVE: &str = "in";
	pub const LIMITS: &str = "lm";
	pub const LIMITS_MODE: &str = "mo";
	pub const STORAGE_GB: &str = "sg";
	pub const TABLE_DDL: &str = "td";
	pub const TABLE_STATE: &str = "as";
	pub const OPERATIONS: &str = "os";
	pub const ABORT_ON_FAIL: &str = "a";
	pub const WM_SUCCESS: &str = "ws";
	pub const WM_FAILURE: &str = "wf";
	pub const WM_FAIL_INDEX: &str = "wi";
	pub const WM_FAIL_RESULT: &str = "wr";
	pub const NUM_DELETIONS: &str = "nd";
	pub const STATEMENT: &str = "st";
	pub const TABLES: &str = "tb";
	pub const NUM_OPERATIONS: &str = "no";
	pub const NUM_RESULTS: &str = "nr";
	pub const DRIVER_QUERY_PLAN: &str = "dq";
	pub const REACHED_LIMIT: &str = "re";
	pub const MAX_READ_KB: &str = "mr";
	pub const MAX_WRITE_KB: &str = "mw";
	pub const NAMESPACE: &str = "ns";
}

/// Builds an NSON document depth-first into a [`ResizableBuffer`].
pub struct NsonWriter<'a> {
	buf: &'a mut ResizableBuffer,
	/// `(length_offset, element_count)` per open map/array frame.
	frames: Vec<(usize, i32)>,
}

impl<'a> NsonWriter<'a> {
	pub fn new(buf: &'a mut ResizableBuffer) -> Self {
		Self {
			buf,
			frames: Vec::new(),
		}
	}

	fn incr_parent(&mut self) {
		if let Some((_, count)) = self.frames.last_mut() {
			*count += 1;
		}
	}

	pub fn write_type(&mut self, ft: FieldType) {
		let off = self.buf.len();
		self.buf.write_u8(ft as u8, off);
	}

	/// Packed length-prefixed string.
	pub fn write_string_raw(&mut self, s: &str) {
		let off = self.buf.len();
		let end = write_sorted_int32(self.buf, off, s.len() as i32);
		self.buf.write_bytes_at(s.as_bytes(), end);
	}

	fn start_composite(&mut self, ft: FieldType) {
		self.write_type(ft);
		let header_off = self.buf.len();
		self.buf.write_u32_be(0, header_off);
		self.buf.write_u32_be(0, header_off + 4);
		self.frames.push((header_off, 0));
	}

	fn end_composite(&mut self) {
		let (header_off, count) = self
			.frames
			.pop()
			.expect("end_map/end_array without matching start");
		let byte_len = (self.buf.len() - (header_off + 8)) as u32;
		self.buf.write_bytes_at(&byte_len.to_be_bytes(), header_off);
		self.buf.write_bytes_at(&(count as u32).to_be_bytes(), header_off + 4);
		self.incr_parent();
	}

	pub fn start_map(&mut self) {
		self.start_composite(FieldType::Map);
	}

	pub fn end_map(&mut self) {
		self.end_composite();
	}

	pub fn start_array(&mut self) {
		self.start_composite(FieldType::Array);
	}

	pub fn end_array(&mut self) {
		self.end_composite();
	}

	pub fn write_field_name(&mut self, key: &str) {
		self.write_string_raw(key);
	}

	fn end_scalar_field(&mut self) {
		self.incr_parent();
	}

	pub fn write_int_field(&mut self, key: &str, v: i32) {
		self.write_field_name(key);
		self.write_type(FieldType::Integer);
		let off = self.buf.len();
		write_sorted_int32(self.buf, off, v);
		self.end_scalar_field();
	}

	pub fn write_long_field(&mut self, key: &str, v: i64) {
		self.write_field_name(key);
		self.write_type(FieldType::Long);
		let off = self.buf.len();
		write_sorted_int64(self.buf, off, v);
		self.end_scalar_field();
	}

	pub fn write_bool_field(&mut self, key: &str, v: bool) {
		self.write_field_name(key);
		self.write_type(FieldType::Boolean);
		let off = self.buf.len();
		self.buf.write_u8(u8::from(v), off);
		self.end_scalar_field();
	}

	pub fn write_string_field(&mut self, key: &str, v: &str) {
		self.write_field_name(key);
		self.write_type(FieldType::String);
		self.write_string_raw(v);
		self.end_scalar_field();
	}

	pub fn write_binary_field(&mut self, key: &str, v: &[u8]) {
		self.write_field_name(key);
		self.write_type(FieldType::Binary);
		let off = self.buf.len();
		let end = write_sorted_int32(self.buf, off, v.len() as i32);
		self.buf.write_bytes_at(v, end);
		self.end_scalar_field();
	}

	pub fn write_double_field(&mut self, key: &str, v: f64) {
		self.write_field_name(key);
		self.write_type(FieldType::Double);
		let off = self.buf.len();
		self.buf.write_f64_be(v, off);
		self.end_scalar_field();
	}

	/// Omits the field entirely when `val <= 0`, mirroring the real driver's
	/// `write_nz_field` convention for optional positive counters.
	pub fn write_positive_int_field(&mut self, key: &str, val: i32) {
		if val > 0 {
			self.write_int_field(key, val);
		}
	}

	pub fn write_true_bool_field(&mut self, key: &str, val: bool) {
		if val {
			self.write_bool_field(key, val);
		}
	}

	pub fn write_map_field(&mut self, key: &str, val: &MapValue) {
		self.write_field_name(key);
		self.write_map_value(val);
	}

	/// Writes a MAP's entries. Every call to `write_field_value` below
	/// leaves the then-current frame incremented exactly once — for a
	/// scalar by its own trailing `incr_parent`, for a nested MAP/ARRAY by
	/// `end_composite`'s built-in one — so this loop must not increment
	/// again itself.
	pub fn write_map_value(&mut self, val: &MapValue) {
		self.start_map();
		for (k, v) in val.iter() {
			self.write_field_name(k);
			self.write_field_value(v);
		}
		self.end_map();
	}

	pub fn write_field_value(&mut self, v: &FieldValue) {
		match v {
			FieldValue::JsonNull => {
				self.write_type(FieldType::JsonNull);
				self.incr_parent();
			}
			FieldValue::Null => {
				self.write_type(FieldType::Null);
				self.incr_parent();
			}
			FieldValue::Empty => {
				self.write_type(FieldType::Empty);
				self.incr_parent();
			}
			FieldValue::Boolean(b) => {
				self.write_type(FieldType::Boolean);
				let off = self.buf.len();
				self.buf.write_u8(u8::from(*b), off);
				self.incr_parent();
			}
			FieldValue::Integer(i) => {
				self.write_type(FieldType::Integer);
				let off = self.buf.len();
				write_sorted_int32(self.buf, off, *i);
				self.incr_parent();
			}
			FieldValue::Long(l) => {
				self.write_type(FieldType::Long);
				let off = self.buf.len();
				write_sorted_int64(self.buf, off, *l);
				self.incr_parent();
			}
			FieldValue::BigLong(big) => {
				self.write_type(FieldType::Long);
				let off = self.buf.len();
				// Fall back to a truncating cast only when the value
				// genuinely fits; BigLong values produced by this driver's
				// own codec never arise since i64 already spans the wire
				// range, so this path only serves foreign adapters.
				let v = i64::try_from(big.clone()).unwrap_or(0);
				write_sorted_int64(self.buf, off, v);
				self.incr_parent();
			}
			FieldValue::Double(d) => {
				self.write_type(FieldType::Double);
				let off = self.buf.len();
				self.buf.write_f64_be(*d, off);
				self.incr_parent();
			}
			FieldValue::Number(dec) => {
				self.write_type(FieldType::Number);
				self.write_string_raw(&dec.to_string());
				self.incr_parent();
			}
			FieldValue::String(s) => {
				self.write_type(FieldType::String);
				self.write_string_raw(s);
				self.incr_parent();
			}
			FieldValue::Timestamp(ms) => {
				self.write_type(FieldType::Timestamp);
				let off = self.buf.len();
				write_sorted_int64(self.buf, off, *ms);
				self.incr_parent();
			}
			FieldValue::Binary(b) => {
				self.write_type(FieldType::Binary);
				let off = self.buf.len();
				let end = write_sorted_int32(self.buf, off, b.len() as i32);
				self.buf.write_bytes_at(b, end);
				self.incr_parent();
			}
			FieldValue::Array(items) => {
				self.start_array();
				for item in items {
					self.write_field_value(item);
				}
				self.end_array();
			}
			FieldValue::Map(map) => self.write_map_value(map),
		}
	}

	pub fn start_header(&mut self) {
		self.write_field_name(keys::HEADER);
		self.start_map();
	}

	pub fn end_header(&mut self) {
		self.end_map();
	}

	pub fn start_payload(&mut self) {
		self.write_field_name(keys::PAYLOAD);
		self.start_map();
	}

	pub fn end_payload(&mut self) {
		self.end_map();
	}

	/// Starts the top-level request document (an unnamed root MAP).
	pub fn start_request(&mut self) {
		self.start_map();
	}

	pub fn end_request(&mut self) {
		self.end_map();
	}
}

/// A stack frame the reader maintains while walking a MAP/ARRAY.
struct Frame {
	start_offset: usize,
	byte_len: usize,
	declared_count: i32,
	consumed_count: i32,
}

/// Walks an NSON document depth-first. `next()` is the only way to advance:
/// inside a map it first consumes the field-name string, then the next
/// value's type byte.
pub struct NsonReader<'a> {
	buf: &'a ResizableBuffer,
	pos: usize,
}

impl<'a> NsonReader<'a> {
	#[must_use]
	pub fn new(buf: &'a ResizableBuffer) -> Self {
		Self { buf, pos: 0 }
	}

	#[must_use]
	pub fn position(&self) -> usize {
		self.pos
	}

	fn read_u8(&mut self) -> Result<u8> {
		let b = self.buf.read_u8(self.pos)?;
		self.pos += 1;
		Ok(b)
	}

	fn read_i32_fixed(&mut self) -> Result<i32> {
		let v = self.buf.read_i32_be(self.pos)?;
		self.pos += 4;
		Ok(v)
	}

	pub fn read_packed_i32(&mut self) -> Result<i32> {
		let (v, next) = read_sorted_int32(self.buf, self.pos)?;
		self.pos = next;
		Ok(v)
	}

	pub fn read_packed_i64(&mut self) -> Result<i64> {
		let (v, next) = read_sorted_int64(self.buf, self.pos)?;
		self.pos = next;
		Ok(v)
	}

	pub fn read_string(&mut self) -> Result<String> {
		let len = self.read_packed_i32()?;
		if len < 0 {
			return Ok(String::new());
		}
		let bytes = self.buf.slice(self.pos, self.pos + len as usize)?;
		let s = std::str::from_utf8(bytes)
			.map_err(|e| NoSQLError::Protocol {
				operation: "nson-string".to_string(),
				detail: e.to_string(),
			})?
			.to_string();
		self.pos += len as usize;
		Ok(s)
	}

	pub fn read_binary(&mut self) -> Result<Vec<u8>> {
		let len = self.read_packed_i32()?;
		let bytes = self.buf.slice(self.pos, self.pos + len.max(0) as usize)?.to_vec();
		self.pos += len.max(0) as usize;
		Ok(bytes)
	}

	pub fn read_bool(&mut self) -> Result<bool> {
		Ok(self.read_u8()? != 0)
	}

	pub fn read_double(&mut self) -> Result<f64> {
		let v = self.buf.read_f64_be(self.pos)?;
		self.pos += 8;
		Ok(v)
	}

	pub fn read_field_type(&mut self) -> Result<FieldType> {
		let b = self.read_u8()?;
		FieldType::from_u8(b).ok_or_else(|| NoSQLError::Protocol {
			operation: "nson-type".to_string(),
			detail: format!("unrecognized NSON type code {b}"),
		})
	}

	fn read_composite_header(&mut self) -> Result<(usize, usize, i32)> {
		let byte_len = self.read_i32_fixed()?;
		let count = self.read_i32_fixed()?;
		if !(0..=MAX_ELEMENTS).contains(&count) {
			return Err(NoSQLError::Protocol {
				operation: "nson-map".to_string(),
				detail: format!("invalid element count {count}"),
			});
		}
		Ok((self.pos, byte_len.max(0) as usize, count))
	}

	/// Reads a full [`FieldValue`], recursing into MAP/ARRAY as needed.
	pub fn read_field_value(&mut self) -> Result<FieldValue> {
		match self.read_field_type()? {
			FieldType::JsonNull => Ok(FieldValue::JsonNull),
			FieldType::Null => Ok(FieldValue::Null),
			FieldType::Empty => Ok(FieldValue::Empty),
			FieldType::Boolean => Ok(FieldValue::Boolean(self.read_bool()?)),
			FieldType::Integer => Ok(FieldValue::Integer(self.read_packed_i32()?)),
			FieldType::Long => Ok(FieldValue::Long(self.read_packed_i64()?)),
			FieldType::Double => Ok(FieldValue::Double(self.read_double()?)),
			FieldType::Number => {
				let s = self.read_string()?;
				let dec: bigdecimal::BigDecimal = s.parse().map_err(|e| NoSQLError::Protocol {
					operation: "nson-number".to_string(),
					detail: format!("{e}"),
				})?;
				Ok(FieldValue::Number(dec))
			}
			FieldType::String => Ok(FieldValue::String(self.read_string()?)),
			FieldType::Timestamp => Ok(FieldValue::Timestamp(self.read_packed_i64()?)),
			FieldType::Binary => Ok(FieldValue::Binary(self.read_binary()?)),
			FieldType::Array => {
				let (start, byte_len, count) = self.read_composite_header()?;
				let mut items = Vec::with_capacity(count.min(4096) as usize);
				for _ in 0..count {
					items.push(self.read_field_value()?);
				}
				self.verify_consumed(start, byte_len)?;
				Ok(FieldValue::Array(items))
			}
			FieldType::Map => {
				let (start, byte_len, count) = self.read_composite_header()?;
				let mut map = MapValue::new();
				for _ in 0..count {
					let key = self.read_string()?;
					let value = self.read_field_value()?;
					map.insert(key, value);
				}
				self.verify_consumed(start, byte_len)?;
				Ok(FieldValue::Map(map))
			}
		}
	}

	fn verify_consumed(&self, start: usize, byte_len: usize) -> Result<()> {
		if self.pos != start + byte_len {
			return Err(NoSQLError::Protocol {
				operation: "nson-map".to_string(),
				detail: format!(
					"declared byte length {byte_len} does not match consumed bytes {}",
					self.pos - start
				),
			});
		}
		Ok(())
	}

	/// Skips any value, including nested composites, by jumping straight to
	/// `start_offset + byte_len` for MAP/ARRAY rather than walking elements.
	pub fn skip_value(&mut self) -> Result<()> {
		match self.read_field_type()? {
			FieldType::JsonNull | FieldType::Null | FieldType::Empty => {}
			FieldType::Boolean => {
				self.pos += 1;
			}
			FieldType::Integer => {
				self.read_packed_i32()?;
			}
			FieldType::Long | FieldType::Timestamp => {
				self.read_packed_i64()?;
			}
			FieldType::Double => {
				self.pos += 8;
			}
			FieldType::Number | FieldType::String => {
				let len = self.read_packed_i32()?;
				self.pos += len.max(0) as usize;
			}
			FieldType::Binary => {
				let len = self.read_packed_i32()?;
				self.pos += len.max(0) as usize;
			}
			FieldType::Array | FieldType::Map => {
				let (start, byte_len, _count) = self.read_composite_header()?;
				self.pos = start + byte_len;
			}
		}
		self.buf.slice(0, self.pos)?; // bounds-check the jump landed in range
		Ok(())
	}
}

/// Walks the entries of a MAP that has already been entered, tracking field
/// names and element count the way the server's own driver-side readers do.
pub struct MapCursor<'a, 'b> {
	reader: &'a mut NsonReader<'b>,
	declared_count: i32,
	consumed: i32,
	current_name: String,
	start_offset: usize,
	byte_len: usize,
}

impl<'a, 'b> MapCursor<'a, 'b> {
	pub fn enter(reader: &'a mut NsonReader<'b>) -> Result<Self> {
		let ft = reader.read_field_type()?;
		if ft != FieldType::Map {
			return Err(NoSQLError::Protocol {
				operation: "nson-map".to_string(),
				detail: format!("expected MAP, found {ft:?}"),
			});
		}
		let (start_offset, byte_len, declared_count) = reader.read_composite_header()?;
		Ok(Self {
			reader,
			declared_count,
			consumed: 0,
			current_name: String::new(),
			start_offset,
			byte_len,
		})
	}

	#[must_use]
	pub fn has_next(&self) -> bool {
		self.consumed < self.declared_count
	}

	pub fn next(&mut self) -> Result<()> {
		if !self.has_next() {
			return Err(NoSQLError::Protocol {
				operation: "nson-map".to_string(),
				detail: "next() called with no elements remaining".to_string(),
			});
		}
		self.current_name = self.reader.read_string()?;
		self.consumed += 1;
		Ok(())
	}

	#[must_use]
	pub fn current_name(&self) -> &str {
		&self.current_name
	}

	/// Reborrows the underlying reader so a nested [`MapCursor`] can be
	/// entered for a composite field's value without moving `self`.
	pub fn reader_mut(&mut self) -> &mut NsonReader<'b> {
		&mut *self.reader
	}

	pub fn read_value(&mut self) -> Result<FieldValue> {
		self.reader.read_field_value()
	}

	pub fn skip_value(&mut self) -> Result<()> {
		self.reader.skip_value()
	}

	pub fn finish(self) -> Result<()> {
		self.reader.verify_consumed(self.start_offset, self.byte_len)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bigdecimal::BigDecimal;
	use std::str::FromStr;

	fn encode(v: &FieldValue) -> ResizableBuffer {
		let mut buf = ResizableBuffer::new();
		let mut w = NsonWriter::new(&mut buf);
		w.write_field_value(v);
		buf
	}

	#[test]
	fn scalar_round_trip() {
		for v in [
			FieldValue::JsonNull,
			FieldValue::Null,
			FieldValue::Boolean(true),
			FieldValue::Integer(-42),
			FieldValue::Long(9_223_372_036_854_775_807),
			FieldValue::Double(3.5),
			FieldValue::String("hello nson".to_string()),
			FieldValue::Timestamp(1_700_000_000_000),
			FieldValue::Binary(vec![1, 2, 3, 4]),
			FieldValue::Number(BigDecimal::from_str("123.456").unwrap()),
		] {
			let buf = encode(&v);
			let mut r = NsonReader::new(&buf);
			assert_eq!(r.read_field_value().unwrap(), v);
			assert_eq!(r.position(), buf.len());
		}
	}

	#[test]
	fn nested_map_and_array_round_trip() {
		let mut row = MapValue::new();
		row.insert("id", FieldValue::Integer(1));
		row.insert(
			"tags",
			FieldValue::Array(vec![FieldValue::String("a".into()), FieldValue::String("b".into())]),
		);
		let v = FieldValue::Map(row.clone());
		let buf = encode(&v);
		let mut r = NsonReader::new(&buf);
		let decoded = r.read_field_value().unwrap();
		assert_eq!(decoded, v);
		assert_eq!(r.position(), buf.len());
	}

	#[test]
	fn skip_value_advances_exactly_to_end() {
		let mut row = MapValue::new();
		row.insert("id", FieldValue::Integer(1));
		row.insert("name", FieldValue::String("widget".into()));
		row.insert(
			"nested",
			FieldValue::Map({
				let mut m = MapValue::new();
				m.insert("x", FieldValue::Double(1.0));
				m
			}),
		);
		let v = FieldValue::Map(row);
		let buf = encode(&v);
		let mut r = NsonReader::new(&buf);
		r.skip_value().unwrap();
		assert_eq!(r.position(), buf.len());
	}

	#[test]
	fn map_cursor_walks_unknown_and_known_keys() {
		let mut buf = ResizableBuffer::new();
		{
			let mut w = NsonWriter::new(&mut buf);
			w.start_map();
			w.write_int_field("a", 1);
			w.write_string_field("unknown", "skip me");
			w.write_long_field("b", 2);
			w.end_map();
		}
		let mut reader = NsonReader::new(&buf);
		let mut cursor = MapCursor::enter(&mut reader).unwrap();
		let mut a = None;
		let mut b = None;
		while cursor.has_next() {
			cursor.next().unwrap();
			match cursor.current_name() {
				"a" => a = Some(cursor.read_value().unwrap()),
				"b" => b = Some(cursor.read_value().unwrap()),
				_ => cursor.skip_value().unwrap(),
			}
		}
		cursor.finish().unwrap();
		assert_eq!(a, Some(FieldValue::Integer(1)));
		assert_eq!(b, Some(FieldValue::Long(2)));
	}
}
