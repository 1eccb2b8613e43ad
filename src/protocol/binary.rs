// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary protocol codec (V2, V3): a positional, length-prefixed encoding
//! (§4.3). Every request starts with a 2-byte serial version and a 1-byte
//! opcode; fields after that follow a fixed per-opcode order.

use chrono::{SecondsFormat, TimeZone, Utc};
use nosqldb_codec::{read_sorted_int32, read_sorted_int64, write_sorted_int32, write_sorted_int64, ResizableBuffer};

use super::ProtocolVersion;
use crate::error::{NoSQLError, Result};
use crate::field_value::{FieldType, FieldValue, MapValue};
use crate::types::{Capacity, Durability, FieldRange, RangeBound, Ttl};

/// Writes positional binary-protocol fields into a buffer for a request
/// serialized under `version` (V2 or V3; durability is V3+ only).
pub struct BinaryWriter<'a> {
	pub buf: &'a mut ResizableBuffer,
	pub version: ProtocolVersion,
}

impl<'a> BinaryWriter<'a> {
	pub fn new(buf: &'a mut ResizableBuffer, version: ProtocolVersion) -> Self {
		Self { buf, version }
	}

	pub fn write_request_header(&mut self, op_code: u8) {
		let off = self.buf.len();
		let off = self.buf.write_u16_be(self.version.as_u16(), off);
		self.buf.write_u8(op_code, off);
	}

	pub fn write_int(&mut self, v: i32) {
		let off = self.buf.len();
		write_sorted_int32(self.buf, off, v);
	}

	pub fn write_long(&mut self, v: i64) {
		let off = self.buf.len();
		write_sorted_int64(self.buf, off, v);
	}

	/// `None` is absent (`-1`); `Some("")` is empty (`0`).
	pub fn write_string(&mut self, s: Option<&str>) {
		match s {
			None => self.write_int(-1),
			Some(s) => {
				self.write_int(s.len() as i32);
				self.buf.append_bytes(s.as_bytes());
			}
		}
	}

	pub fn write_binary(&mut self, b: Option<&[u8]>) {
		match b {
			None => self.write_int(-1),
			Some(b) => {
				self.write_int(b.len() as i32);
				self.buf.append_bytes(b);
			}
		}
	}

	/// Fixed 4-byte big-endian length, used only for opaque prepared-statement
	/// blobs.
	pub fn write_binary2(&mut self, b: &[u8]) {
		let off = self.buf.len();
		let off = self.buf.write_i32_be(b.len() as i32, off);
		self.buf.write_bytes_at(b, off);
	}

	pub fn write_boolean(&mut self, v: bool) {
		let off = self.buf.len();
		self.buf.write_u8(u8::from(v), off);
	}

	pub fn write_double(&mut self, v: f64) {
		let off = self.buf.len();
		self.buf.write_f64_be(v, off);
	}

	/// ISO-8601 without a trailing `Z`, length-prefixed.
	pub fn write_date(&mut self, millis_since_epoch: i64) {
		let dt = Utc.timestamp_millis_opt(millis_since_epoch).single().unwrap_or_else(Utc::now);
		let s = dt.to_rfc3339_opts(SecondsFormat::Millis, false);
		let s = s.trim_end_matches('Z');
		self.write_string(Some(s));
	}

	pub fn write_ttl(&mut self, ttl: Ttl) {
		let (value, unit) = ttl.to_wire();
		self.write_long(value);
		let off = self.buf.len();
		self.buf.write_u8(unit as u8, off);
	}

	/// V3+ only: single byte packing three 2-bit fields; `None` is `0`.
	pub fn write_durability(&mut self, durability: Option<Durability>) {
		let byte = durability.map_or(0, Durability::to_byte);
		let off = self.buf.len();
		self.buf.write_u8(byte, off);
	}

	pub fn write_field_value(&mut self, v: &FieldValue) {
		let off = self.buf.len();
		self.buf.write_u8(v.field_type() as u8, off);
		match v {
			FieldValue::JsonNull | FieldValue::Null | FieldValue::Empty => {}
			FieldValue::Boolean(b) => self.write_boolean(*b),
			FieldValue::Integer(i) => self.write_int(*i),
			FieldValue::Long(l) => self.write_long(*l),
			FieldValue::BigLong(big) => self.write_long(i64::try_from(big.clone()).unwrap_or(0)),
			FieldValue::Double(d) => self.write_double(*d),
			FieldValue::Number(dec) => self.write_string(Some(&dec.to_string())),
			FieldValue::String(s) => self.write_string(Some(s)),
			FieldValue::Timestamp(ms) => self.write_long(*ms),
			FieldValue::Binary(b) => self.write_binary(Some(b)),
			FieldValue::Array(items) => self.write_composite(items.len(), |w| {
				for item in items {
					w.write_field_value(item);
				}
			}),
			FieldValue::Map(map) => self.write_composite(map.len(), |w| {
				for (k, v) in map.iter() {
					w.write_string(Some(k));
					w.write_field_value(v);
				}
			}),
		}
	}

	/// Writes the `{4-byte byte length, 4-byte element count}` header used by
	/// MAP/ARRAY, back-patching the length once `body` has been written.
	fn write_composite(&mut self, count: usize, body: impl FnOnce(&mut Self)) {
		let header_off = self.buf.len();
		let off = self.buf.write_u32_be(0, header_off);
		self.buf.write_u32_be(0, off);
		let body_start = self.buf.len();
		body(self);
		let byte_len = (self.buf.len() - body_start) as u32;
		self.buf.write_bytes_at(&byte_len.to_be_bytes(), header_off);
		self.buf.write_bytes_at(&(count as u32).to_be_bytes(), header_off + 4);
	}

	pub fn write_field_range(&mut self, range: Option<&FieldRange>) {
		match range {
			None => self.write_boolean(false),
			Some(r) => {
				self.write_boolean(true);
				self.write_string(Some(&r.field_name));
				self.write_range_bound(r.start.as_ref());
				self.write_range_bound(r.end.as_ref());
			}
		}
	}

	fn write_range_bound(&mut self, bound: Option<&RangeBound>) {
		match bound {
			None => self.write_boolean(false),
			Some(b) => {
				self.write_boolean(true);
				self.write_field_value(&b.value);
				self.write_boolean(b.inclusive);
			}
		}
	}
}

/// Reads positional binary-protocol response fields.
pub struct BinaryReader<'a> {
	pub buf: &'a ResizableBuffer,
	pub pos: usize,
	pub version: ProtocolVersion,
}

impl<'a> BinaryReader<'a> {
	pub fn new(buf: &'a ResizableBuffer, version: ProtocolVersion) -> Self {
		Self { buf, pos: 0, version }
	}

	pub fn read_int(&mut self) -> Result<i32> {
		let (v, next) = read_sorted_int32(self.buf, self.pos)?;
		self.pos = next;
		Ok(v)
	}

	pub fn read_long(&mut self) -> Result<i64> {
		let (v, next) = read_sorted_int64(self.buf, self.pos)?;
		self.pos = next;
		Ok(v)
	}

	pub fn read_boolean(&mut self) -> Result<bool> {
		let b = self.buf.read_u8(self.pos)?;
		self.pos += 1;
		Ok(b != 0)
	}

	pub fn read_double(&mut self) -> Result<f64> {
		let v = self.buf.read_f64_be(self.pos)?;
		self.pos += 8;
		Ok(v)
	}

	/// `-1` length decodes to `None`; `0` decodes to `Some("")`.
	pub fn read_string(&mut self) -> Result<Option<String>> {
		let len = self.read_int()?;
		if len < 0 {
			return Ok(None);
		}
		let bytes = self.buf.slice(self.pos, self.pos + len as usize)?;
		let s = std::str::from_utf8(bytes)
			.map_err(|e| NoSQLError::Protocol {
				operation: "binary-string".to_string(),
				detail: e.to_string(),
			})?
			.to_string();
		self.pos += len as usize;
		Ok(Some(s))
	}

	pub fn read_binary(&mut self) -> Result<Option<Vec<u8>>> {
		let len = self.read_int()?;
		if len < 0 {
			return Ok(None);
		}
		let bytes = self.buf.slice(self.pos, self.pos + len as usize)?.to_vec();
		self.pos += len as usize;
		Ok(Some(bytes))
	}

	/// Fixed 4-byte length-prefixed blob, used for opaque prepared statements.
	pub fn read_binary2(&mut self) -> Result<Vec<u8>> {
		let len = self.buf.read_i32_be(self.pos)?;
		self.pos += 4;
		let bytes = self.buf.slice(self.pos, self.pos + len.max(0) as usize)?.to_vec();
		self.pos += len.max(0) as usize;
		Ok(bytes)
	}

	pub fn read_ttl(&mut self) -> Result<Ttl> {
		let value = self.read_long()?;
		let unit_byte = self.buf.read_u8(self.pos)?;
		self.pos += 1;
		Ttl::from_wire(value, unit_byte)
	}

	pub fn read_field_value(&mut self) -> Result<FieldValue> {
		let type_byte = self.buf.read_u8(self.pos)?;
		self.pos += 1;
		let ft = FieldType::from_u8(type_byte).ok_or_else(|| NoSQLError::Protocol {
			operation: "binary-field-value".to_string(),
			detail: format!("unrecognized type code {type_byte}"),
		})?;
		Ok(match ft {
			FieldType::JsonNull => FieldValue::JsonNull,
			FieldType::Null => FieldValue::Null,
			FieldType::Empty => FieldValue::Empty,
			FieldType::Boolean => FieldValue::Boolean(self.read_boolean()?),
			FieldType::Integer => FieldValue::Integer(self.read_int()?),
			FieldType::Long => FieldValue::Long(self.read_long()?),
			FieldType::Double => FieldValue::Double(self.read_double()?),
			FieldType::Number => {
				let s = self.read_string()?.unwrap_or_default();
				let dec = s.parse().map_err(|e| NoSQLError::Protocol {
					operation: "binary-number".to_string(),
					detail: format!("{e}"),
				})?;
				FieldValue::Number(dec)
			}
			FieldType::String => FieldValue::String(self.read_string()?.unwrap_or_default()),
			FieldType::Timestamp => FieldValue::Timestamp(self.read_long()?),
			FieldType::Binary => FieldValue::Binary(self.read_binary()?.unwrap_or_default()),
			FieldType::Array => {
				let (start, byte_len, count) = self.read_composite_header()?;
				let mut items = Vec::with_capacity(count.min(4096) as usize);
				for _ in 0..count {
					items.push(self.read_field_value()?);
				}
				self.verify_consumed(start, byte_len)?;
				FieldValue::Array(items)
			}
			FieldType::Map => {
				let (start, byte_len, count) = self.read_composite_header()?;
				let mut map = MapValue::new();
				for _ in 0..count {
					let key = self.read_string()?.unwrap_or_default();
					let value = self.read_field_value()?;
					map.insert(key, value);
				}
				self.verify_consumed(start, byte_len)?;
				FieldValue::Map(map)
			}
		})
	}

	fn read_composite_header(&mut self) -> Result<(usize, usize, i32)> {
		let byte_len = self.buf.read_i32_be(self.pos)?;
		self.pos += 4;
		let count = self.buf.read_i32_be(self.pos)?;
		self.pos += 4;
		Ok((self.pos, byte_len.max(0) as usize, count))
	}

	fn verify_consumed(&self, start: usize, byte_len: usize) -> Result<()> {
		if self.pos != start + byte_len {
			return Err(NoSQLError::Protocol {
				operation: "binary-map".to_string(),
				detail: format!(
					"declared byte length {byte_len} does not match consumed bytes {}",
					self.pos - start
				),
			});
		}
		Ok(())
	}

	/// Reads the `{error code, [message]}` prefix common to every response.
	/// `Ok(None)` means success (code 0); `Ok(Some(msg))` carries the
	/// server-supplied detail for a non-zero code, which the caller turns
	/// into a typed [`NoSQLError`] using the code it already read.
	pub fn read_error_code(&mut self) -> Result<i32> {
		let b = self.buf.read_u8(self.pos)?;
		self.pos += 1;
		Ok(i32::from(b))
	}

	pub fn read_error_message(&mut self) -> Result<String> {
		Ok(self.read_string()?.unwrap_or_default())
	}

	pub fn read_consumed_capacity(&mut self) -> Result<Capacity> {
		Ok(Capacity {
			read_units: self.read_int()?,
			read_kb: self.read_int()?,
			write_kb: self.read_int()?,
			read_rate_limit_delay_ms: 0,
			write_rate_limit_delay_ms: 0,
		})
	}

	/// `{present flag, row, expiration, version}`, with a V3-only trailing
	/// modification-time long.
	pub fn read_row_response(&mut self) -> Result<Option<(MapValue, i64, Vec<u8>, Option<i64>)>> {
		if !self.read_boolean()? {
			return Ok(None);
		}
		let row = match self.read_field_value()? {
			FieldValue::Map(m) => m,
			other => {
				return Err(NoSQLError::Protocol {
					operation: "row-response".to_string(),
					detail: format!("expected MAP row, found {:?}", other.field_type()),
				})
			}
		};
		let expiration = self.read_long()?;
		let version = self.read_binary()?.unwrap_or_default();
		let mod_time = if matches!(self.version, ProtocolVersion::V3) {
			Some(self.read_long()?)
		} else {
			None
		};
		Ok(Some((row, expiration, version, mod_time)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bigdecimal::BigDecimal;
	use std::str::FromStr;

	fn encode(v: &FieldValue, version: ProtocolVersion) -> ResizableBuffer {
		let mut buf = ResizableBuffer::new();
		let mut w = BinaryWriter::new(&mut buf, version);
		w.write_field_value(v);
		buf
	}

	#[test]
	fn field_value_round_trip() {
		let mut row = MapValue::new();
		row.insert("id", FieldValue::Integer(7));
		row.insert("name", FieldValue::String("widget".into()));
		for v in [
			FieldValue::Integer(-1),
			FieldValue::Long(i64::MAX),
			FieldValue::Double(2.5),
			FieldValue::String("hi".into()),
			FieldValue::Binary(vec![9, 9, 9]),
			FieldValue::Number(BigDecimal::from_str("10.5").unwrap()),
			FieldValue::Array(vec![FieldValue::Integer(1), FieldValue::Integer(2)]),
			FieldValue::Map(row.clone()),
		] {
			let buf = encode(&v, ProtocolVersion::V3);
			let mut r = BinaryReader::new(&buf, ProtocolVersion::V3);
			assert_eq!(r.read_field_value().unwrap(), v);
			assert_eq!(r.pos, buf.len());
		}
	}

	#[test]
	fn string_absent_vs_empty() {
		let mut buf = ResizableBuffer::new();
		let mut w = BinaryWriter::new(&mut buf, ProtocolVersion::V3);
		w.write_string(None);
		w.write_string(Some(""));
		w.write_string(Some("x"));
		let mut r = BinaryReader::new(&buf, ProtocolVersion::V3);
		assert_eq!(r.read_string().unwrap(), None);
		assert_eq!(r.read_string().unwrap(), Some(String::new()));
		assert_eq!(r.read_string().unwrap(), Some("x".to_string()));
	}

	#[test]
	fn durability_absent_is_zero_byte() {
		let mut buf = ResizableBuffer::new();
		let mut w = BinaryWriter::new(&mut buf, ProtocolVersion::V3);
		w.write_durability(None);
		assert_eq!(buf.slice(0, 1).unwrap(), &[0]);
	}

	#[test]
	fn row_response_v3_carries_mod_time() {
		let mut buf = ResizableBuffer::new();
		let mut row = MapValue::new();
		row.insert("id", FieldValue::Integer(1));
		{
			let mut w = BinaryWriter::new(&mut buf, ProtocolVersion::V3);
			w.write_boolean(true);
			w.write_field_value(&FieldValue::Map(row.clone()));
			w.write_long(0);
			w.write_binary(Some(&[1, 2, 3]));
			w.write_long(123);
		}
		let mut r = BinaryReader::new(&buf, ProtocolVersion::V3);
		let (got_row, _exp, version, mod_time) = r.read_row_response().unwrap().unwrap();
		assert_eq!(got_row, row);
		assert_eq!(version, vec![1, 2, 3]);
		assert_eq!(mod_time, Some(123));
	}
}
