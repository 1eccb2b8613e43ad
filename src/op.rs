// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operation registry (§4.8): one descriptor per operation, each knowing
//! how to validate itself, pick defaults, and serialize/deserialize itself
//! against whichever protocol version is currently active. This replaces an
//! inheritance hierarchy of per-operation serializer classes with a flat set
//! of descriptors plus a version match inside each one (§9).

use std::collections::HashMap;
use std::sync::Arc;

use nosqldb_codec::ResizableBuffer;

use crate::error::{NoSQLError, Result};
use crate::field_value::{FieldValue, MapValue};
use crate::nson::{self, keys, MapCursor, NsonReader, NsonWriter};
use crate::prepared_statement::PreparedStatement;
use crate::protocol::binary::{BinaryReader, BinaryWriter};
use crate::protocol::ProtocolVersion;
use crate::request::Request;
use crate::types::{
	Capacity, CapacityMode, Consistency, ContinuationKey, FieldRange, OpCode, TableLimits, TableState, TopologyInfo,
};

/// The typed outcome of one operation, covering every op this registry
/// knows about.
#[derive(Debug)]
pub enum OpResult {
	Get {
		row: Option<MapValue>,
		version: Option<Vec<u8>>,
		expiration: i64,
		capacity: Capacity,
	},
	Put {
		success: bool,
		version: Option<Vec<u8>>,
		existing_version: Option<Vec<u8>>,
		existing_value: Option<MapValue>,
		capacity: Capacity,
	},
	Delete {
		success: bool,
		existing_version: Option<Vec<u8>>,
		existing_value: Option<MapValue>,
		capacity: Capacity,
	},
	MultiDelete {
		num_deletions: i32,
		continuation_key: ContinuationKey,
		capacity: Capacity,
	},
	Query {
		rows: Vec<MapValue>,
		continuation_key: ContinuationKey,
		capacity: Capacity,
	},
	Prepare {
		statement: Arc<PreparedStatement>,
	},
	Table {
		table_name: String,
		state: TableState,
		limits: TableLimits,
	},
	ListTables {
		tables: Vec<String>,
	},
	WriteMultiple {
		success: bool,
		failed_op_index: Option<i32>,
		results: Vec<WriteOpOutcome>,
	},
}

#[derive(Clone, Debug)]
pub struct WriteOpOutcome {
	pub success: bool,
	pub version: Option<Vec<u8>>,
	pub existing_value: Option<MapValue>,
}

/// Per-operation hooks (§4.8). Protocol-version dispatch happens as a match
/// inside `serialize`/`deserialize` rather than a separate lookup table —
/// the table *is* the set of `Op` impls, indexed by `OpCode` in
/// [`OpRegistry`].
pub trait Op: Send + Sync {
	fn op_code(&self) -> OpCode;

	/// Argument checks, numeric-range checks, enum conversions (§4.8
	/// `validate`). The 2 MB request-size and batch-write limits (25 MB / 50
	/// entries) are enforced by the pipeline once the body is serialized,
	/// not here.
	fn validate(&self, req: &Request) -> Result<()>;

	/// `false` for DDL, list, usage, admin, prepare (§4.8 `shouldRetry`).
	fn should_retry(&self) -> bool {
		true
	}

	fn supports_rate_limiting(&self) -> bool {
		false
	}

	fn does_reads(&self) -> bool {
		false
	}

	fn does_writes(&self) -> bool {
		false
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()>;

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult>;
}

fn write_nson_header(w: &mut NsonWriter<'_>, req: &Request, op_code: OpCode) {
	w.start_request();
	w.start_header();
	w.write_int_field(keys::VERSION, i32::from(ProtocolVersion::V4.as_u16()));
	w.write_int_field(keys::OP_CODE, op_code as i32);
	w.write_long_field(keys::TIMEOUT, req.options.timeout.as_millis() as i64);
	if let Some(table_name) = req.table_name() {
		w.write_string_field(keys::TABLE_NAME, table_name);
	}
	if let Some(ps) = &req.prepared_statement {
		let seq_num = ps.topology().seq_num;
		if seq_num >= 0 {
			w.write_int_field(keys::PROXY_TOPO_SEQNUM, seq_num);
		}
	}
	w.end_header();
}

/// Reads the standard response envelope (`ERROR_CODE`, `EXCEPTION`,
/// `CONSUMED`, `TOPOLOGY_INFO`) and enters the `PAYLOAD` map, leaving the
/// caller to walk payload-specific keys. Returns the consumed-capacity seen,
/// defaulting to zero if the response carried none (admin/DDL responses),
/// and the topology info seen, if any (§4.4 `TOPOLOGY_INFO`).
fn read_nson_envelope(reader: &mut NsonReader<'_>) -> Result<(MapCursor<'_, '_>, Capacity, Option<TopologyInfo>)> {
	let mut top = MapCursor::enter(reader)?;
	let mut capacity = Capacity::default();
	let mut topology = None;
	while top.has_next() {
		top.next()?;
		match top.current_name() {
			keys::ERROR_CODE => {
				let code = match top.read_value()? {
					FieldValue::Integer(i) => i,
					other => {
						return Err(NoSQLError::Protocol {
							operation: "nson-envelope".to_string(),
							detail: format!("ERROR_CODE was not an integer: {other:?}"),
						})
					}
				};
				if code != 0 {
					let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
					return Err(NoSQLError::server(ec, format!("server error code {code}")));
				}
			}
			keys::EXCEPTION => {
				top.skip_value()?;
			}
			keys::CONSUMED => {
				let mut c = MapCursor::enter(top.reader_mut())?;
				while c.has_next() {
					c.next()?;
					match c.current_name() {
						keys::READ_UNITS => capacity.read_units = read_i32(&mut c)?,
						keys::READ_KB => capacity.read_kb = read_i32(&mut c)?,
						keys::WRITE_KB => capacity.write_kb = read_i32(&mut c)?,
						_ => c.skip_value()?,
					}
				}
				c.finish()?;
			}
			keys::TOPOLOGY_INFO => {
				let mut t = MapCursor::enter(top.reader_mut())?;
				let mut seq_num = -1;
				let mut shard_ids = Vec::new();
				while t.has_next() {
					t.next()?;
					match t.current_name() {
						keys::PROXY_TOPO_SEQNUM => seq_num = read_i32(&mut t)?,
						keys::SHARD_IDS => {
							if let FieldValue::Array(items) = t.read_value()? {
								shard_ids = items
									.into_iter()
									.filter_map(|v| match v {
										FieldValue::Integer(i) => Some(i),
										_ => None,
									})
									.collect();
							}
						}
						_ => t.skip_value()?,
					}
				}
				t.finish()?;
				topology = Some(TopologyInfo { seq_num, shard_ids });
			}
			keys::PAYLOAD => {
				return Ok((MapCursor::enter(top.reader_mut())?, capacity, topology));
			}
			_ => top.skip_value()?,
		}
	}
	Err(NoSQLError::Protocol {
		operation: "nson-envelope".to_string(),
		detail: "response had no PAYLOAD map".to_string(),
	})
}

fn read_i32(c: &mut MapCursor<'_, '_>) -> Result<i32> {
	match c.read_value()? {
		FieldValue::Integer(i) => Ok(i),
		other => Err(NoSQLError::Protocol {
			operation: "nson-envelope".to_string(),
			detail: format!("expected INTEGER, found {other:?}"),
		}),
	}
}

/// `Get`. Positional binary fields: timeout, table name, consistency, key.
pub struct GetOp;

impl Op for GetOp {
	fn op_code(&self) -> OpCode {
		OpCode::Get
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.table_name().is_none() {
			return Err(NoSQLError::Argument("Get requires a table name".to_string()));
		}
		if req.key.is_none() {
			return Err(NoSQLError::Argument("Get requires a key".to_string()));
		}
		Ok(())
	}

	fn supports_rate_limiting(&self) -> bool {
		true
	}

	fn does_reads(&self) -> bool {
		true
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		let key = req.key.as_ref().expect("validated");
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::Get);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.write_int_field(keys::CONSISTENCY, req.options.consistency as i32);
			w.write_map_field(keys::KEY, key);
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::Get as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_string(req.table_name());
			let off = w.buf.len();
			w.buf.write_u8(req.options.consistency as u8, off);
			w.write_field_value(&FieldValue::Map(key.clone()));
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		if version.is_nson() {
			let mut reader = NsonReader::new(buf);
			let (mut payload, mut capacity, _topology) = read_nson_envelope(&mut reader)?;
			let mut row = None;
			let mut version_bytes = None;
			let mut expiration = 0i64;
			while payload.has_next() {
				payload.next()?;
				match payload.current_name() {
					keys::ROW => {
						row = match payload.read_value()? {
							FieldValue::Map(m) => Some(m),
							FieldValue::Null | FieldValue::JsonNull => None,
							_ => None,
						}
					}
					keys::ROW_VERSION | keys::VERSION => {
						version_bytes = match payload.read_value()? {
							FieldValue::Binary(b) => Some(b),
							_ => None,
						}
					}
					keys::EXPIRATION => expiration = read_long(&mut payload)?,
					keys::CONSUMED => {
						let mut c = MapCursor::enter(payload.reader_mut())?;
						while c.has_next() {
							c.next()?;
							match c.current_name() {
								keys::READ_UNITS => capacity.read_units = read_i32(&mut c)?,
								keys::READ_KB => capacity.read_kb = read_i32(&mut c)?,
								keys::WRITE_KB => capacity.write_kb = read_i32(&mut c)?,
								_ => c.skip_value()?,
							}
						}
						c.finish()?;
					}
					_ => payload.skip_value()?,
				}
			}
			payload.finish()?;
			Ok(OpResult::Get {
				row,
				version: version_bytes,
				expiration,
				capacity,
			})
		} else {
			let mut r = BinaryReader::new(buf, version);
			let code = r.read_error_code()?;
			if code != 0 {
				let msg = r.read_error_message()?;
				let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
				return Err(NoSQLError::server(ec, msg));
			}
			let capacity = r.read_consumed_capacity()?;
			let row_resp = r.read_row_response()?;
			let _ = req;
			match row_resp {
				None => Ok(OpResult::Get {
					row: None,
					version: None,
					expiration: 0,
					capacity,
				}),
				Some((row, expiration, version_bytes, _mod_time)) => Ok(OpResult::Get {
					row: Some(row),
					version: Some(version_bytes),
					expiration,
					capacity,
				}),
			}
		}
	}
}

fn read_long(c: &mut MapCursor<'_, '_>) -> Result<i64> {
	match c.read_value()? {
		FieldValue::Long(l) => Ok(l),
		FieldValue::Integer(i) => Ok(i64::from(i)),
		other => Err(NoSQLError::Protocol {
			operation: "nson-envelope".to_string(),
			detail: format!("expected LONG, found {other:?}"),
		}),
	}
}

/// `Put` (covers plain put, `putIfAbsent`, `putIfPresent`, `putIfVersion` —
/// selected by `req.put_option`).
pub struct PutOp;

impl Op for PutOp {
	fn op_code(&self) -> OpCode {
		OpCode::Put
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.table_name().is_none() {
			return Err(NoSQLError::Argument("Put requires a table name".to_string()));
		}
		if req.value.is_none() {
			return Err(NoSQLError::Argument("Put requires a row value".to_string()));
		}
		Ok(())
	}

	fn supports_rate_limiting(&self) -> bool {
		true
	}

	fn does_writes(&self) -> bool {
		true
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		let row = req.value.as_ref().expect("validated");
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::Put);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.write_map_field(keys::VALUE, row);
			w.write_bool_field(keys::RETURN_ROW, req.return_existing);
			if let Some(ttl) = req.ttl {
				let (value, unit) = ttl.to_wire();
				w.write_long_field(keys::TTL, value);
				w.write_bool_field(keys::UPDATE_TTL, req.update_ttl);
				let _ = unit;
			}
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::Put as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_string(req.table_name());
			w.write_boolean(req.return_existing);
			w.write_durability(req.options.durability);
			w.write_field_value(&FieldValue::Map(row.clone()));
			w.write_ttl(req.ttl.unwrap_or(crate::types::Ttl::Unset));
			w.write_boolean(req.update_ttl);
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		let _ = req;
		if version.is_nson() {
			let mut reader = NsonReader::new(buf);
			let (mut payload, mut capacity, _topology) = read_nson_envelope(&mut reader)?;
			let mut success = true;
			let mut version_bytes = None;
			let mut existing_version = None;
			let mut existing_value = None;
			while payload.has_next() {
				payload.next()?;
				match payload.current_name() {
					keys::SUCCESS => {
						success = matches!(payload.read_value()?, FieldValue::Boolean(true));
					}
					keys::ROW_VERSION => {
						version_bytes = match payload.read_value()? {
							FieldValue::Binary(b) => Some(b),
							_ => None,
						}
					}
					keys::EXISTING_VERSION => {
						existing_version = match payload.read_value()? {
							FieldValue::Binary(b) => Some(b),
							_ => None,
						}
					}
					keys::EXISTING_VALUE => {
						existing_value = match payload.read_value()? {
							FieldValue::Map(m) => Some(m),
							_ => None,
						}
					}
					keys::CONSUMED => {
						let mut c = MapCursor::enter(payload.reader_mut())?;
						while c.has_next() {
							c.next()?;
							match c.current_name() {
								keys::READ_UNITS => capacity.read_units = read_i32(&mut c)?,
								keys::READ_KB => capacity.read_kb = read_i32(&mut c)?,
								keys::WRITE_KB => capacity.write_kb = read_i32(&mut c)?,
								_ => c.skip_value()?,
							}
						}
						c.finish()?;
					}
					_ => payload.skip_value()?,
				}
			}
			payload.finish()?;
			Ok(OpResult::Put {
				success,
				version: version_bytes,
				existing_version,
				existing_value,
				capacity,
			})
		} else {
			let mut r = BinaryReader::new(buf, version);
			let code = r.read_error_code()?;
			if code != 0 {
				let msg = r.read_error_message()?;
				let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
				return Err(NoSQLError::server(ec, msg));
			}
			let capacity = r.read_consumed_capacity()?;
			let success = r.read_boolean()?;
			let version_bytes = if success { r.read_binary()? } else { None };
			Ok(OpResult::Put {
				success,
				version: version_bytes,
				existing_version: None,
				existing_value: None,
				capacity,
			})
		}
	}
}

/// `Delete` (covers plain delete and `deleteIfVersion`).
pub struct DeleteOp;

impl Op for DeleteOp {
	fn op_code(&self) -> OpCode {
		OpCode::Delete
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.table_name().is_none() || req.key.is_none() {
			return Err(NoSQLError::Argument("Delete requires a table name and key".to_string()));
		}
		Ok(())
	}

	fn supports_rate_limiting(&self) -> bool {
		true
	}

	fn does_writes(&self) -> bool {
		true
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		let key = req.key.as_ref().expect("validated");
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::Delete);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.write_map_field(keys::KEY, key);
			w.write_bool_field(keys::RETURN_ROW, req.return_existing);
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::Delete as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_string(req.table_name());
			w.write_boolean(req.return_existing);
			w.write_durability(req.options.durability);
			w.write_field_value(&FieldValue::Map(key.clone()));
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		let _ = req;
		if version.is_nson() {
			let mut reader = NsonReader::new(buf);
			let (mut payload, mut capacity, _topology) = read_nson_envelope(&mut reader)?;
			let mut success = false;
			let mut existing_version = None;
			let mut existing_value = None;
			while payload.has_next() {
				payload.next()?;
				match payload.current_name() {
					keys::SUCCESS => success = matches!(payload.read_value()?, FieldValue::Boolean(true)),
					keys::EXISTING_VERSION => {
						existing_version = match payload.read_value()? {
							FieldValue::Binary(b) => Some(b),
							_ => None,
						}
					}
					keys::EXISTING_VALUE => {
						existing_value = match payload.read_value()? {
							FieldValue::Map(m) => Some(m),
							_ => None,
						}
					}
					keys::CONSUMED => {
						let mut c = MapCursor::enter(payload.reader_mut())?;
						while c.has_next() {
							c.next()?;
							match c.current_name() {
								keys::READ_UNITS => capacity.read_units = read_i32(&mut c)?,
								keys::READ_KB => capacity.read_kb = read_i32(&mut c)?,
								keys::WRITE_KB => capacity.write_kb = read_i32(&mut c)?,
								_ => c.skip_value()?,
							}
						}
						c.finish()?;
					}
					_ => payload.skip_value()?,
				}
			}
			payload.finish()?;
			Ok(OpResult::Delete {
				success,
				existing_version,
				existing_value,
				capacity,
			})
		} else {
			let mut r = BinaryReader::new(buf, version);
			let code = r.read_error_code()?;
			if code != 0 {
				let msg = r.read_error_message()?;
				let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
				return Err(NoSQLError::server(ec, msg));
			}
			let capacity = r.read_consumed_capacity()?;
			let success = r.read_boolean()?;
			Ok(OpResult::Delete {
				success,
				existing_version: None,
				existing_value: None,
				capacity,
			})
		}
	}
}

/// `MultiDelete`: deletes every row in a shard matching a key prefix plus an
/// optional [`FieldRange`], one page per call (the `opt.all` looping
/// behavior belongs to the out-of-scope public API, not this core — see
/// DESIGN.md open question).
pub struct MultiDeleteOp;

impl Op for MultiDeleteOp {
	fn op_code(&self) -> OpCode {
		OpCode::MultiDelete
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.table_name().is_none() || req.key.is_none() {
			return Err(NoSQLError::Argument("MultiDelete requires a table name and partial key".to_string()));
		}
		Ok(())
	}

	fn supports_rate_limiting(&self) -> bool {
		true
	}

	fn does_writes(&self) -> bool {
		true
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		let key = req.key.as_ref().expect("validated");
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::MultiDelete);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.write_map_field(keys::KEY, key);
			if let Some(ck) = req.continuation_key_bytes() {
				w.write_binary_field(keys::CONTINUATION_KEY, ck);
			}
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::MultiDelete as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_string(req.table_name());
			w.write_durability(req.options.durability);
			w.write_field_value(&FieldValue::Map(key.clone()));
			w.write_field_range(req.field_range.as_ref());
			w.write_binary(req.continuation_key_bytes());
			w.write_int(req.max_write_kb);
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		let _ = req;
		if version.is_nson() {
			let mut reader = NsonReader::new(buf);
			let (mut payload, mut capacity, _topology) = read_nson_envelope(&mut reader)?;
			let mut num_deletions = 0;
			let mut continuation_key = ContinuationKey::None;
			while payload.has_next() {
				payload.next()?;
				match payload.current_name() {
					keys::NUM_DELETIONS => num_deletions = read_i32(&mut payload)?,
					keys::CONTINUATION_KEY => {
						continuation_key = match payload.read_value()? {
							FieldValue::Binary(b) if !b.is_empty() => ContinuationKey::Bytes(b),
							_ => ContinuationKey::None,
						}
					}
					keys::CONSUMED => {
						let mut c = MapCursor::enter(payload.reader_mut())?;
						while c.has_next() {
							c.next()?;
							match c.current_name() {
								keys::READ_UNITS => capacity.read_units = read_i32(&mut c)?,
								keys::READ_KB => capacity.read_kb = read_i32(&mut c)?,
								keys::WRITE_KB => capacity.write_kb = read_i32(&mut c)?,
								_ => c.skip_value()?,
							}
						}
						c.finish()?;
					}
					_ => payload.skip_value()?,
				}
			}
			payload.finish()?;
			Ok(OpResult::MultiDelete {
				num_deletions,
				continuation_key,
				capacity,
			})
		} else {
			let mut r = BinaryReader::new(buf, version);
			let code = r.read_error_code()?;
			if code != 0 {
				let msg = r.read_error_message()?;
				let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
				return Err(NoSQLError::server(ec, msg));
			}
			let capacity = r.read_consumed_capacity()?;
			let num_deletions = r.read_int()?;
			let continuation_key = match r.read_binary()? {
				Some(b) if !b.is_empty() => ContinuationKey::Bytes(b),
				_ => ContinuationKey::None,
			};
			Ok(OpResult::MultiDelete {
				num_deletions,
				continuation_key,
				capacity,
			})
		}
	}
}

/// `Query`: executes a prepared (or simple, server-planned) statement for
/// one page. Sort/group/advanced-query plan interpretation is out of scope
/// (§1) — this op only carries the wire envelope.
pub struct QueryOp;

impl Op for QueryOp {
	fn op_code(&self) -> OpCode {
		OpCode::Query
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.prepared_statement.is_none() && req.statement.is_none() {
			return Err(NoSQLError::Argument("Query requires a statement or a prepared statement".to_string()));
		}
		Ok(())
	}

	fn supports_rate_limiting(&self) -> bool {
		true
	}

	fn does_reads(&self) -> bool {
		true
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::Query);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			if let Some(ps) = &req.prepared_statement {
				w.write_binary_field(keys::PREPARED_QUERY, ps.statement_blob());
				w.write_bool_field(keys::IS_PREPARED, true);
				if !req.bind_variables.is_empty() {
					let bv: MapValue = req.bind_variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
					w.write_map_field(keys::BIND_VARIABLES, &bv);
				}
			} else if let Some(stmt) = &req.statement {
				w.write_string_field(keys::STATEMENT, stmt);
			}
			if let Some(ck) = req.continuation_key_bytes() {
				w.write_binary_field(keys::CONTINUATION_KEY, ck);
			}
			w.write_positive_int_field(keys::MAX_READ_KB, req.max_read_kb);
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::Query as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			let off = w.buf.len();
			w.buf.write_u8(req.options.consistency as u8, off);
			w.write_int(req.max_read_kb);
			w.write_binary(req.continuation_key_bytes());
			match &req.prepared_statement {
				Some(ps) => {
					w.write_boolean(true);
					w.write_binary2(ps.statement_blob());
				}
				None => {
					w.write_boolean(false);
					w.write_string(req.statement.as_deref());
				}
			}
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		if version.is_nson() {
			let mut reader = NsonReader::new(buf);
			let (mut payload, mut capacity, topology) = read_nson_envelope(&mut reader)?;
			if let (Some(topology), Some(ps)) = (&topology, &req.prepared_statement) {
				ps.merge_topology(topology);
			}
			let mut rows = Vec::new();
			let mut continuation_key = ContinuationKey::None;
			while payload.has_next() {
				payload.next()?;
				match payload.current_name() {
					keys::QUERY_RESULTS => {
						let arr = payload.read_value()?;
						if let FieldValue::Array(items) = arr {
							for item in items {
								if let FieldValue::Map(m) = item {
									rows.push(m);
								}
							}
						}
					}
					keys::CONTINUATION_KEY => {
						continuation_key = match payload.read_value()? {
							FieldValue::Binary(b) if !b.is_empty() => ContinuationKey::Bytes(b),
							_ => ContinuationKey::None,
						}
					}
					keys::CONSUMED => {
						let mut c = MapCursor::enter(payload.reader_mut())?;
						while c.has_next() {
							c.next()?;
							match c.current_name() {
								keys::READ_UNITS => capacity.read_units = read_i32(&mut c)?,
								keys::READ_KB => capacity.read_kb = read_i32(&mut c)?,
								keys::WRITE_KB => capacity.write_kb = read_i32(&mut c)?,
								_ => c.skip_value()?,
							}
						}
						c.finish()?;
					}
					_ => payload.skip_value()?,
				}
			}
			payload.finish()?;
			Ok(OpResult::Query {
				rows,
				continuation_key,
				capacity,
			})
		} else {
			let mut r = BinaryReader::new(buf, version);
			let code = r.read_error_code()?;
			if code != 0 {
				let msg = r.read_error_message()?;
				let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
				return Err(NoSQLError::server(ec, msg));
			}
			let capacity = r.read_consumed_capacity()?;
			let n = r.read_int()?;
			let mut rows = Vec::with_capacity(n.max(0) as usize);
			for _ in 0..n {
				if let FieldValue::Map(m) = r.read_field_value()? {
					rows.push(m);
				}
			}
			let continuation_key = match r.read_binary()? {
				Some(b) if !b.is_empty() => ContinuationKey::Bytes(b),
				_ => ContinuationKey::None,
			};
			Ok(OpResult::Query {
				rows,
				continuation_key,
				capacity,
			})
		}
	}
}

/// `Prepare`: compiles a query statement into a [`PreparedStatement`].
pub struct PrepareOp;

impl Op for PrepareOp {
	fn op_code(&self) -> OpCode {
		OpCode::Prepare
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.statement.is_none() {
			return Err(NoSQLError::Argument("Prepare requires a statement".to_string()));
		}
		Ok(())
	}

	fn should_retry(&self) -> bool {
		false
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		let stmt = req.statement.as_deref().expect("validated");
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::Prepare);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.write_string_field(keys::STATEMENT, stmt);
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::Prepare as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_string(Some(stmt));
			let off = w.buf.len();
			w.buf.write_u8(1, off); // query version
			w.write_boolean(false); // get-query-plan printout
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		let blob;
		let printout;
		let capacity_consumed;
		if version.is_nson() {
			let mut reader = NsonReader::new(buf);
			let (mut payload, capacity, _topology) = read_nson_envelope(&mut reader)?;
			capacity_consumed = capacity;
			let mut found_blob = Vec::new();
			let mut found_printout = None;
			while payload.has_next() {
				payload.next()?;
				match payload.current_name() {
					keys::PREPARED_STATEMENT => {
						found_blob = match payload.read_value()? {
							FieldValue::Binary(b) => b,
							_ => Vec::new(),
						}
					}
					keys::DRIVER_QUERY_PLAN => {
						found_printout = match payload.read_value()? {
							FieldValue::String(s) => Some(s),
							_ => None,
						}
					}
					_ => payload.skip_value()?,
				}
			}
			payload.finish()?;
			blob = found_blob;
			printout = found_printout;
		} else {
			let mut r = BinaryReader::new(buf, version);
			let code = r.read_error_code()?;
			if code != 0 {
				let msg = r.read_error_message()?;
				let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
				return Err(NoSQLError::server(ec, msg));
			}
			capacity_consumed = r.read_consumed_capacity()?;
			blob = r.read_binary2()?;
			printout = r.read_string()?;
		}
		let _ = capacity_consumed;
		let statement = PreparedStatement::new(req.statement.clone(), blob, printout, None, HashMap::new())?;
		Ok(OpResult::Prepare {
			statement: Arc::new(statement),
		})
	}
}

/// `TableRequest`: submits a DDL statement (create/alter/drop table or
/// index); completion is polled externally via `GetTable` (§8 Scenario E is
/// out of this core's scope to drive, only to report state).
pub struct TableRequestOp;

impl Op for TableRequestOp {
	fn op_code(&self) -> OpCode {
		OpCode::TableRequest
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.statement.is_none() {
			return Err(NoSQLError::Argument("TableRequest requires a DDL statement".to_string()));
		}
		Ok(())
	}

	fn should_retry(&self) -> bool {
		false
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		let stmt = req.statement.as_deref().expect("validated");
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::TableRequest);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.write_string_field(keys::TABLE_DDL, stmt);
			if let Some(limits) = &req.table_limits {
				w.write_field_name(keys::LIMITS);
				w.start_map();
				w.write_int_field(keys::READ_UNITS, limits.read_units);
				w.write_int_field(keys::WRITE_UNITS, limits.write_units);
				w.write_int_field(keys::STORAGE_GB, limits.storage_gb);
				w.write_int_field(keys::LIMITS_MODE, limits.mode as i32);
				w.end_map();
			}
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::TableRequest as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_string(Some(stmt));
			match &req.table_limits {
				Some(limits) => {
					w.write_boolean(true);
					w.write_int(limits.read_units);
					w.write_int(limits.write_units);
					w.write_int(limits.storage_gb);
				}
				None => w.write_boolean(false),
			}
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		parse_table_result(version, buf, req)
	}
}

/// `GetTable`: polls the current state/limits of a table.
pub struct GetTableOp;

impl Op for GetTableOp {
	fn op_code(&self) -> OpCode {
		OpCode::GetTable
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.table_name().is_none() {
			return Err(NoSQLError::Argument("GetTable requires a table name".to_string()));
		}
		Ok(())
	}

	fn should_retry(&self) -> bool {
		false
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::GetTable);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::GetTable as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_string(req.table_name());
			w.write_string(None); // operation id, unused by this core
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		parse_table_result(version, buf, req)
	}
}

fn parse_table_result(version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
	if version.is_nson() {
		let mut reader = NsonReader::new(buf);
		let (mut payload, _capacity, _topology) = read_nson_envelope(&mut reader)?;
		let mut table_name = req.table_name().unwrap_or_default().to_string();
		let mut state = TableState::Active;
		let mut limits = TableLimits::default();
		while payload.has_next() {
			payload.next()?;
			match payload.current_name() {
				keys::TABLE_NAME => {
					if let FieldValue::String(s) = payload.read_value()? {
						table_name = s;
					}
				}
				keys::TABLE_STATE => {
					if let FieldValue::Integer(i) = payload.read_value()? {
						state = TableState::from_i32(i).unwrap_or(TableState::Active);
					}
				}
				keys::LIMITS => {
					let mut c = MapCursor::enter(payload.reader_mut())?;
					while c.has_next() {
						c.next()?;
						match c.current_name() {
							keys::READ_UNITS => limits.read_units = read_i32(&mut c)?,
							keys::WRITE_UNITS => limits.write_units = read_i32(&mut c)?,
							keys::STORAGE_GB => limits.storage_gb = read_i32(&mut c)?,
							keys::LIMITS_MODE => {
								limits.mode = if read_i32(&mut c)? == CapacityMode::OnDemand as i32 {
									CapacityMode::OnDemand
								} else {
									CapacityMode::Provisioned
								}
							}
							_ => c.skip_value()?,
						}
					}
					c.finish()?;
				}
				_ => payload.skip_value()?,
			}
		}
		payload.finish()?;
		Ok(OpResult::Table { table_name, state, limits })
	} else {
		let mut r = BinaryReader::new(buf, version);
		let code = r.read_error_code()?;
		if code != 0 {
			let msg = r.read_error_message()?;
			let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
			return Err(NoSQLError::server(ec, msg));
		}
		let table_name = r.read_string()?.unwrap_or_else(|| req.table_name().unwrap_or_default().to_string());
		let state_i = r.read_int()?;
		let state = TableState::from_i32(state_i).unwrap_or(TableState::Active);
		let limits = TableLimits {
			read_units: r.read_int()?,
			write_units: r.read_int()?,
			storage_gb: r.read_int()?,
			mode: CapacityMode::Provisioned,
		};
		Ok(OpResult::Table { table_name, state, limits })
	}
}

/// `ListTables`.
pub struct ListTablesOp;

impl Op for ListTablesOp {
	fn op_code(&self) -> OpCode {
		OpCode::ListTables
	}

	fn validate(&self, _req: &Request) -> Result<()> {
		Ok(())
	}

	fn should_retry(&self) -> bool {
		false
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::ListTables);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::ListTables as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_int(0); // start index
			w.write_int(0); // limit (0 = server default)
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		let _ = req;
		if version.is_nson() {
			let mut reader = NsonReader::new(buf);
			let (mut payload, _capacity, _topology) = read_nson_envelope(&mut reader)?;
			let mut tables = Vec::new();
			while payload.has_next() {
				payload.next()?;
				match payload.current_name() {
					keys::TABLES => {
						if let FieldValue::Array(items) = payload.read_value()? {
							for item in items {
								if let FieldValue::String(s) = item {
									tables.push(s);
								}
							}
						}
					}
					_ => payload.skip_value()?,
				}
			}
			payload.finish()?;
			Ok(OpResult::ListTables { tables })
		} else {
			let mut r = BinaryReader::new(buf, version);
			let code = r.read_error_code()?;
			if code != 0 {
				let msg = r.read_error_message()?;
				let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
				return Err(NoSQLError::server(ec, msg));
			}
			let n = r.read_int()?;
			let mut tables = Vec::with_capacity(n.max(0) as usize);
			for _ in 0..n {
				if let Some(name) = r.read_string()? {
					tables.push(name);
				}
			}
			Ok(OpResult::ListTables { tables })
		}
	}
}

/// `WriteMultiple`: a batch of put/delete sub-operations, optionally
/// aborting the whole batch on the first failure (§8 Scenario D).
pub struct WriteMultipleOp;

impl Op for WriteMultipleOp {
	fn op_code(&self) -> OpCode {
		OpCode::WriteMultiple
	}

	fn validate(&self, req: &Request) -> Result<()> {
		if req.sub_operations.is_empty() {
			return Err(NoSQLError::Argument("WriteMultiple requires at least one sub-operation".to_string()));
		}
		if req.sub_operations.len() > 50 {
			return Err(NoSQLError::Argument("WriteMultiple supports at most 50 sub-operations".to_string()));
		}
		Ok(())
	}

	fn supports_rate_limiting(&self) -> bool {
		true
	}

	fn does_writes(&self) -> bool {
		true
	}

	fn serialize(&self, version: ProtocolVersion, buf: &mut ResizableBuffer, req: &Request) -> Result<()> {
		if version.is_nson() {
			let mut w = NsonWriter::new(buf);
			write_nson_header(&mut w, req, OpCode::WriteMultiple);
			w.write_field_name(keys::PAYLOAD);
			w.start_map();
			w.write_true_bool_field(keys::ABORT_ON_FAIL, req.abort_on_fail);
			w.write_field_name(keys::OPERATIONS);
			w.start_array();
			for sub in &req.sub_operations {
				w.start_map();
				w.write_bool_field(keys::TYPE, sub.is_put);
				if sub.is_put {
					w.write_map_field(keys::VALUE, &sub.row);
				} else {
					w.write_map_field(keys::KEY, &sub.row);
				}
				w.write_bool_field(keys::RETURN_ROW, sub.return_existing);
				w.end_map();
			}
			w.end_array();
			w.end_map();
			w.end_request();
		} else {
			let mut w = BinaryWriter::new(buf, version);
			w.write_request_header(OpCode::WriteMultiple as u8);
			w.write_int(req.options.timeout.as_millis() as i32);
			w.write_string(req.table_name());
			w.write_boolean(req.abort_on_fail);
			w.write_int(req.sub_operations.len() as i32);
			for sub in &req.sub_operations {
				w.write_boolean(sub.is_put);
				w.write_field_value(&FieldValue::Map(sub.row.clone()));
				w.write_boolean(sub.return_existing);
				if sub.is_put {
					w.write_boolean(sub.if_absent);
				}
			}
		}
		Ok(())
	}

	fn deserialize(&self, version: ProtocolVersion, buf: &ResizableBuffer, req: &Request) -> Result<OpResult> {
		let _ = req;
		if version.is_nson() {
			let mut reader = NsonReader::new(buf);
			let (mut payload, _capacity, _topology) = read_nson_envelope(&mut reader)?;
			let mut success = true;
			let mut failed_op_index = None;
			let mut results = Vec::new();
			while payload.has_next() {
				payload.next()?;
				match payload.current_name() {
					keys::WM_SUCCESS => success = matches!(payload.read_value()?, FieldValue::Boolean(true)),
					keys::WM_FAIL_INDEX => failed_op_index = Some(read_i32(&mut payload)?),
					keys::OPERATIONS => {
						if let FieldValue::Array(items) = payload.read_value()? {
							for item in items {
								if let FieldValue::Map(m) = item {
									let ok = matches!(m.get(keys::SUCCESS), Some(FieldValue::Boolean(true)));
									let version = match m.get(keys::ROW_VERSION) {
										Some(FieldValue::Binary(b)) => Some(b.clone()),
										_ => None,
									};
									let existing = match m.get(keys::EXISTING_VALUE) {
										Some(FieldValue::Map(mv)) => Some(mv.clone()),
										_ => None,
									};
									results.push(WriteOpOutcome {
										success: ok,
										version,
										existing_value: existing,
									});
								}
							}
						}
					}
					_ => payload.skip_value()?,
				}
			}
			payload.finish()?;
			Ok(OpResult::WriteMultiple {
				success,
				failed_op_index,
				results,
			})
		} else {
			let mut r = BinaryReader::new(buf, version);
			let code = r.read_error_code()?;
			if code != 0 {
				let msg = r.read_error_message()?;
				let ec = crate::error::ErrorCode::from_i32(code).unwrap_or(crate::error::ErrorCode::UnknownError);
				return Err(NoSQLError::server(ec, msg));
			}
			let success = r.read_boolean()?;
			let failed_op_index = if success { None } else { Some(r.read_int()?) };
			let count = r.read_int()?;
			let mut results = Vec::with_capacity(count.max(0) as usize);
			for _ in 0..count {
				let ok = r.read_boolean()?;
				let version = if ok { r.read_binary()? } else { None };
				results.push(WriteOpOutcome {
					success: ok,
					version,
					existing_value: None,
				});
			}
			Ok(OpResult::WriteMultiple {
				success,
				failed_op_index,
				results,
			})
		}
	}
}

/// One sub-operation inside a [`WriteMultipleOp`] batch.
#[derive(Clone, Debug)]
pub struct WriteSubOp {
	pub is_put: bool,
	pub if_absent: bool,
	pub return_existing: bool,
	/// The row (put) or key (delete).
	pub row: MapValue,
}

/// Looks up the `Op` descriptor for an opcode. Stands in for the
/// protocol-version-indexed dispatch table of §9: here the table is indexed
/// by `OpCode` alone, with the version handled inside each `Op`'s own
/// `serialize`/`deserialize`.
pub struct OpRegistry {
	ops: HashMap<OpCode, Arc<dyn Op>>,
}

impl Default for OpRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl OpRegistry {
	#[must_use]
	pub fn new() -> Self {
		let mut ops: HashMap<OpCode, Arc<dyn Op>> = HashMap::new();
		ops.insert(OpCode::Get, Arc::new(GetOp));
		ops.insert(OpCode::Put, Arc::new(PutOp));
		ops.insert(OpCode::Delete, Arc::new(DeleteOp));
		ops.insert(OpCode::MultiDelete, Arc::new(MultiDeleteOp));
		ops.insert(OpCode::Query, Arc::new(QueryOp));
		ops.insert(OpCode::Prepare, Arc::new(PrepareOp));
		ops.insert(OpCode::TableRequest, Arc::new(TableRequestOp));
		ops.insert(OpCode::GetTable, Arc::new(GetTableOp));
		ops.insert(OpCode::ListTables, Arc::new(ListTablesOp));
		ops.insert(OpCode::WriteMultiple, Arc::new(WriteMultipleOp));
		Self { ops }
	}

	#[must_use]
	pub fn get(&self, op_code: OpCode) -> Option<Arc<dyn Op>> {
		self.ops.get(&op_code).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::request::RequestOptions;
	use std::time::Duration;

	fn opts() -> RequestOptions {
		RequestOptions {
			timeout: Duration::from_secs(5),
			consistency: Consistency::Eventual,
			durability: None,
			compartment: None,
			namespace: None,
		}
	}

	#[test]
	fn get_round_trips_through_nson() {
		let mut key = MapValue::new();
		key.insert("id", FieldValue::Integer(1));
		let mut req = Request::new(Arc::new(GetOp), opts(), ProtocolVersion::V4, 1);
		req.set_table_name("orders");
		req.key = Some(key);

		let op = GetOp;
		op.validate(&req).unwrap();
		let mut buf = ResizableBuffer::new();
		op.serialize(ProtocolVersion::V4, &mut buf, &req).unwrap();

		// Build a synthetic success response carrying the same row back.
		let mut resp = ResizableBuffer::new();
		let mut row = MapValue::new();
		row.insert("id", FieldValue::Integer(1));
		row.insert("name", FieldValue::String("widget".into()));
		{
			let mut w = NsonWriter::new(&mut resp);
			w.start_map();
			w.write_int_field(keys::ERROR_CODE, 0);
			w.start_payload();
			w.write_map_field(keys::ROW, &row);
			w.write_binary_field(keys::ROW_VERSION, &[1, 2, 3]);
			w.end_payload();
			w.end_map();
		}

		let result = op.deserialize(ProtocolVersion::V4, &resp, &req).unwrap();
		match result {
			OpResult::Get { row: got, version, .. } => {
				assert_eq!(got, Some(row));
				assert_eq!(version, Some(vec![1, 2, 3]));
			}
			other => panic!("unexpected result: {other:?}"),
		}
	}
}
