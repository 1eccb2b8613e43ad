// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-call request object (§3 "Request"): operation descriptor, option
//! inheritance, the serialized body buffer, and the bookkeeping the pipeline
//! and rate limiter thread through a single attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nosqldb_codec::ResizableBuffer;

use crate::field_value::{FieldValue, MapValue};
use crate::op::{Op, WriteSubOp};
use crate::prepared_statement::PreparedStatement;
use crate::protocol::ProtocolVersion;
use crate::rate_limiter::RateLimiterEntry;
use crate::types::{Consistency, Durability, FieldRange, TableLimits, Ttl};

/// Options inherited from [`crate::client::NoSQLConfig`] and optionally
/// overridden per call (§4.8 `applyDefaults`).
#[derive(Clone, Debug)]
pub struct RequestOptions {
	pub timeout: Duration,
	pub consistency: Consistency,
	pub durability: Option<Durability>,
	pub compartment: Option<String>,
	pub namespace: Option<String>,
}

/// One call into the driver core: an operation descriptor plus every
/// argument it needs, wire-agnostic until `Op::serialize` runs.
pub struct Request {
	pub op: Arc<dyn Op>,
	pub options: RequestOptions,

	table_name: Option<String>,

	/// `Get`/`Delete`/`MultiDelete` key, or a partial key for `MultiDelete`.
	pub key: Option<MapValue>,
	/// `Put`'s row.
	pub value: Option<MapValue>,
	pub return_existing: bool,
	pub ttl: Option<Ttl>,
	pub update_ttl: bool,
	continuation_key: Option<Vec<u8>>,
	pub field_range: Option<FieldRange>,
	pub max_write_kb: i32,
	pub max_read_kb: i32,

	pub statement: Option<String>,
	pub prepared_statement: Option<Arc<PreparedStatement>>,
	pub bind_variables: HashMap<String, FieldValue>,

	pub abort_on_fail: bool,
	pub sub_operations: Vec<WriteSubOp>,

	pub table_limits: Option<TableLimits>,

	/// Rate-limiter direction hints; set from `Op::does_reads`/`does_writes`
	/// at construction and may be flipped by `RateLimiterClient::on_error`
	/// when a throttle response reveals the initial guess was wrong.
	pub does_reads: bool,
	pub does_writes: bool,
	/// Resolved once the table name is known, cached for the lifetime of the
	/// request so `finish_request` doesn't re-hit the map.
	pub rate_limiter_entry: Option<Arc<RateLimiterEntry>>,

	/// The serialized request body, populated once `Op::serialize` runs for
	/// the current attempt; cleared and rebuilt on every downgrade retry.
	pub body: Option<ResizableBuffer>,
	/// The protocol version `body` was serialized against.
	pub serialized_version: Option<ProtocolVersion>,

	pub request_id: u64,
	pub attempt: u32,
	pub last_error: Option<crate::error::NoSQLError>,

	/// Advanced-query shard binding; `None` until a multi-shard query plan
	/// assigns one.
	pub shard_id: Option<i32>,

	start_time: Instant,
}

impl Request {
	#[must_use]
	pub fn new(op: Arc<dyn Op>, options: RequestOptions, version: ProtocolVersion, request_id: u64) -> Self {
		let does_reads = op.does_reads();
		let does_writes = op.does_writes();
		Self {
			op,
			options,
			table_name: None,
			key: None,
			value: None,
			return_existing: false,
			ttl: None,
			update_ttl: false,
			continuation_key: None,
			field_range: None,
			max_write_kb: 0,
			max_read_kb: 0,
			statement: None,
			prepared_statement: None,
			bind_variables: HashMap::new(),
			abort_on_fail: false,
			sub_operations: Vec::new(),
			table_limits: None,
			does_reads,
			does_writes,
			rate_limiter_entry: None,
			body: None,
			serialized_version: Some(version),
			request_id,
			attempt: 0,
			last_error: None,
			shard_id: None,
			start_time: Instant::now(),
		}
	}

	pub fn set_table_name(&mut self, table_name: &str) {
		self.table_name = Some(table_name.to_string());
	}

	#[must_use]
	pub fn table_name(&self) -> Option<&str> {
		self.table_name
			.as_deref()
			.or_else(|| self.prepared_statement.as_deref().and_then(PreparedStatement::primary_table_name))
	}

	pub fn set_continuation_key(&mut self, bytes: Option<Vec<u8>>) {
		self.continuation_key = bytes;
	}

	#[must_use]
	pub fn continuation_key_bytes(&self) -> Option<&[u8]> {
		self.continuation_key.as_deref()
	}

	/// Time remaining before `options.timeout` elapses, measured from
	/// construction; `Duration::ZERO` once the deadline has passed.
	#[must_use]
	pub fn remaining(&self) -> Duration {
		self.options.timeout.saturating_sub(self.start_time.elapsed())
	}

	#[must_use]
	pub fn elapsed(&self) -> Duration {
		self.start_time.elapsed()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::op::{GetOp, QueryOp};
	use crate::types::OpCode;
	use std::collections::HashMap as StdHashMap;

	fn opts() -> RequestOptions {
		RequestOptions {
			timeout: Duration::from_secs(5),
			consistency: Consistency::Eventual,
			durability: None,
			compartment: None,
			namespace: None,
		}
	}

	fn sample_blob(table_name: &str, op_code: OpCode) -> Vec<u8> {
		let mut buf = ResizableBuffer::new();
		let off = buf.len();
		buf.write_i32_be(0, off);
		let off = buf.len();
		buf.write_bytes_at(&[7u8; 32], off);
		let off = buf.len();
		buf.write_u8(1, off);
		let off = buf.len();
		nosqldb_codec::write_sorted_int32(&mut buf, off, -1);
		let off = buf.len();
		let end = nosqldb_codec::write_sorted_int32(&mut buf, off, table_name.len() as i32);
		buf.write_bytes_at(table_name.as_bytes(), end);
		let off = buf.len();
		buf.write_u8(op_code as u8, off);
		buf.slice(0, buf.len()).unwrap().to_vec()
	}

	#[test]
	fn table_name_falls_back_to_prepared_statement() {
		let mut req = Request::new(Arc::new(QueryOp), opts(), ProtocolVersion::V4, 1);
		assert_eq!(req.table_name(), None);
		let blob = sample_blob("orders", OpCode::Query);
		let ps = PreparedStatement::new(None, blob, None, None, StdHashMap::new()).unwrap();
		req.prepared_statement = Some(Arc::new(ps));
		assert_eq!(req.table_name(), Some("orders"));
	}

	#[test]
	fn explicit_table_name_wins_over_prepared_statement() {
		let mut req = Request::new(Arc::new(GetOp), opts(), ProtocolVersion::V4, 1);
		req.set_table_name("invoices");
		assert_eq!(req.table_name(), Some("invoices"));
	}

	#[test]
	fn remaining_shrinks_toward_zero() {
		let mut req = Request::new(Arc::new(GetOp), opts(), ProtocolVersion::V4, 1);
		req.options.timeout = Duration::from_millis(1);
		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(req.remaining(), Duration::ZERO);
	}
}
