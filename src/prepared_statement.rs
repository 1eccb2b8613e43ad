// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Prepared statements (§3): the server-opaque compiled-query blob, plus the
//! driver-side fields peeled off its fixed prefix.

use std::collections::HashMap;

use parking_lot::RwLock;

use nosqldb_codec::ResizableBuffer;

use crate::error::{NoSQLError, Result};
use crate::types::{OpCode, TopologyInfo};

/// One table referenced by a prepared statement's fixed header prefix.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PreparedTableRef {
	pub namespace: Option<String>,
	pub table_name: String,
}

/// The driver-visible prefix of the opaque blob: `{4-byte length, 32-byte
/// hash, 1-byte table count, (namespace, table)* , opcode}` (§3). Parsed
/// in-place; the raw bytes remain untouched inside the blob the driver sends
/// back to the server on every execution.
#[derive(Clone, Debug)]
struct BlobPrefix {
	hash: [u8; 32],
	tables: Vec<PreparedTableRef>,
	op_code: OpCode,
}

fn parse_blob_prefix(blob: &[u8]) -> Result<BlobPrefix> {
	// Rewrapped in a ResizableBuffer so `slice`'s bounds checks behave the
	// same way they do against a freshly-received response body.
	let mut buf = ResizableBuffer::with_capacity(blob.len());
	buf.append_bytes(blob);

	let mut pos = 0usize;
	let _declared_len = buf.read_i32_be(pos)?;
	pos += 4;
	let hash_bytes = buf.slice(pos, pos + 32)?;
	let mut hash = [0u8; 32];
	hash.copy_from_slice(hash_bytes);
	pos += 32;

	let table_count = buf.read_u8(pos)?;
	pos += 1;

	let mut tables = Vec::with_capacity(table_count as usize);
	for _ in 0..table_count {
		let (namespace, next) = read_opt_string(&buf, pos)?;
		pos = next;
		let (table_name, next) = read_opt_string(&buf, pos)?;
		pos = next;
		tables.push(PreparedTableRef {
			namespace,
			table_name: table_name.unwrap_or_default(),
		});
	}

	let op_byte = buf.read_u8(pos)?;
	let op_code = OpCode::from_u8(op_byte).ok_or_else(|| NoSQLError::Protocol {
		operation: "prepared-statement-prefix".to_string(),
		detail: format!("unrecognized opcode byte {op_byte} in prepared statement prefix"),
	})?;

	Ok(BlobPrefix { hash, tables, op_code })
}

/// A length-prefixed string using the same packed-int convention as the rest
/// of the binary codec; `-1` length is `None`.
fn read_opt_string(buf: &ResizableBuffer, pos: usize) -> Result<(Option<String>, usize)> {
	let (len, next) = nosqldb_codec::read_sorted_int32(buf, pos)?;
	if len < 0 {
		return Ok((None, next));
	}
	let bytes = buf.slice(next, next + len as usize)?;
	let s = std::str::from_utf8(bytes)
		.map_err(|e| NoSQLError::Protocol {
			operation: "prepared-statement-prefix".to_string(),
			detail: e.to_string(),
		})?
		.to_string();
	Ok((Some(s), next + len as usize))
}

/// A compiled query as returned by `Prepare`. Immutable except for its
/// attached [`TopologyInfo`], which any subsequent query execution may
/// refresh in place (§3 invariant).
#[derive(Debug)]
pub struct PreparedStatement {
	pub sql_text: Option<String>,
	/// The exact bytes the server returned; sent back byte-identical on every
	/// execution (§8 Scenario B).
	statement_blob: Vec<u8>,
	pub query_plan_printout: Option<String>,
	/// Absent means "simple query", executed entirely server-side; present
	/// means the driver must drive per-shard iteration using it. Query
	/// planning itself is out of scope here — this is carried opaquely.
	pub driver_query_plan: Option<Vec<u8>>,
	pub bind_variables: HashMap<String, i32>,
	topology: RwLock<TopologyInfo>,
	tables: Vec<PreparedTableRef>,
	op_code: OpCode,
	statement_hash: [u8; 32],
}

impl PreparedStatement {
	/// Parses the blob's fixed prefix and assembles a `PreparedStatement`
	/// from a `Prepare` response.
	pub fn new(
		sql_text: Option<String>,
		statement_blob: Vec<u8>,
		query_plan_printout: Option<String>,
		driver_query_plan: Option<Vec<u8>>,
		bind_variables: HashMap<String, i32>,
	) -> Result<Self> {
		let prefix = parse_blob_prefix(&statement_blob)?;
		Ok(Self {
			sql_text,
			statement_blob,
			query_plan_printout,
			driver_query_plan,
			bind_variables,
			topology: RwLock::new(TopologyInfo::absent()),
			tables: prefix.tables,
			op_code: prefix.op_code,
			statement_hash: prefix.hash,
		})
	}

	#[must_use]
	pub fn statement_blob(&self) -> &[u8] {
		&self.statement_blob
	}

	#[must_use]
	pub fn op_code(&self) -> OpCode {
		self.op_code
	}

	#[must_use]
	pub fn statement_hash(&self) -> &[u8; 32] {
		&self.statement_hash
	}

	#[must_use]
	pub fn tables(&self) -> &[PreparedTableRef] {
		&self.tables
	}

	/// The first referenced table, used by the rate limiter and `GetTable`
	/// auto-refresh to resolve a table name once a query has been prepared.
	#[must_use]
	pub fn primary_table_name(&self) -> Option<&str> {
		self.tables.first().map(|t| t.table_name.as_str())
	}

	#[must_use]
	pub fn topology(&self) -> TopologyInfo {
		self.topology.read().clone()
	}

	/// Merges newer topology info in place; stale info is ignored.
	pub fn merge_topology(&self, incoming: &TopologyInfo) {
		self.topology.write().merge_if_newer(incoming);
	}

	pub fn bind_position(&self, name: &str) -> Option<i32> {
		self.bind_variables.get(name).copied()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_blob(table_name: &str, op_code: OpCode) -> Vec<u8> {
		let mut buf = ResizableBuffer::new();
		let off = buf.len();
		buf.write_i32_be(0, off); // declared length placeholder
		let off = buf.len();
		buf.write_bytes_at(&[7u8; 32], off); // hash
		let off = buf.len();
		buf.write_u8(1, off); // table count

		// namespace: absent
		let off = buf.len();
		nosqldb_codec::write_sorted_int32(&mut buf, off, -1);
		// table name
		let off = buf.len();
		let end = nosqldb_codec::write_sorted_int32(&mut buf, off, table_name.len() as i32);
		buf.write_bytes_at(table_name.as_bytes(), end);

		let off = buf.len();
		buf.write_u8(op_code as u8, off);
		buf.slice(0, buf.len()).unwrap().to_vec()
	}

	#[test]
	fn parses_table_name_and_opcode_from_prefix() {
		let blob = sample_blob("myTable", OpCode::Query);
		let ps = PreparedStatement::new(
			Some("SELECT * FROM myTable".to_string()),
			blob.clone(),
			None,
			None,
			HashMap::new(),
		)
		.unwrap();
		assert_eq!(ps.primary_table_name(), Some("myTable"));
		assert_eq!(ps.op_code(), OpCode::Query);
		assert_eq!(ps.statement_blob(), blob.as_slice());
	}

	#[test]
	fn topology_merges_only_when_newer() {
		let blob = sample_blob("t", OpCode::Query);
		let ps = PreparedStatement::new(None, blob, None, None, HashMap::new()).unwrap();
		ps.merge_topology(&TopologyInfo {
			seq_num: 2,
			shard_ids: vec![1],
		});
		ps.merge_topology(&TopologyInfo {
			seq_num: 1,
			shard_ids: vec![9],
		});
		assert_eq!(ps.topology().seq_num, 2);
		ps.merge_topology(&TopologyInfo {
			seq_num: 5,
			shard_ids: vec![3, 4],
		});
		assert_eq!(ps.topology().shard_ids, vec![3, 4]);
	}
}
