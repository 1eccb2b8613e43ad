// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plain integer enums and small value types shared across the wire codecs
//! and the pipeline (§3, GLOSSARY).

use crate::error::{NoSQLError, Result};
use crate::field_value::FieldValue;

/// Request consistency. Ordinal matches the wire encoding (`type - 1` is
/// written on the wire by the NSON codec, per the real driver's convention).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(i32)]
pub enum Consistency {
	Absolute = 1,
	Eventual = 2,
}

impl Consistency {
	#[must_use]
	pub fn from_str_name(s: &str) -> Option<Self> {
		match s {
			"ABSOLUTE" => Some(Self::Absolute),
			"EVENTUAL" => Some(Self::Eventual),
			_ => None,
		}
	}
}

/// Table throughput billing mode.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
#[repr(i32)]
pub enum CapacityMode {
	#[default]
	Provisioned = 1,
	OnDemand = 2,
}

/// Table lifecycle state, as reported by `GetTable`/`TableRequest`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(i32)]
pub enum TableState {
	Active = 0,
	Creating = 1,
	Dropping = 2,
	Dropped = 3,
	Updating = 4,
}

impl TableState {
	#[must_use]
	pub fn from_i32(v: i32) -> Option<Self> {
		Some(match v {
			0 => Self::Active,
			1 => Self::Creating,
			2 => Self::Dropping,
			3 => Self::Dropped,
			4 => Self::Updating,
			_ => return None,
		})
	}
}

/// On-prem durability sync policy for the master/replicas.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum SyncPolicy {
	Sync = 1,
	NoSync = 2,
	WriteNoSync = 3,
}

/// On-prem replica-acknowledgement policy.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum ReplicaAckPolicy {
	All = 1,
	None = 2,
	SimpleMajority = 3,
}

/// `{masterSync, replicaSync, replicaAck}`, on-prem only. `nil` encodes as a
/// single zero byte on the wire (V3+); two bits per field, packed into one
/// byte.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Durability {
	pub master_sync: SyncPolicy,
	pub replica_sync: SyncPolicy,
	pub replica_ack: ReplicaAckPolicy,
}

impl Durability {
	#[must_use]
	pub fn to_byte(self) -> u8 {
		(self.master_sync as u8) | ((self.replica_sync as u8) << 2) | ((self.replica_ack as u8) << 4)
	}

	#[must_use]
	pub fn from_byte(b: u8) -> Option<Self> {
		if b == 0 {
			return None;
		}
		let master = b & 0x3;
		let replica_sync = (b >> 2) & 0x3;
		let replica_ack = (b >> 4) & 0x3;
		Some(Self {
			master_sync: sync_policy_from_bits(master)?,
			replica_sync: sync_policy_from_bits(replica_sync)?,
			replica_ack: replica_ack_from_bits(replica_ack)?,
		})
	}
}

fn sync_policy_from_bits(b: u8) -> Option<SyncPolicy> {
	Some(match b {
		1 => SyncPolicy::Sync,
		2 => SyncPolicy::NoSync,
		3 => SyncPolicy::WriteNoSync,
		_ => return None,
	})
}

fn replica_ack_from_bits(b: u8) -> Option<ReplicaAckPolicy> {
	Some(match b {
		1 => ReplicaAckPolicy::All,
		2 => ReplicaAckPolicy::None,
		3 => ReplicaAckPolicy::SimpleMajority,
		_ => return None,
	})
}

/// TTL duration unit as encoded on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum TimeUnit {
	Hours = 1,
	Days = 2,
}

/// Either a non-negative duration in days/hours, "do not expire", or unset.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Ttl {
	Unset,
	DoNotExpire,
	Duration { value: i64, unit: TimeUnit },
}

impl Ttl {
	/// `(duration, unit)` as written on the wire; `nil` is `(-1, Hours)`,
	/// infinity is `(0, Days)`.
	#[must_use]
	pub fn to_wire(self) -> (i64, TimeUnit) {
		match self {
			Self::Unset => (-1, TimeUnit::Hours),
			Self::DoNotExpire => (0, TimeUnit::Days),
			Self::Duration { value, unit } => (value, unit),
		}
	}

	#[must_use]
	pub fn from_wire(value: i64, unit_byte: u8) -> Result<Self> {
		if value == -1 {
			return Ok(Self::Unset);
		}
		let unit = match unit_byte {
			1 => TimeUnit::Hours,
			2 => TimeUnit::Days,
			other => {
				return Err(NoSQLError::Protocol {
					operation: "ttl".to_string(),
					detail: format!("unrecognized TTL unit byte {other}"),
				})
			}
		};
		if value == 0 && matches!(unit, TimeUnit::Days) {
			return Ok(Self::DoNotExpire);
		}
		Ok(Self::Duration { value, unit })
	}
}

/// Per-response `{readUnits, readKB, writeKB}`. `writeUnits == writeKB`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Capacity {
	pub read_units: i32,
	pub read_kb: i32,
	pub write_kb: i32,
	/// Accumulated delay (ms) the rate limiter imposed on reads for this
	/// request; populated by `RateLimiterClient::finish_request`.
	pub read_rate_limit_delay_ms: u64,
	/// Accumulated delay (ms) the rate limiter imposed on writes.
	pub write_rate_limit_delay_ms: u64,
}

impl Capacity {
	#[must_use]
	pub fn write_units(&self) -> i32 {
		self.write_kb
	}
}

/// Table throughput limits, as negotiated with `CreateTable`/`TableLimits`
/// and reported back by `GetTable`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct TableLimits {
	pub read_units: i32,
	pub write_units: i32,
	pub storage_gb: i32,
	pub mode: CapacityMode,
}

/// `{seqNum: int >= -1, shardIds: int[]}`. `seqNum = -1` means absent.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct TopologyInfo {
	pub seq_num: i32,
	pub shard_ids: Vec<i32>,
}

impl TopologyInfo {
	#[must_use]
	pub fn absent() -> Self {
		Self {
			seq_num: -1,
			shard_ids: Vec::new(),
		}
	}

	#[must_use]
	pub fn is_valid(&self) -> bool {
		self.seq_num >= -1
	}

	/// A response carrying a higher `seqNum` supersedes the cached value.
	pub fn merge_if_newer(&mut self, incoming: &Self) {
		if incoming.seq_num > self.seq_num {
			*self = incoming.clone();
		}
	}
}

/// Opaque cursor returned by the server, or a distinguished sentinel for
/// multi-round advanced queries. Callers must send the exact bytes last
/// returned on the next query in the sequence, and must not confuse the
/// sentinel for opaque bytes (§9 "Continuation-key sentinel object").
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ContinuationKey {
	None,
	Bytes(Vec<u8>),
	/// Advanced-query in-progress marker: more shards remain to visit even
	/// though the server returned no opaque bytes for this round.
	AdvancedQueryInProgress,
}

impl ContinuationKey {
	#[must_use]
	pub fn is_none(&self) -> bool {
		matches!(self, Self::None)
	}
}

/// One bound of a [`FieldRange`].
#[derive(Clone, Debug, PartialEq)]
pub struct RangeBound {
	pub value: FieldValue,
	pub inclusive: bool,
}

/// A bounded interval over one column of a composite primary key, used by
/// `MultiDelete` and range queries (GLOSSARY "Field range").
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldRange {
	pub field_name: String,
	pub start: Option<RangeBound>,
	pub end: Option<RangeBound>,
}

impl FieldRange {
	#[must_use]
	pub fn is_present(&self) -> bool {
		self.start.is_some() || self.end.is_some()
	}
}

/// The wire opcode integers (§3's sibling table).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(u8)]
pub enum OpCode {
	Delete = 0,
	DeleteIfVersion = 1,
	Get = 2,
	Put = 3,
	PutIfAbsent = 4,
	PutIfPresent = 5,
	PutIfVersion = 6,
	Query = 7,
	Prepare = 8,
	WriteMultiple = 9,
	MultiDelete = 10,
	GetTable = 11,
	GetIndexes = 12,
	GetTableUsage = 13,
	ListTables = 14,
	TableRequest = 15,
	Scan = 16,
	IndexScan = 17,
	CreateTable = 18,
	AlterTable = 19,
	DropTable = 20,
	CreateIndex = 21,
	DropIndex = 22,
	SystemRequest = 23,
	SystemStatusRequest = 24,
}

impl OpCode {
	#[must_use]
	pub fn from_u8(b: u8) -> Option<Self> {
		Some(match b {
			0 => Self::Delete,
			1 => Self::DeleteIfVersion,
			2 => Self::Get,
			3 => Self::Put,
			4 => Self::PutIfAbsent,
			5 => Self::PutIfPresent,
			6 => Self::PutIfVersion,
			7 => Self::Query,
			8 => Self::Prepare,
			9 => Self::WriteMultiple,
			10 => Self::MultiDelete,
			11 => Self::GetTable,
			12 => Self::GetIndexes,
			13 => Self::GetTableUsage,
			14 => Self::ListTables,
			15 => Self::TableRequest,
			16 => Self::Scan,
			17 => Self::IndexScan,
			18 => Self::CreateTable,
			19 => Self::AlterTable,
			20 => Self::DropTable,
			21 => Self::CreateIndex,
			22 => Self::DropIndex,
			23 => Self::SystemRequest,
			24 => Self::SystemStatusRequest,
			_ => return None,
		})
	}
}

/// Which direction a throttle error applies to, used by the rate limiter's
/// `onError` hook to correct a misdetected `doesReads`/`doesWrites` guess.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorCodeHint {
	ReadLimitExceeded,
	WriteLimitExceeded,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn durability_byte_round_trips() {
		let d = Durability {
			master_sync: SyncPolicy::WriteNoSync,
			replica_sync: SyncPolicy::Sync,
			replica_ack: ReplicaAckPolicy::SimpleMajority,
		};
		let b = d.to_byte();
		assert_eq!(Durability::from_byte(b), Some(d));
	}

	#[test]
	fn ttl_wire_round_trip() {
		assert_eq!(Ttl::from_wire(-1, 1).unwrap(), Ttl::Unset);
		assert_eq!(Ttl::from_wire(0, 2).unwrap(), Ttl::DoNotExpire);
		let (v, u) = Ttl::DoNotExpire.to_wire();
		assert_eq!((v, u as u8), (0, TimeUnit::Days as u8));
		let dur = Ttl::Duration {
			value: 5,
			unit: TimeUnit::Hours,
		};
		let (v, u) = dur.to_wire();
		assert_eq!(Ttl::from_wire(v, u as u8).unwrap(), dur);
	}

	#[test]
	fn topology_merges_only_when_newer() {
		let mut cached = TopologyInfo {
			seq_num: 3,
			shard_ids: vec![1, 2],
		};
		cached.merge_if_newer(&TopologyInfo {
			seq_num: 2,
			shard_ids: vec![9],
		});
		assert_eq!(cached.seq_num, 3);
		cached.merge_if_newer(&TopologyInfo {
			seq_num: 5,
			shard_ids: vec![9],
		});
		assert_eq!(cached.seq_num, 5);
		assert_eq!(cached.shard_ids, vec![9]);
	}
}
