// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The polymorphic row-cell type (§3) and the ordered-map/row types built
//! from it.

use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use num_bigint::BigInt;

/// Wire type codes (§3); fixed, never renumbered.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum FieldType {
	Array = 0,
	Binary = 1,
	Boolean = 2,
	Double = 3,
	Integer = 4,
	Long = 5,
	Map = 6,
	String = 7,
	Timestamp = 8,
	Number = 9,
	JsonNull = 10,
	Null = 11,
	Empty = 12,
}

impl FieldType {
	#[must_use]
	pub fn from_u8(b: u8) -> Option<Self> {
		Some(match b {
			0 => Self::Array,
			1 => Self::Binary,
			2 => Self::Boolean,
			3 => Self::Double,
			4 => Self::Integer,
			5 => Self::Long,
			6 => Self::Map,
			7 => Self::String,
			8 => Self::Timestamp,
			9 => Self::Number,
			10 => Self::JsonNull,
			11 => Self::Null,
			12 => Self::Empty,
			_ => return None,
		})
	}
}

/// An ordered map of string to [`FieldValue`]. Iteration order is insertion
/// order by default; the query engine may request key-sorted iteration for
/// grouping columns (§4.3).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
	entries: Vec<(String, FieldValue)>,
}

impl MapValue {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
		let key = key.into();
		if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
			slot.1 = value;
		} else {
			self.entries.push((key, value));
		}
	}

	#[must_use]
	pub fn get(&self, key: &str) -> Option<&FieldValue> {
		self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &(String, FieldValue)> {
		self.entries.iter()
	}

	/// Entries in ascending key order, used when serializing grouping
	/// columns (a flag set only by the query engine forces this order).
	#[must_use]
	pub fn sorted_entries(&self) -> Vec<(&str, &FieldValue)> {
		let mut sorted: BTreeMap<&str, &FieldValue> =
			self.entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
		sorted.into_iter().collect()
	}
}

impl FromIterator<(String, FieldValue)> for MapValue {
	fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
		let mut map = Self::new();
		for (k, v) in iter {
			map.insert(k, v);
		}
		map
	}
}

/// The polymorphic row-cell type: a tagged union over every value a column
/// can hold on the wire, plus the driver-internal `Empty` sentinel used by
/// query (never legal to send in a request body).
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
	JsonNull,
	/// Driver-side null, distinct from JSON null.
	Null,
	Boolean(bool),
	Integer(i32),
	/// Possibly arbitrary-precision; native `Long` carries a native `i64`,
	/// `BigLong` carries a value outside that range (never produced by this
	/// driver's own codec, since Rust's `i64` already spans the full signed
	/// 64-bit range, but accepted for interop with adapters that produce
	/// one).
	Long(i64),
	BigLong(BigInt),
	Double(f64),
	Number(BigDecimal),
	String(String),
	/// Milliseconds since the Unix epoch.
	Timestamp(i64),
	Binary(Vec<u8>),
	Array(Vec<FieldValue>),
	Map(MapValue),
	/// Internal sentinel used by query; never appears in a row a caller
	/// constructs and is excluded from the round-trip property (§8 item 4).
	Empty,
}

impl FieldValue {
	#[must_use]
	pub fn field_type(&self) -> FieldType {
		match self {
			Self::JsonNull => FieldType::JsonNull,
			Self::Null => FieldType::Null,
			Self::Boolean(_) => FieldType::Boolean,
			Self::Integer(_) => FieldType::Integer,
			Self::Long(_) | Self::BigLong(_) => FieldType::Long,
			Self::Double(_) => FieldType::Double,
			Self::Number(_) => FieldType::Number,
			Self::String(_) => FieldType::String,
			Self::Timestamp(_) => FieldType::Timestamp,
			Self::Binary(_) => FieldType::Binary,
			Self::Array(_) => FieldType::Array,
			Self::Map(_) => FieldType::Map,
			Self::Empty => FieldType::Empty,
		}
	}
}

/// Row and Key are maps of [`FieldValue`]s.
pub type Row = MapValue;
pub type Key = MapValue;

/// Opaque byte string identifying a row revision, used for compare-and-set.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Version(pub Vec<u8>);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn map_value_preserves_insertion_order_and_overwrites() {
		let mut m = MapValue::new();
		m.insert("b", FieldValue::Integer(1));
		m.insert("a", FieldValue::Integer(2));
		m.insert("b", FieldValue::Integer(3));
		let keys: Vec<&str> = m.iter().map(|(k, _)| k.as_str()).collect();
		assert_eq!(keys, vec!["b", "a"]);
		assert_eq!(m.get("b"), Some(&FieldValue::Integer(3)));
	}

	#[test]
	fn sorted_entries_are_alphabetic() {
		let mut m = MapValue::new();
		m.insert("z", FieldValue::Integer(1));
		m.insert("a", FieldValue::Integer(2));
		m.insert("m", FieldValue::Integer(3));
		let keys: Vec<&str> = m.sorted_entries().into_iter().map(|(k, _)| k).collect();
		assert_eq!(keys, vec!["a", "m", "z"]);
	}
}
