// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol version negotiation (§4.5): a single shared cell tracking which
//! wire format the client currently speaks, plus the binary (V2/V3) codec.
//! The NSON (V4) codec lives in [`crate::nson`].

pub mod binary;

use std::sync::atomic::{AtomicU8, Ordering};

/// The wire serial version sent in every request's first two bytes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum ProtocolVersion {
	V2 = 2,
	V3 = 3,
	V4 = 4,
}

impl ProtocolVersion {
	#[must_use]
	pub fn as_u16(self) -> u16 {
		self as u8 as u16
	}

	#[must_use]
	pub fn from_u8(b: u8) -> Option<Self> {
		Some(match b {
			2 => Self::V2,
			3 => Self::V3,
			4 => Self::V4,
			_ => return None,
		})
	}

	#[must_use]
	pub fn is_nson(self) -> bool {
		matches!(self, Self::V4)
	}

	/// The next version down in the downgrade chain V4 -> V3 -> V2, or
	/// `None` once V2 is exhausted.
	#[must_use]
	pub fn step_down(self) -> Option<Self> {
		match self {
			Self::V4 => Some(Self::V3),
			Self::V3 => Some(Self::V2),
			Self::V2 => None,
		}
	}
}

/// Tracks the active protocol version for a client, shared across every
/// in-flight request. A single word; writes only ever happen through
/// [`try_downgrade`](Self::try_downgrade).
pub struct ProtocolManager {
	current: AtomicU8,
}

impl Default for ProtocolManager {
	fn default() -> Self {
		Self::new()
	}
}

impl ProtocolManager {
	/// Every session starts at V4 (NSON), per §4.5.
	#[must_use]
	pub fn new() -> Self {
		Self {
			current: AtomicU8::new(ProtocolVersion::V4 as u8),
		}
	}

	#[must_use]
	pub fn current(&self) -> ProtocolVersion {
		ProtocolVersion::from_u8(self.current.load(Ordering::Acquire))
			.expect("current always holds a value written by a ProtocolVersion")
	}

	/// Steps the active version down by one, but only if it still equals
	/// `observed_version` (the version the failing request was serialized
	/// against). Returns the new active version on success; `None` if a
	/// concurrent downgrade already happened, or the floor (V2) was already
	/// reached, in which case the caller should retry without decrementing.
	pub fn try_downgrade(&self, observed_version: ProtocolVersion) -> Option<ProtocolVersion> {
		let next = observed_version.step_down()?;
		self.current
			.compare_exchange(
				observed_version as u8,
				next as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.ok()?;
		Some(next)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn downgrade_chain_reaches_v2_and_then_stops() {
		let pm = ProtocolManager::new();
		assert_eq!(pm.current(), ProtocolVersion::V4);
		assert_eq!(pm.try_downgrade(ProtocolVersion::V4), Some(ProtocolVersion::V3));
		assert_eq!(pm.current(), ProtocolVersion::V3);
		assert_eq!(pm.try_downgrade(ProtocolVersion::V3), Some(ProtocolVersion::V2));
		assert_eq!(pm.try_downgrade(ProtocolVersion::V2), None);
		assert_eq!(pm.current(), ProtocolVersion::V2);
	}

	#[test]
	fn stale_observed_version_does_not_decrement_further() {
		let pm = ProtocolManager::new();
		pm.try_downgrade(ProtocolVersion::V4);
		assert_eq!(pm.current(), ProtocolVersion::V3);
		// A second request that was serialized against V4 (now stale) must
		// not push the version down to V2.
		assert_eq!(pm.try_downgrade(ProtocolVersion::V4), None);
		assert_eq!(pm.current(), ProtocolVersion::V3);
	}
}
