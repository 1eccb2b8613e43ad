// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Observability side channel (§4.11, §9 "Event emitter for observability").
//! `tracing` spans/events fire unconditionally at the same points; an
//! [`Observer`] is an opt-in callback surface for callers that want typed
//! access instead of parsing log lines.

use crate::error::NoSQLError;
use crate::request::Request;
use crate::types::{Capacity, TableState};

/// Four no-op-default hooks a caller can selectively override.
pub trait Observer: Send + Sync {
	/// A request failed terminally (no further retry).
	fn on_error(&self, _req: &Request, _err: &NoSQLError) {}

	/// A request is about to be retried.
	fn on_retryable(&self, _req: &Request, _err: &NoSQLError, _attempt: u32) {}

	/// A response carried consumed-capacity accounting.
	fn on_consumed_capacity(&self, _req: &Request, _capacity: &Capacity) {}

	/// A response reported a table's lifecycle state.
	fn on_table_state(&self, _table_name: &str, _state: TableState) {}
}
