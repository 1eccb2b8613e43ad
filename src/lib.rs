// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocol codec, request pipeline, and per-table rate-limiter core
//! for a NoSQL database client driver.
//!
//! This crate does not expose a high-level `get`/`put`/`query` API; it is
//! the layer underneath one: [`op::Op`] registers what a request serializes
//! and deserializes to, [`request::Request`] carries the arguments for one
//! call, and [`client::Client`] threads a request through protocol
//! negotiation, the HTTP transport, rate limiting, and retries.
//!
//! The growable buffer and packed-integer codec that the binary and NSON
//! protocols share live in the `nosqldb-codec` crate this one depends on.

pub mod auth;
pub mod client;
pub mod error;
pub mod events;
pub mod field_value;
pub mod nson;
pub mod op;
pub mod prepared_statement;
pub mod protocol;
pub mod rate_limiter;
pub mod request;
pub mod transport;
pub mod types;

pub use client::{Client, DefaultRetryHandler, NoSQLConfig, RetryHandler};
pub use error::{ErrorCode, NoSQLError, Result};
pub use field_value::{FieldValue, Key, MapValue, Row, Version};
pub use op::{Op, OpRegistry, OpResult};
pub use request::{Request, RequestOptions};
pub use types::{Consistency, Durability, OpCode, TableLimits, TableState};
