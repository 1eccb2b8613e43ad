// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Deny the following clippy lints to enforce them:
#![deny(clippy::complexity)]
#![deny(clippy::correctness)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
// Warn for these lints, rather than denying them.
#![warn(clippy::use_self)]
#![allow(clippy::module_name_repetitions)]

//! # nosqldb-codec
//!
//! The low-level (de)serialization toolkit shared by every wire-protocol
//! version of the NoSQL driver core: a growable big-endian byte buffer with
//! a process-wide free list, and the sort-preserving packed-integer codec
//! that every higher protocol layer builds on.

use std::error::Error;

use thiserror::Error;

pub type ReadResult<T> = Result<T, ReadError>;
pub type WriteResult<T> = Result<T, WriteError>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ReadError {
	#[error("read past end of buffer: offset {offset} + {width} > length {length}")]
	EndOfInput {
		offset: usize,
		width: usize,
		length: usize,
	},

	#[error("{0}")]
	Other(Box<dyn Error + Send + Sync>),
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WriteError {
	#[error("{0}")]
	Other(Box<dyn Error + Send + Sync>),
}

mod buffer;
mod packed_int;

pub use buffer::{BufferPool, PoolStats, ResizableBuffer};
pub use packed_int::{
	max_sorted_int32_size, max_sorted_int64_size, read_sorted_int32, read_sorted_int64,
	write_sorted_int32, write_sorted_int64,
};
