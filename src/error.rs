// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The error taxonomy (§7): error *kinds*, plus the full typed server error
//! code enum with its `retryable` flag.

use std::time::Duration;

use thiserror::Error;

/// The fixed set of error codes the server can return, each with a
/// `retryable` flag baked into [`ErrorCode::retryable`]. Discriminants match
/// the wire's non-zero error-code byte/int.
#[non_exhaustive]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(i32)]
pub enum ErrorCode {
	UnknownError = 1,
	UnknownOperation = 2,
	TableNotFound = 3,
	IndexNotFound = 4,
	IllegalArgument = 5,
	RowSizeLimitExceeded = 6,
	KeySizeLimitExceeded = 7,
	BatchOpNumberLimitExceeded = 8,
	RequestSizeLimitExceeded = 9,
	TableExists = 10,
	IndexExists = 11,
	InvalidAuthorization = 12,
	InsufficientPermission = 13,
	ResourceExists = 14,
	ResourceNotFound = 15,
	TableLimitExceeded = 16,
	UnsupportedProtocol = 17,
	TableDeployment = 18,
	IndexLimitExceeded = 19,
	EvolutionLimitExceeded = 20,
	TableDeploymentLimitExceeded = 21,
	TenantDeploymentLimitExceeded = 22,
	OperationNotSupported = 23,
	BadProtocolMessage = 24,
	EtagMismatch = 25,
	CannotCancelWorkRequest = 26,
	UnsupportedQueryVersion = 27,
	RetryAuthentication = 28,

	ReadLimitExceeded = 50,
	WriteLimitExceeded = 51,
	SizeLimitExceeded = 52,
	OperationLimitExceeded = 53,

	RequestTimeout = 65,
	ServerError = 66,
	ServiceUnavailable = 67,
	SecurityInfoUnavailable = 68,
	RetryAuthorization = 69,
	TableNotReady = 70,

	NoSqlSecurityInfoUnavailable = 102,
}

impl ErrorCode {
	#[must_use]
	pub fn from_i32(code: i32) -> Option<Self> {
		use ErrorCode::*;
		Some(match code {
			1 => UnknownError,
			2 => UnknownOperation,
			3 => TableNotFound,
			4 => IndexNotFound,
			5 => IllegalArgument,
			6 => RowSizeLimitExceeded,
			7 => KeySizeLimitExceeded,
			8 => BatchOpNumberLimitExceeded,
			9 => RequestSizeLimitExceeded,
			10 => TableExists,
			11 => IndexExists,
			12 => InvalidAuthorization,
			13 => InsufficientPermission,
			14 => ResourceExists,
			15 => ResourceNotFound,
			16 => TableLimitExceeded,
			17 => UnsupportedProtocol,
			18 => TableDeployment,
			19 => IndexLimitExceeded,
			20 => EvolutionLimitExceeded,
			21 => TableDeploymentLimitExceeded,
			22 => TenantDeploymentLimitExceeded,
			23 => OperationNotSupported,
			24 => BadProtocolMessage,
			25 => EtagMismatch,
			26 => CannotCancelWorkRequest,
			27 => UnsupportedQueryVersion,
			28 => RetryAuthentication,
			50 => ReadLimitExceeded,
			51 => WriteLimitExceeded,
			52 => SizeLimitExceeded,
			53 => OperationLimitExceeded,
			65 => RequestTimeout,
			66 => ServerError,
			67 => ServiceUnavailable,
			68 => SecurityInfoUnavailable,
			69 => RetryAuthorization,
			70 => TableNotReady,
			102 => NoSqlSecurityInfoUnavailable,
			_ => return None,
		})
	}

	/// Whether the pipeline's retry loop should retry on this code by
	/// default (the user's [`crate::client::RetryHandler`] may still veto).
	#[must_use]
	pub fn retryable(self) -> bool {
		use ErrorCode::*;
		matches!(
			self,
			ReadLimitExceeded
				| WriteLimitExceeded
				| SizeLimitExceeded
				| OperationLimitExceeded
				| RequestTimeout
				| ServerError
				| ServiceUnavailable
				| SecurityInfoUnavailable
				| NoSqlSecurityInfoUnavailable
				| RetryAuthorization
				| RetryAuthentication
				| TableNotReady
		)
	}
}

/// The core error type. Variants map directly to the error *kinds* of §7.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum NoSQLError {
	/// Caller misuse. Fails fast, never retried.
	#[error("argument error: {0}")]
	Argument(String),

	/// Malformed response. Fatal for the attempt, never retried.
	#[error("protocol error in {operation}: {detail}")]
	Protocol { operation: String, detail: String },

	/// Non-200 HTTP with server-supplied detail.
	#[error("service error: HTTP {status}: {detail}")]
	Service { status: u16, detail: String },

	/// Socket-level failure. Retryable.
	#[error("network error: {0}")]
	Network(String),

	/// Deadline exceeded. Carries attempt count and the last cause; the
	/// client itself never retries this, though a caller wrapping the
	/// client may.
	#[error("timed out after {attempts} attempt(s) in {elapsed:?}: {last_cause}")]
	Timeout {
		attempts: u32,
		elapsed: Duration,
		last_cause: String,
	},

	/// One of the server's typed error codes.
	#[error("server error {code:?} (retryable={retryable}): {message}")]
	Server {
		code: ErrorCode,
		retryable: bool,
		message: String,
	},

	/// The server doesn't support the protocol version this request was
	/// serialized against; surfaced specially so the pipeline can downgrade.
	#[error("unsupported protocol version")]
	UnsupportedProtocol,
}

impl NoSQLError {
	#[must_use]
	pub fn server(code: ErrorCode, message: impl Into<String>) -> Self {
		Self::Server {
			retryable: code.retryable(),
			code,
			message: message.into(),
		}
	}

	/// Whether the pipeline's built-in retry loop should consider retrying,
	/// independent of what the operation's `should_retry` or the user's
	/// retry handler decide.
	#[must_use]
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Network(_) => true,
			Self::Server { retryable, .. } => *retryable,
			Self::Argument(_)
			| Self::Protocol { .. }
			| Self::Timeout { .. }
			| Self::UnsupportedProtocol => false,
			Self::Service { status, .. } => *status >= 500,
		}
	}

	#[must_use]
	pub fn error_code(&self) -> Option<ErrorCode> {
		match self {
			Self::Server { code, .. } => Some(*code),
			_ => None,
		}
	}
}

impl From<nosqldb_codec::ReadError> for NoSQLError {
	fn from(e: nosqldb_codec::ReadError) -> Self {
		Self::Protocol {
			operation: "decode".to_string(),
			detail: e.to_string(),
		}
	}
}

impl From<reqwest::Error> for NoSQLError {
	fn from(e: reqwest::Error) -> Self {
		Self::Network(e.to_string())
	}
}

pub type Result<T> = std::result::Result<T, NoSQLError>;
