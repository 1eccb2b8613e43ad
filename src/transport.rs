// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP transport and the per-attempt pipeline (§4.5, §4.6): protocol
//! negotiation/downgrade, the retry loop, cookie persistence, and the
//! `SECURITY_INFO_UNAVAILABLE` budget extension. Rate limiting (§4.7) is a
//! peer concern orchestrated by [`crate::client::Client`], which calls
//! [`Pipeline::execute`] once per attempt from inside its own retry-aware
//! wrapper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nosqldb_codec::ResizableBuffer;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::auth::AuthProvider;
use crate::error::{ErrorCode, NoSQLError, Result};
use crate::events::Observer;
use crate::op::OpResult;
use crate::protocol::{binary::BinaryReader, ProtocolManager, ProtocolVersion};
use crate::request::Request;
use crate::types::OpCode;

/// The longest `requestTimeout` handed to a single HTTP attempt, regardless
/// of how much budget remains on the overall call (§4.6).
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extended internal timeout for a `GetTable` issued by the rate limiter's
/// background refresh; covers that call's own retries (§4.7).
pub const BACKGROUND_REFRESH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const DATA_PATH: &str = "/V2/nosql/data";

/// A raw, codec-agnostic response from one HTTP attempt.
pub struct RawResponse {
	pub status: u16,
	pub body: Vec<u8>,
	pub set_cookie: Option<String>,
}

/// The single seam a test replaces to script HTTP responses without a real
/// socket (§8 items 6-16 run against a mock transport).
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, body: Vec<u8>, headers: Vec<(String, String)>, timeout: Duration) -> Result<RawResponse>;
}

/// `reqwest`-backed transport against the fixed `/V2/nosql/data` path.
pub struct HttpTransport {
	http: reqwest::Client,
	url: String,
	host_header: String,
}

impl HttpTransport {
	#[must_use]
	pub fn new(endpoint: &str) -> Self {
		let http = reqwest::Client::builder()
			.build()
			.expect("reqwest client with default TLS backend");
		let host_header = reqwest::Url::parse(endpoint)
			.ok()
			.and_then(|u| u.host_str().map(str::to_string))
			.unwrap_or_default();
		Self {
			http,
			url: format!("{}{}", endpoint.trim_end_matches('/'), DATA_PATH),
			host_header,
		}
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, body: Vec<u8>, headers: Vec<(String, String)>, timeout: Duration) -> Result<RawResponse> {
		let mut builder = self.http.post(&self.url).timeout(timeout).body(body);
		for (k, v) in headers {
			builder = builder.header(k, v);
		}
		if !self.host_header.is_empty() {
			builder = builder.header(reqwest::header::HOST, self.host_header.clone());
		}
		let resp = builder.send().await?;
		let status = resp.status().as_u16();
		let set_cookie = resp
			.headers()
			.get(reqwest::header::SET_COOKIE)
			.and_then(|v| v.to_str().ok())
			.and_then(extract_session_cookie)
			.map(str::to_string);
		let body = resp.bytes().await?.to_vec();
		Ok(RawResponse { status, body, set_cookie })
	}
}

fn extract_session_cookie(set_cookie: &str) -> Option<&str> {
	let first = set_cookie.split(';').next()?.trim();
	first.strip_prefix("session=").map(|_| first)
}

/// Static request headers, keyed off the crate's own version, that never
/// change per call.
fn user_agent(suffix: Option<&str>) -> String {
	let base = format!("NoSQL-RustSDK/{}", env!("CARGO_PKG_VERSION"));
	match suffix {
		Some(s) => format!("{base} ({s})"),
		None => base,
	}
}

/// Owns the protocol manager, session cookie, request-id counter, auth
/// provider, and transport for one client; `execute` runs exactly one
/// logical call end to end, including protocol downgrade retries, but not
/// the outer retry-on-failure loop (that belongs to
/// [`crate::client::Client::execute`], which also threads in rate limiting).
/// Batch-write requests (§4.8 `WriteMultiple`) get a larger size ceiling than
/// ordinary requests since they bundle up to 50 sub-operations.
const MAX_BATCH_REQUEST_BYTES: usize = 25 * 1024 * 1024;

pub struct Pipeline {
	transport: Arc<dyn Transport>,
	pub protocol: Arc<ProtocolManager>,
	auth: Arc<dyn AuthProvider>,
	observer: Option<Arc<dyn Observer>>,
	cookie: Mutex<Option<String>>,
	request_id: AtomicU64,
	user_agent_suffix: Option<String>,
	compartment_header: &'static str,
	namespace_header: &'static str,
	max_content_length: usize,
}

impl Pipeline {
	#[must_use]
	pub fn new(transport: Arc<dyn Transport>, auth: Arc<dyn AuthProvider>, observer: Option<Arc<dyn Observer>>, user_agent_suffix: Option<String>) -> Self {
		Self::with_max_content_length(transport, auth, observer, user_agent_suffix, 2 * 1024 * 1024)
	}

	#[must_use]
	pub fn with_max_content_length(
		transport: Arc<dyn Transport>,
		auth: Arc<dyn AuthProvider>,
		observer: Option<Arc<dyn Observer>>,
		user_agent_suffix: Option<String>,
		max_content_length: usize,
	) -> Self {
		Self {
			transport,
			protocol: Arc::new(ProtocolManager::new()),
			auth,
			observer,
			cookie: Mutex::new(None),
			request_id: AtomicU64::new(1),
			user_agent_suffix,
			compartment_header: "x-nosql-compartment-id",
			namespace_header: "x-nosql-namespace",
			max_content_length,
		}
	}

	#[must_use]
	pub fn next_request_id(&self) -> u64 {
		self.request_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Runs one public-API call: serializes against the currently active
	/// protocol version, sends it, and if the server reports the version is
	/// unsupported, downgrades and retries the same logical attempt without
	/// consuming one of the caller's retry-budget attempts (§4.5, §4.6 point
	/// "Protocol-downgrade").
	#[instrument(skip(self, req), fields(op = ?req.op.op_code(), request_id = req.request_id))]
	pub async fn execute(&self, req: &mut Request) -> Result<OpResult> {
		loop {
			let version = self.protocol.current();
			req.serialized_version = Some(version);

			let mut buf = ResizableBuffer::new();
			req.op.serialize(version, &mut buf, req)?;
			let body = buf.slice(0, buf.len())?.to_vec();

			let limit = if req.op.op_code() == OpCode::WriteMultiple {
				MAX_BATCH_REQUEST_BYTES
			} else {
				self.max_content_length
			};
			if body.len() > limit {
				return Err(NoSQLError::server(
					ErrorCode::RequestSizeLimitExceeded,
					format!("request size {} exceeds the limit of {limit} bytes", body.len()),
				));
			}

			let headers = self.build_headers(req, version, body.len()).await?;
			let timeout = req.remaining().min(MAX_REQUEST_TIMEOUT);
			let raw = self.transport.send(body, headers, timeout).await?;

			if let Some(cookie) = raw.set_cookie {
				*self.cookie.lock() = Some(cookie);
			}

			match raw.status {
				200 => {
					let resp_buf = {
						let mut b = ResizableBuffer::with_capacity(raw.body.len());
						b.append_bytes(&raw.body);
						b
					};
					match req.op.deserialize(version, &resp_buf, req) {
						Ok(result) => return Ok(result),
						Err(NoSQLError::UnsupportedProtocol) => {
							if self.try_downgrade(version) {
								continue;
							}
							return Err(NoSQLError::UnsupportedProtocol);
						}
						Err(err) => return Err(err),
					}
				}
				400 => {
					if is_unsupported_protocol_body(&raw.body) && self.try_downgrade(version) {
						continue;
					}
					return Err(NoSQLError::Service {
						status: 400,
						detail: String::from_utf8_lossy(&raw.body).into_owned(),
					});
				}
				other => {
					return Err(NoSQLError::Service {
						status: other,
						detail: String::from_utf8_lossy(&raw.body).into_owned(),
					})
				}
			}
		}
	}

	fn try_downgrade(&self, observed: ProtocolVersion) -> bool {
		match self.protocol.try_downgrade(observed) {
			Some(next) => {
				warn!(from = ?observed, to = ?next, "downgrading protocol version after UNSUPPORTED_PROTOCOL");
				true
			}
			None => {
				// Either already at the floor, or another in-flight request
				// already downgraded past `observed`; re-reading the current
				// version lets the caller's loop retry without decrementing
				// further.
				debug!(observed = ?observed, current = ?self.protocol.current(), "downgrade race or floor reached");
				self.protocol.current() != observed
			}
		}
	}

	async fn build_headers(&self, req: &Request, version: ProtocolVersion, content_length: usize) -> Result<Vec<(String, String)>> {
		let mut headers = vec![
			("Content-Type".to_string(), "application/octet-stream".to_string()),
			("Content-Length".to_string(), content_length.to_string()),
			("User-Agent".to_string(), user_agent(self.user_agent_suffix.as_deref())),
			("x-nosql-request-id".to_string(), req.request_id.to_string()),
			("Connection".to_string(), "keep-alive".to_string()),
			("Accept".to_string(), "application/octet-stream".to_string()),
		];
		if let Some(cookie) = self.cookie.lock().clone() {
			headers.push(("Cookie".to_string(), cookie));
		}
		if let Some(compartment) = &req.options.compartment {
			headers.push((self.compartment_header.to_string(), compartment.clone()));
		}
		if let Some(namespace) = &req.options.namespace {
			headers.push((self.namespace_header.to_string(), namespace.clone()));
		}
		let auth = self.auth.get_authorization(req).await?;
		headers.extend(auth.headers);
		let _ = version;
		Ok(headers)
	}

	pub fn on_invalid_authorization(&self, err: &NoSQLError) {
		self.auth.on_invalid_authorization(err);
	}

	#[must_use]
	pub fn observer(&self) -> Option<&Arc<dyn Observer>> {
		self.observer.as_ref()
	}
}

/// V4 NSON responses never start with the raw error-code byte the way V2/V3
/// do; a 400 body from a version mismatch is recognized the same way a
/// non-400 deserialize failure is, by checking whether the leading bytes
/// decode to error code 17 (`UNSUPPORTED_PROTOCOL`) or 24
/// (`BAD_PROTOCOL_MESSAGE`) under the binary reader, per §4.5's
/// disambiguation rule.
fn is_unsupported_protocol_body(body: &[u8]) -> bool {
	if body.is_empty() {
		return false;
	}
	let mut buf = ResizableBuffer::with_capacity(body.len());
	buf.append_bytes(body);
	let mut r = BinaryReader::new(&buf, ProtocolVersion::V2);
	let Ok(code) = r.read_error_code() else {
		return false;
	};
	matches!(ErrorCode::from_i32(code), Some(ErrorCode::UnsupportedProtocol) | Some(ErrorCode::BadProtocolMessage))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_agent_carries_suffix() {
		assert!(user_agent(None).starts_with("NoSQL-RustSDK/"));
		assert!(user_agent(Some("linux-x86_64")).ends_with("(linux-x86_64)"));
	}

	#[test]
	fn session_cookie_prefix_is_required() {
		assert_eq!(extract_session_cookie("session=abc123; Path=/"), Some("session=abc123"));
		assert_eq!(extract_session_cookie("other=xyz; Path=/"), None);
	}
}
