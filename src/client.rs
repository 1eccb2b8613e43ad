// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The façade tying buffer/codec, transport, and rate limiting together
//! (§3 "Configured values", §4.12 retry handler). Building and issuing the
//! operation-specific `Request` is left to the caller; this module owns only
//! the generic pipeline: retry budget, rate-limit accounting, and observer/
//! tracing hooks around one [`Pipeline::execute`] call per attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{info, instrument, warn};

use crate::auth::{AuthProvider, NoAuthProvider};
use crate::error::{ErrorCode, NoSQLError, Result};
use crate::events::Observer;
use crate::op::{OpRegistry, OpResult};
use crate::rate_limiter::{RateLimiterClient, RateLimiterConfig, TableLimitsSource};
use crate::request::{Request, RequestOptions};
use crate::transport::{HttpTransport, Pipeline, Transport};
use crate::types::{Consistency, Durability, ErrorCodeHint, TableLimits, TableState};

/// `fn should_retry`/`fn delay` (§4.12): layered on top of `Op::should_retry`,
/// which vetoes retrying DDL/admin/list/prepare operations outright.
pub trait RetryHandler: Send + Sync {
	fn should_retry(&self, req: &Request, err: &NoSQLError) -> bool;
	fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff, base 100ms, capped at 5s, with 20% jitter (§4.12).
pub struct DefaultRetryHandler {
	base: Duration,
	cap: Duration,
}

impl Default for DefaultRetryHandler {
	fn default() -> Self {
		Self {
			base: Duration::from_millis(100),
			cap: Duration::from_secs(5),
		}
	}
}

impl RetryHandler for DefaultRetryHandler {
	fn should_retry(&self, _req: &Request, err: &NoSQLError) -> bool {
		err.is_retryable()
	}

	fn delay(&self, attempt: u32) -> Duration {
		let exp = self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
		let capped = exp.min(self.cap);
		let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
		let jittered_nanos = (capped.as_nanos() as f64 * (1.0 + jitter_frac)).max(0.0);
		Duration::from_nanos(jittered_nanos as u64)
	}
}

/// Everything a [`Client`] is constructed from (§3 "Configured values (no
/// CLI)"). Parsing this out of a file or environment is out of scope here;
/// callers build one directly.
pub struct NoSQLConfig {
	pub endpoint: String,
	pub timeout: Duration,
	pub table_request_timeout: Duration,
	pub security_info_timeout: Duration,
	pub max_content_length: usize,
	pub consistency: Consistency,
	pub durability: Option<Durability>,
	pub retry_handler: Arc<dyn RetryHandler>,
	pub rate_limiting: Option<RateLimiterConfig>,
	pub auth_provider: Arc<dyn AuthProvider>,
	pub user_agent_suffix: Option<String>,
	pub observer: Option<Arc<dyn Observer>>,
}

impl NoSQLConfig {
	#[must_use]
	pub fn new(endpoint: impl Into<String>) -> Self {
		Self {
			endpoint: endpoint.into(),
			timeout: Duration::from_secs(5),
			table_request_timeout: Duration::from_secs(10),
			security_info_timeout: Duration::from_secs(10),
			max_content_length: 2 * 1024 * 1024,
			consistency: Consistency::Eventual,
			durability: None,
			retry_handler: Arc::new(DefaultRetryHandler::default()),
			rate_limiting: None,
			auth_provider: Arc::new(NoAuthProvider),
			user_agent_suffix: None,
			observer: None,
		}
	}

	#[must_use]
	pub fn default_request_options(&self) -> RequestOptions {
		RequestOptions {
			timeout: self.timeout,
			consistency: self.consistency,
			durability: self.durability,
			compartment: None,
			namespace: None,
		}
	}
}

/// Routes a `GetTable` call back through the same [`Pipeline`] every other
/// operation uses, so the rate limiter's background refresh shares the one
/// connection pool and protocol version instead of opening a side channel.
struct PipelineTableSource {
	pipeline: Arc<Pipeline>,
	registry: Arc<OpRegistry>,
	request_options: RequestOptions,
}

#[async_trait]
impl TableLimitsSource for PipelineTableSource {
	async fn get_table_limits(&self, table_name: &str) -> Result<(TableState, TableLimits)> {
		let op = self
			.registry
			.get(crate::types::OpCode::GetTable)
			.expect("GetTable is always registered");
		let mut options = self.request_options.clone();
		options.timeout = crate::transport::BACKGROUND_REFRESH_TIMEOUT;
		let mut req = Request::new(op, options, self.pipeline.protocol.current(), self.pipeline.next_request_id());
		req.set_table_name(table_name);
		match self.pipeline.execute(&mut req).await? {
			OpResult::Table { state, limits, .. } => Ok((state, limits)),
			other => Err(NoSQLError::Protocol {
				operation: "GetTable".to_string(),
				detail: format!("unexpected result variant: {other:?}"),
			}),
		}
	}
}

/// Ties the pipeline, operation registry, and (optional) per-table rate
/// limiter together behind one retry loop.
pub struct Client {
	config: NoSQLConfig,
	pipeline: Arc<Pipeline>,
	registry: Arc<OpRegistry>,
	rate_limiter: Option<Arc<RateLimiterClient>>,
}

impl Client {
	/// Builds the pipeline against a real `reqwest` transport and, if
	/// `config.rate_limiting` is set, starts the single background refresh
	/// task (§5 "single scheduler, not per-table timers").
	pub async fn new(config: NoSQLConfig) -> Result<Self> {
		let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.endpoint));
		Self::with_transport(config, transport).await
	}

	/// Same as [`Client::new`] but with an injected [`Transport`], the seam
	/// integration tests use to script server responses (§8 items 6-16).
	pub async fn with_transport(config: NoSQLConfig, transport: Arc<dyn Transport>) -> Result<Self> {
		config.auth_provider.on_init().await?;

		let pipeline = Arc::new(Pipeline::with_max_content_length(
			transport,
			Arc::clone(&config.auth_provider),
			config.observer.clone(),
			config.user_agent_suffix.clone(),
			config.max_content_length,
		));
		let registry = Arc::new(OpRegistry::new());

		let rate_limiter = if let Some(rl_config) = &config.rate_limiting {
			let source: Arc<dyn TableLimitsSource> = Arc::new(PipelineTableSource {
				pipeline: Arc::clone(&pipeline),
				registry: Arc::clone(&registry),
				request_options: config.default_request_options(),
			});
			let client = Arc::new(RateLimiterClient::new(rl_config.clone(), source));
			client.start_background_refresh();
			Some(client)
		} else {
			None
		};

		Ok(Self {
			config,
			pipeline,
			registry,
			rate_limiter,
		})
	}

	#[must_use]
	pub fn registry(&self) -> &Arc<OpRegistry> {
		&self.registry
	}

	#[must_use]
	pub fn default_request_options(&self) -> RequestOptions {
		self.config.default_request_options()
	}

	/// Runs a `Request` to completion: rate-limiter admission, one or more
	/// pipeline attempts (each of which may itself retry transparently on
	/// protocol downgrade), and the outer retry-on-failure loop with
	/// exponential backoff (§4.6, §4.7).
	#[instrument(skip(self, req), fields(op = ?req.op.op_code()))]
	pub async fn execute(&self, mut req: Request) -> Result<OpResult> {
		let mut deadline_extension = Duration::ZERO;

		let rate_limiter_entry = if req.op.supports_rate_limiting() {
			match (&self.rate_limiter, req.table_name()) {
				(Some(rl), Some(table)) => rl.init_request(table).await,
				_ => None,
			}
		} else {
			None
		};
		req.rate_limiter_entry = rate_limiter_entry.clone();

		loop {
			if let (Some(rl), Some(entry)) = (&self.rate_limiter, &rate_limiter_entry) {
				rl.start_request(entry, req.does_reads, req.does_writes, req.remaining() + deadline_extension)
					.await?;
			}

			let result = self.pipeline.execute(&mut req).await;

			match &result {
				Ok(OpResult::Get { capacity, .. })
				| Ok(OpResult::Put { capacity, .. })
				| Ok(OpResult::Delete { capacity, .. })
				| Ok(OpResult::MultiDelete { capacity, .. })
				| Ok(OpResult::Query { capacity, .. }) => {
					if let Some(observer) = self.observer() {
						observer.on_consumed_capacity(&req, capacity);
					}
					if let (Some(rl), Some(entry)) = (&self.rate_limiter, &rate_limiter_entry) {
						let mut capacity = capacity.clone();
						rl.finish_request(entry, req.does_reads, req.does_writes, req.remaining() + deadline_extension, &mut capacity)
							.await?;
					}
				}
				Ok(OpResult::Table { table_name, state, .. }) => {
					if let Some(observer) = self.observer() {
						observer.on_table_state(table_name, *state);
					}
				}
				_ => {}
			}

			let err = match result {
				Ok(value) => return Ok(value),
				Err(err) => err,
			};

			req.last_error = Some(err.clone());

			if let Some(code) = err.error_code() {
				if let Some(rl) = &self.rate_limiter {
					let hint = match code {
						ErrorCode::ReadLimitExceeded => Some(ErrorCodeHint::ReadLimitExceeded),
						ErrorCode::WriteLimitExceeded => Some(ErrorCodeHint::WriteLimitExceeded),
						_ => None,
					};
					if let Some(hint) = hint {
						rl.on_error(&mut req, hint);
					}
				}
				if code == ErrorCode::InvalidAuthorization {
					self.pipeline.on_invalid_authorization(&err);
				}
				// A SECURITY_INFO_UNAVAILABLE response extends this call's
				// effective budget to at least `security_info_timeout`
				// without shortening a caller-supplied longer timeout.
				if code == ErrorCode::SecurityInfoUnavailable {
					let wanted = self.config.security_info_timeout;
					if wanted > req.remaining() {
						deadline_extension += wanted - req.remaining();
					}
				}
			}

			let total_remaining = req.remaining() + deadline_extension;
			if total_remaining.is_zero() {
				let timeout_err = NoSQLError::Timeout {
					attempts: req.attempt + 1,
					elapsed: req.elapsed(),
					last_cause: err.to_string(),
				};
				if let Some(observer) = self.observer() {
					observer.on_error(&req, &timeout_err);
				}
				return Err(timeout_err);
			}
			if !req.op.should_retry() || !self.config.retry_handler.should_retry(&req, &err) {
				if let Some(observer) = self.observer() {
					observer.on_error(&req, &err);
				}
				return Err(err);
			}

			let delay = self.config.retry_handler.delay(req.attempt).min(total_remaining);
			req.attempt += 1;
			if let Some(observer) = self.observer() {
				observer.on_retryable(&req, &err, req.attempt);
			}
			warn!(attempt = req.attempt, delay = ?delay, error = %err, "retrying");
			tokio::time::sleep(delay).await;
		}
	}

	fn observer(&self) -> Option<&Arc<dyn Observer>> {
		self.config.observer.as_ref()
	}

	/// Stops the rate limiter's background task and releases the auth
	/// provider's resources. Idempotent.
	pub async fn close(&self) {
		if let Some(rl) = &self.rate_limiter {
			rl.close();
		}
		self.config.auth_provider.close().await;
		info!("client closed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_is_monotone_and_capped() {
		let handler = DefaultRetryHandler::default();
		for attempt in 0..10 {
			let d = handler.delay(attempt);
			assert!(d <= handler.cap + handler.cap / 5);
		}
	}

	#[test]
	fn config_defaults_are_sane() {
		let config = NoSQLConfig::new("https://localhost:8080");
		assert_eq!(config.consistency, Consistency::Eventual);
		assert!(config.durability.is_none());
		assert!(config.rate_limiting.is_none());
	}
}
