// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The auth-provider contract (§4.9). Concrete implementations (signature
//! cloud auth, instance/resource principals, on-prem session tokens) are all
//! external to this crate.

use async_trait::async_trait;

use crate::error::{NoSQLError, Result};
use crate::request::Request;

/// The set of headers an [`AuthProvider`] hands back for one request, to be
/// merged into the outgoing HTTP POST.
#[derive(Clone, Debug, Default)]
pub struct AuthHeaders {
	pub headers: Vec<(String, String)>,
}

impl AuthHeaders {
	#[must_use]
	pub fn bearer(token: impl Into<String>) -> Self {
		Self {
			headers: vec![("Authorization".to_string(), format!("Bearer {}", token.into()))],
		}
	}
}

/// The single interface the pipeline consumes for authorization. May inspect
/// the request's serialized buffer to compute a signature; must be
/// idempotent and side-effect-free except for internal caches.
#[async_trait]
pub trait AuthProvider: Send + Sync {
	async fn get_authorization(&self, req: &Request) -> Result<AuthHeaders>;

	/// One-time setup; default is a no-op.
	async fn on_init(&self) -> Result<()> {
		Ok(())
	}

	/// Invalidates any cached authorization after the pipeline observes a
	/// 401, so the next attempt re-derives it. Default is a no-op.
	fn on_invalid_authorization(&self, _last_error: &NoSQLError) {}

	/// Releases timers, file watchers, HTTP agents, etc. Default is a no-op.
	async fn close(&self) {}
}

/// An `AuthProvider` that attaches no headers at all, for on-prem
/// deployments without security enabled.
#[derive(Debug, Default)]
pub struct NoAuthProvider;

#[async_trait]
impl AuthProvider for NoAuthProvider {
	async fn get_authorization(&self, _req: &Request) -> Result<AuthHeaders> {
		Ok(AuthHeaders::default())
	}
}
