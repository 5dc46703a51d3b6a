//! HTTP authorization pipeline for gatehouse tunnels
//!
//! Every request forwarded to a tunnel passes through three stages:
//!
//! 1. [`PolicyResolver`] works out the [`EffectivePolicy`] for the subdomain
//!    (application policy, else organization policy, else none).
//! 2. [`RateLimitResolver`] picks the limiter for the application and rejects
//!    clients that failed too often.
//! 3. [`AuthDispatcher`] hands the request to exactly one credential strategy
//!    ([`BasicStrategy`], [`ApiKeyStrategy`] or [`OidcStrategy`]).
//!
//! Strategies implement [`AuthStrategy`]; each returns an [`AuthOutcome`].
//! Only [`AuthOutcome::Failure`] counts against the rate limiter.
//!
//! # Usage
//!
//! ```ignore
//! let (ctx, policy) = resolver.resolve("demo").await?;
//! let request = IncomingRequest::new("GET", "/", &headers, client_ip);
//! match dispatcher.authenticate(&request, &policy, &ctx).await {
//!     AuthOutcome::Authenticated(identity) => { /* forward */ }
//!     AuthOutcome::Redirect(location) => { /* 302 */ }
//!     other => { /* 401 / 403 / 429 */ }
//! }
//! ```

mod api_key;
mod basic;
mod context;
mod dispatcher;
mod mutations;
mod oidc;
pub mod paths;
mod policy;
mod rate_limit;
mod request;
mod session;

pub use api_key::{extract_api_key, ApiKeyStrategy, API_KEY_HEADER, API_KEY_HEADER_ALIAS};
pub use basic::{decode_basic_header, BasicStrategy};
pub use context::AuthContext;
pub use dispatcher::{AuthDispatcher, DispatcherConfig};
pub use mutations::PolicyMutations;
pub use oidc::{
    authorize_url, email_allowed, OidcError, OidcExchange, OidcIdentity, OidcStrategy,
    METHOD as OIDC_METHOD,
};
pub use policy::{resolve, EffectivePolicy, PolicyResolver, PolicySource};
pub use rate_limit::{RateLimitConfig, RateLimitResolver, RateLimiter, RATE_LIMIT_CACHE_TTL};
pub use request::IncomingRequest;
pub use session::{clear_session_cookie, session_cookie, SessionManager};

use async_trait::async_trait;
use gatehouse_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Who a request was authenticated as
#[derive(Debug, Clone, PartialEq)]
pub struct AuthIdentity {
    pub identity: String,
    /// Strategy that vouched for the identity (`basic`, `api_key`, `oidc`, `none`)
    pub method: &'static str,
    /// A session minted by this request; the caller sets it as a cookie
    pub new_session: Option<IssuedSession>,
}

impl AuthIdentity {
    pub fn anonymous() -> Self {
        Self {
            identity: "anonymous".to_string(),
            method: "none",
            new_session: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedSession {
    pub token: String,
    pub max_age: Duration,
}

/// Why a request was refused without it being a bad credential
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    /// Too many failed attempts from this client
    RateLimited { retry_after: Duration },
    /// The policy cannot be evaluated (unknown type, missing OIDC settings)
    Misconfigured(String),
    /// Storage could not be reached
    Unavailable,
}

/// Result of one authentication attempt.
///
/// Exactly one of: authenticated, a redirect, a challenge, a failed
/// credential, or a denial that is not the client's fault.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Authenticated(AuthIdentity),
    /// Send the client somewhere to log in
    Redirect(String),
    /// No credential presented; value for `WWW-Authenticate`
    Challenge(String),
    /// A credential was presented and rejected
    Failure(String),
    Denied(DenyReason),
}

impl AuthOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthOutcome::Authenticated(_))
    }

    /// Whether this outcome counts against the client's rate limit
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, AuthOutcome::Failure(_))
    }
}

/// A credential strategy for one policy type
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        request: &IncomingRequest<'_>,
        policy: &EffectivePolicy,
        ctx: &AuthContext,
    ) -> AuthOutcome;

    /// Strategy name, for logging
    fn auth_type(&self) -> &'static str;
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Policy owner mismatch: {0}")]
    OwnerMismatch(String),

    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),
}
