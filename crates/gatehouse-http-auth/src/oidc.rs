//! OpenID Connect
//!
//! The gateway only validates its own session cookie here. Without one the
//! client is sent to the OIDC login route, which redirects to the provider;
//! the callback hands the authorization code to an [`OidcExchange`]
//! implementation and opens a session for the identity it returns.

use async_trait::async_trait;
use gatehouse_store::OidcSettings;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::paths::{with_return_to, OIDC_LOGIN_PATH};
use crate::{
    AuthContext, AuthIdentity, AuthOutcome, AuthStrategy, DenyReason, EffectivePolicy,
    IncomingRequest, SessionManager,
};

pub const METHOD: &str = "oidc";

#[derive(Debug, Clone, PartialEq)]
pub struct OidcIdentity {
    pub subject: String,
    pub email: Option<String>,
}

impl OidcIdentity {
    /// Name recorded on the session
    pub fn display(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.subject)
    }
}

#[derive(Error, Debug)]
pub enum OidcError {
    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("OIDC is not configured for this policy")]
    NotConfigured,

    #[error("Email domain not allowed: {0}")]
    DomainNotAllowed(String),
}

/// Authorization-code exchange with the identity provider
#[async_trait]
pub trait OidcExchange: Send + Sync {
    async fn exchange_code(
        &self,
        settings: &OidcSettings,
        code: &str,
        redirect_uri: &str,
    ) -> Result<OidcIdentity, OidcError>;
}

/// Provider URL the login route redirects to
pub fn authorize_url(settings: &OidcSettings, redirect_uri: &str, state: &str) -> String {
    let scopes = if settings.scopes.is_empty() {
        "openid email".to_string()
    } else {
        settings.scopes.join(" ")
    };
    let separator = if settings.authorize_url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        settings.authorize_url,
        separator,
        urlencoding::encode(&settings.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scopes),
        urlencoding::encode(state),
    )
}

/// Whether the identity's email domain is admitted by the policy
pub fn email_allowed(settings: &OidcSettings, email: Option<&str>) -> bool {
    if settings.allowed_domains.is_empty() {
        return true;
    }
    let Some(domain) = email.and_then(|e| e.rsplit_once('@')).map(|(_, d)| d) else {
        return false;
    };
    settings
        .allowed_domains
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(domain))
}

pub struct OidcStrategy {
    sessions: Arc<SessionManager>,
}

impl OidcStrategy {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl AuthStrategy for OidcStrategy {
    async fn authenticate(
        &self,
        request: &IncomingRequest<'_>,
        policy: &EffectivePolicy,
        ctx: &AuthContext,
    ) -> AuthOutcome {
        if policy.oidc.is_none() {
            warn!(subdomain = %ctx.subdomain, "OIDC policy has no provider settings");
            return AuthOutcome::Denied(DenyReason::Misconfigured(
                "oidc provider not configured".to_string(),
            ));
        }

        match self.sessions.validate(request, &ctx.subdomain, METHOD).await {
            Ok(Some(session)) => AuthOutcome::Authenticated(AuthIdentity {
                identity: session.identity,
                method: METHOD,
                new_session: None,
            }),
            Ok(None) => {
                debug!(subdomain = %ctx.subdomain, "OIDC: no session, redirecting to login");
                AuthOutcome::Redirect(with_return_to(OIDC_LOGIN_PATH, request.path))
            }
            Err(e) => {
                warn!(subdomain = %ctx.subdomain, error = %e, "Session lookup failed");
                AuthOutcome::Denied(DenyReason::Unavailable)
            }
        }
    }

    fn auth_type(&self) -> &'static str {
        METHOD
    }
}
