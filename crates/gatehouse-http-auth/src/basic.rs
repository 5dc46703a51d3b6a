//! HTTP Basic authentication (RFC 7617) with session upgrade
//!
//! A browser that already logged in presents the session cookie and never
//! touches a password hash. Otherwise `Authorization: Basic` is checked
//! against the policy's Argon2 hashes and, on success, a session is minted
//! so concurrent requests from the same client stop re-prompting. Clients
//! with no credential at all are sent to the login form.

use async_trait::async_trait;
use base64::Engine;
use gatehouse_auth::PasswordChecker;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::paths::{with_return_to, LOGIN_PATH};
use crate::{
    AuthContext, AuthIdentity, AuthOutcome, AuthStrategy, EffectivePolicy, IncomingRequest,
    SessionManager,
};

const METHOD: &str = "basic";

pub struct BasicStrategy {
    sessions: Arc<SessionManager>,
    passwords: PasswordChecker,
}

impl BasicStrategy {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            passwords: PasswordChecker::new(),
        }
    }

    pub fn verify_credentials(&self, policy: &EffectivePolicy, username: &str, password: &str) -> bool {
        let stored = policy
            .basic_users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.password_hash.as_str());
        self.passwords.check(password, stored).unwrap_or_else(|e| {
            warn!(username = %username, error = %e, "Stored password hash is unreadable");
            false
        })
    }

    /// Verify a username/password pair and open a session for it.
    ///
    /// Used for both the `Authorization` header and the login form.
    pub async fn login(
        &self,
        policy: &EffectivePolicy,
        ctx: &AuthContext,
        username: &str,
        password: &str,
    ) -> AuthOutcome {
        if !self.verify_credentials(policy, username, password) {
            debug!(subdomain = %ctx.subdomain, username = %username, "Basic auth: invalid credentials");
            return AuthOutcome::Failure("invalid username or password".to_string());
        }

        let new_session = match self
            .sessions
            .establish(&ctx.subdomain, username, METHOD, policy.session_ttl)
            .await
        {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(subdomain = %ctx.subdomain, error = %e, "Could not persist session, continuing without one");
                None
            }
        };

        AuthOutcome::Authenticated(AuthIdentity {
            identity: username.to_string(),
            method: METHOD,
            new_session,
        })
    }
}

/// `(username, password)` from an `Authorization: Basic ...` value
pub fn decode_basic_header(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[async_trait]
impl AuthStrategy for BasicStrategy {
    async fn authenticate(
        &self,
        request: &IncomingRequest<'_>,
        policy: &EffectivePolicy,
        ctx: &AuthContext,
    ) -> AuthOutcome {
        match self.sessions.validate(request, &ctx.subdomain, METHOD).await {
            Ok(Some(session)) => {
                return AuthOutcome::Authenticated(AuthIdentity {
                    identity: session.identity,
                    method: METHOD,
                    new_session: None,
                })
            }
            Ok(None) => {}
            Err(e) => warn!(subdomain = %ctx.subdomain, error = %e, "Session lookup failed"),
        }

        match request.header("authorization") {
            Some(value)
                if value
                    .get(..6)
                    .is_some_and(|scheme| scheme.eq_ignore_ascii_case("basic ")) =>
            {
                match decode_basic_header(value) {
                    Some((username, password)) => self.login(policy, ctx, &username, &password).await,
                    None => AuthOutcome::Failure("malformed basic credentials".to_string()),
                }
            }
            _ => {
                debug!(subdomain = %ctx.subdomain, "Basic auth: no credentials, redirecting to login");
                AuthOutcome::Redirect(with_return_to(LOGIN_PATH, request.path))
            }
        }
    }

    fn auth_type(&self) -> &'static str {
        METHOD
    }
}
