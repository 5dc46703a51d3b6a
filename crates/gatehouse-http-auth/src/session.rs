//! Browser sessions shared by the Basic and OIDC strategies

use chrono::Utc;
use cookie::{Cookie, SameSite};
use gatehouse_auth::{generate_session_token, hash_session_token, SESSION_COOKIE};
use gatehouse_store::{Session, Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{IncomingRequest, IssuedSession};

pub struct SessionManager {
    store: Arc<dyn Store>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The live session carried by the request, if it was issued for this
    /// subdomain by `method`.
    pub async fn validate(
        &self,
        request: &IncomingRequest<'_>,
        subdomain: &str,
        method: &str,
    ) -> Result<Option<Session>, StoreError> {
        let Some(token) = request.cookie(SESSION_COOKIE) else {
            return Ok(None);
        };

        let token_hash = hash_session_token(&token);
        let Some(session) = self.store.get_session(&token_hash).await? else {
            return Ok(None);
        };

        if session.expires_at <= Utc::now() {
            debug!(subdomain = %subdomain, "Session expired");
            if let Err(e) = self.store.delete_session(&token_hash).await {
                warn!(error = %e, "Failed to delete expired session");
            }
            return Ok(None);
        }
        if session.subdomain != subdomain || session.method != method {
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub async fn establish(
        &self,
        subdomain: &str,
        identity: &str,
        method: &str,
        ttl: Duration,
    ) -> Result<IssuedSession, StoreError> {
        let token = generate_session_token();
        let now = Utc::now();
        let ttl_chrono = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24));

        self.store
            .create_session(&Session {
                token_hash: hash_session_token(&token),
                subdomain: subdomain.to_string(),
                identity: identity.to_string(),
                method: method.to_string(),
                expires_at: now + ttl_chrono,
                created_at: now,
            })
            .await?;

        debug!(subdomain = %subdomain, identity = %identity, method, "Session established");
        Ok(IssuedSession {
            token,
            max_age: ttl,
        })
    }

    /// Delete the session carried by the request, if any
    pub async fn revoke(&self, request: &IncomingRequest<'_>) -> Result<bool, StoreError> {
        let Some(token) = request.cookie(SESSION_COOKIE) else {
            return Ok(false);
        };
        self.store.delete_session(&hash_session_token(&token)).await?;
        Ok(true)
    }
}

fn base_cookie(value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .build()
}

/// Cookie for a freshly issued session
pub fn session_cookie(session: &IssuedSession, secure: bool) -> Cookie<'static> {
    let mut cookie = base_cookie(session.token.clone(), secure);
    let max_age = i64::try_from(session.max_age.as_secs()).unwrap_or(i64::MAX);
    cookie.set_max_age(time::Duration::seconds(max_age));
    cookie
}

/// Removal cookie for the session, sent on logout
pub fn clear_session_cookie(secure: bool) -> Cookie<'static> {
    let mut cookie = base_cookie(String::new(), secure);
    cookie.make_removal();
    cookie
}
