//! API-key authentication
//!
//! A key is accepted from `X-API-Key`, from the `X-Gatehouse-Key` alias, or
//! as a Bearer token carrying the reserved `ghk_` prefix. Keys are looked up
//! by SHA-256 digest and must be active, unexpired and scoped to the
//! application or organization being accessed.

use async_trait::async_trait;
use chrono::Utc;
use gatehouse_auth::{hash_api_key, looks_like_api_key};
use gatehouse_store::{ApiKey, Store, StoreError};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    AuthContext, AuthIdentity, AuthOutcome, AuthStrategy, DenyReason, EffectivePolicy,
    IncomingRequest,
};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_HEADER_ALIAS: &str = "x-gatehouse-key";

const METHOD: &str = "api_key";

/// The API key carried by a request, if any
pub fn extract_api_key<'a>(request: &IncomingRequest<'a>) -> Option<&'a str> {
    if let Some(key) = request
        .header(API_KEY_HEADER)
        .or_else(|| request.header(API_KEY_HEADER_ALIAS))
    {
        let key = key.trim();
        if !key.is_empty() {
            return Some(key);
        }
    }
    request.bearer_token().filter(|token| looks_like_api_key(token))
}

pub struct ApiKeyStrategy {
    store: Arc<dyn Store>,
}

impl ApiKeyStrategy {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Organization the key acts for: its own scope, else its account's
    async fn key_org(&self, key: &ApiKey) -> Result<Option<String>, StoreError> {
        if key.org_id.is_some() {
            return Ok(key.org_id.clone());
        }
        match &key.account_id {
            Some(account_id) => Ok(self
                .store
                .get_account(account_id)
                .await?
                .and_then(|account| account.org_id)),
            None => Ok(None),
        }
    }

    async fn check(&self, presented: &str, ctx: &AuthContext) -> Result<AuthOutcome, StoreError> {
        let Some(key) = self.store.find_api_key_by_hash(&hash_api_key(presented)).await? else {
            return Ok(AuthOutcome::Failure("invalid api key".to_string()));
        };

        let now = Utc::now();
        if !key.is_usable_at(now) {
            return Ok(AuthOutcome::Failure("api key revoked or expired".to_string()));
        }

        if let Some(app_id) = &key.app_id {
            if ctx.app_id.as_ref() != Some(app_id) {
                return Ok(AuthOutcome::Failure("api key not valid for this application".to_string()));
            }
        } else if let Some(ctx_org) = &ctx.org_id {
            if self.key_org(&key).await?.as_ref() != Some(ctx_org) {
                return Ok(AuthOutcome::Failure("api key not valid for this organization".to_string()));
            }
        }

        if let Err(e) = self.store.touch_api_key(&key.id, now).await {
            warn!(key_id = %key.id, error = %e, "Failed to update api key last-used time");
        }

        debug!(subdomain = %ctx.subdomain, key = %key.display_prefix, "API key accepted");
        Ok(AuthOutcome::Authenticated(AuthIdentity {
            identity: format!("api_key:{}", key.name),
            method: METHOD,
            new_session: None,
        }))
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyStrategy {
    async fn authenticate(
        &self,
        request: &IncomingRequest<'_>,
        _policy: &EffectivePolicy,
        ctx: &AuthContext,
    ) -> AuthOutcome {
        let Some(presented) = extract_api_key(request) else {
            return AuthOutcome::Challenge("ApiKey".to_string());
        };

        match self.check(presented, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(subdomain = %ctx.subdomain, error = %e, "API key lookup failed");
                AuthOutcome::Denied(DenyReason::Unavailable)
            }
        }
    }

    fn auth_type(&self) -> &'static str {
        METHOD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gatehouse_auth::generate_api_key;
    use gatehouse_store::{Account, Application, AuthMode, MemoryStore};
    use std::net::{IpAddr, Ipv4Addr};

    fn ctx() -> AuthContext {
        AuthContext::for_application(Application {
            id: "app-1".into(),
            org_id: "org-1".into(),
            name: "Demo".into(),
            subdomain: "demo".into(),
            auth_mode: AuthMode::Custom,
            rate_limit: None,
            created_at: Utc::now(),
        })
    }

    fn stored_key(hash: &str, org: Option<&str>, app: Option<&str>) -> ApiKey {
        ApiKey {
            id: format!("key-{}", &hash[..6]),
            name: "ci".into(),
            account_id: None,
            org_id: org.map(String::from),
            app_id: app.map(String::from),
            display_prefix: "ghk_abcd".into(),
            key_hash: hash.to_string(),
            is_active: true,
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    async fn run(store: Arc<MemoryStore>, headers: Vec<(String, String)>) -> AuthOutcome {
        let strategy = ApiKeyStrategy::new(store);
        let req = IncomingRequest::new("GET", "/", &headers, IpAddr::V4(Ipv4Addr::LOCALHOST));
        strategy.authenticate(&req, &EffectivePolicy::none(), &ctx()).await
    }

    #[test]
    fn test_extract_sources() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let h = vec![("X-Api-Key".to_string(), "k1".to_string())];
        assert_eq!(extract_api_key(&IncomingRequest::new("GET", "/", &h, ip)), Some("k1"));

        let h = vec![("X-Gatehouse-Key".to_string(), "k2".to_string())];
        assert_eq!(extract_api_key(&IncomingRequest::new("GET", "/", &h, ip)), Some("k2"));

        let h = vec![("Authorization".to_string(), "Bearer ghk_k3".to_string())];
        assert_eq!(extract_api_key(&IncomingRequest::new("GET", "/", &h, ip)), Some("ghk_k3"));

        // Bearer without the reserved prefix belongs to someone else
        let h = vec![("Authorization".to_string(), "Bearer eyJhbGci".to_string())];
        assert_eq!(extract_api_key(&IncomingRequest::new("GET", "/", &h, ip)), None);
    }

    #[tokio::test]
    async fn test_valid_org_key_touches_last_used() {
        let store = Arc::new(MemoryStore::new());
        let key = generate_api_key();
        store.insert_api_key(stored_key(&key.hash, Some("org-1"), None));

        let outcome = run(
            store.clone(),
            vec![("x-api-key".into(), key.plaintext.clone())],
        )
        .await;
        assert!(outcome.is_authenticated());

        let stored = store.find_api_key_by_hash(&key.hash).await.unwrap().unwrap();
        assert!(stored.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_scope_and_expiry_failures() {
        let store = Arc::new(MemoryStore::new());

        let other_org = generate_api_key();
        store.insert_api_key(stored_key(&other_org.hash, Some("org-2"), None));
        let other_app = generate_api_key();
        store.insert_api_key(stored_key(&other_app.hash, Some("org-1"), Some("app-9")));
        let expired = generate_api_key();
        let mut record = stored_key(&expired.hash, Some("org-1"), None);
        record.expires_at = Some(Utc::now() - Duration::minutes(1));
        store.insert_api_key(record);

        for key in [&other_org, &other_app, &expired] {
            let outcome = run(
                store.clone(),
                vec![("Authorization".into(), format!("Bearer {}", key.plaintext))],
            )
            .await;
            assert!(outcome.counts_as_failure(), "{:?}", outcome);
        }

        let unknown = run(store, vec![("x-api-key".into(), "ghk_nope".into())]).await;
        assert!(unknown.counts_as_failure());
    }

    #[tokio::test]
    async fn test_account_key_uses_account_org() {
        let store = Arc::new(MemoryStore::new());
        store.insert_account(Account {
            id: "acct-1".into(),
            email: "dev@example.com".into(),
            org_id: Some("org-1".into()),
            ip_whitelist: vec![],
            is_active: true,
            created_at: Utc::now(),
        });
        let key = generate_api_key();
        let mut record = stored_key(&key.hash, None, None);
        record.account_id = Some("acct-1".into());
        store.insert_api_key(record);

        let outcome = run(store, vec![("x-api-key".into(), key.plaintext)]).await;
        assert!(outcome.is_authenticated());
    }

    #[tokio::test]
    async fn test_missing_key_is_challenge() {
        let outcome = run(Arc::new(MemoryStore::new()), vec![]).await;
        assert_eq!(outcome, AuthOutcome::Challenge("ApiKey".to_string()));
        assert!(!outcome.counts_as_failure());
    }
}
