//! Routes a request to one credential strategy

use gatehouse_store::{PolicyType, Store};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api_key::extract_api_key;
use crate::rate_limit::RateLimiter;
use crate::{
    ApiKeyStrategy, AuthContext, AuthIdentity, AuthOutcome, AuthStrategy, BasicStrategy,
    DenyReason, EffectivePolicy, IncomingRequest, OidcStrategy, RateLimitResolver,
    SessionManager,
};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deny requests whose policy type cannot be evaluated
    pub strict: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { strict: true }
    }
}

pub struct AuthDispatcher {
    basic: BasicStrategy,
    api_key: ApiKeyStrategy,
    oidc: OidcStrategy,
    sessions: Arc<SessionManager>,
    rate_limits: Arc<RateLimitResolver>,
    config: DispatcherConfig,
}

impl AuthDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        rate_limits: Arc<RateLimitResolver>,
        config: DispatcherConfig,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(store.clone()));
        Self {
            basic: BasicStrategy::new(sessions.clone()),
            api_key: ApiKeyStrategy::new(store),
            oidc: OidcStrategy::new(sessions.clone()),
            sessions,
            rate_limits,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitResolver> {
        &self.rate_limits
    }

    pub fn is_strict(&self) -> bool {
        self.config.strict
    }

    /// Rate-limit, dispatch, and count the outcome.
    pub async fn authenticate(
        &self,
        request: &IncomingRequest<'_>,
        policy: &EffectivePolicy,
        ctx: &AuthContext,
    ) -> AuthOutcome {
        if policy.policy_type == PolicyType::None {
            return AuthOutcome::Authenticated(AuthIdentity::anonymous());
        }

        let (limiter, key) = match self.admit(request, ctx).await {
            Ok(admitted) => admitted,
            Err(denied) => return denied,
        };
        let outcome = self.dispatch(request, policy, ctx).await;
        self.account(limiter.as_deref(), &key, &outcome, ctx);
        outcome
    }

    /// Username/password from the login form, with the same accounting as
    /// the `Authorization` header path.
    pub async fn login_basic(
        &self,
        request: &IncomingRequest<'_>,
        policy: &EffectivePolicy,
        ctx: &AuthContext,
        username: &str,
        password: &str,
    ) -> AuthOutcome {
        if policy.policy_type != PolicyType::Basic {
            return AuthOutcome::Denied(DenyReason::Misconfigured(
                "basic login is not enabled for this subdomain".to_string(),
            ));
        }

        let (limiter, key) = match self.admit(request, ctx).await {
            Ok(admitted) => admitted,
            Err(denied) => return denied,
        };
        let outcome = self.basic.login(policy, ctx, username, password).await;
        self.account(limiter.as_deref(), &key, &outcome, ctx);
        outcome
    }

    async fn admit(
        &self,
        request: &IncomingRequest<'_>,
        ctx: &AuthContext,
    ) -> Result<(Option<Arc<RateLimiter>>, String), AuthOutcome> {
        let limiter = self.rate_limits.limiter_for(ctx).await;
        let key = self.rate_limits.key_for(ctx, request.client_ip);
        if let Some(retry_after) = limiter.as_ref().and_then(|l| l.is_limited(&key)) {
            info!(subdomain = %ctx.subdomain, key = %key, "Rate limited authentication attempt");
            return Err(AuthOutcome::Denied(DenyReason::RateLimited { retry_after }));
        }
        Ok((limiter, key))
    }

    fn account(
        &self,
        limiter: Option<&RateLimiter>,
        key: &str,
        outcome: &AuthOutcome,
        ctx: &AuthContext,
    ) {
        if outcome.counts_as_failure() {
            if let Some(limiter) = limiter {
                limiter.record_failure(key);
            }
            info!(subdomain = %ctx.subdomain, key = %key, "Authentication failed");
        }
    }

    async fn dispatch(
        &self,
        request: &IncomingRequest<'_>,
        policy: &EffectivePolicy,
        ctx: &AuthContext,
    ) -> AuthOutcome {
        let strategy: &dyn AuthStrategy = match &policy.policy_type {
            PolicyType::None => return AuthOutcome::Authenticated(AuthIdentity::anonymous()),
            PolicyType::Unknown(kind) => {
                warn!(subdomain = %ctx.subdomain, policy = %kind, strict = self.config.strict, "Unresolvable auth policy");
                return if self.config.strict {
                    AuthOutcome::Denied(DenyReason::Misconfigured(format!(
                        "unsupported policy type: {}",
                        kind
                    )))
                } else {
                    AuthOutcome::Authenticated(AuthIdentity::anonymous())
                };
            }
            PolicyType::ApiKey => &self.api_key,
            PolicyType::Basic | PolicyType::Oidc
                if policy.allow_api_key && extract_api_key(request).is_some() =>
            {
                // No fallback to the primary method when the key is bad
                debug!(subdomain = %ctx.subdomain, "API key presented as add-on credential");
                &self.api_key
            }
            PolicyType::Basic => &self.basic,
            PolicyType::Oidc => &self.oidc,
        };

        strategy.authenticate(request, policy, ctx).await
    }
}
