//! Effective policy resolution
//!
//! [`resolve`] is the whole rule; [`PolicyResolver`] adds storage lookups and
//! a per-subdomain cache that only explicit invalidation clears.

use dashmap::DashMap;
use gatehouse_store::{
    Application, AuthMode, AuthPolicy, BasicCredential, OidcSettings, PolicyOwner, PolicyType,
    Store,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{AuthContext, PolicyError};

/// Where an effective policy came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    None,
    App(String),
    Org(String),
}

/// The authentication requirement that applies to a subdomain
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub policy_type: PolicyType,
    pub allow_api_key: bool,
    pub basic_users: Vec<BasicCredential>,
    pub oidc: Option<OidcSettings>,
    pub session_ttl: Duration,
    pub source: PolicySource,
}

impl EffectivePolicy {
    pub fn none() -> Self {
        Self {
            policy_type: PolicyType::None,
            allow_api_key: false,
            basic_users: Vec::new(),
            oidc: None,
            session_ttl: Duration::ZERO,
            source: PolicySource::None,
        }
    }

    fn from_stored(policy: &AuthPolicy, source: PolicySource) -> Self {
        Self {
            policy_type: policy.policy_type.clone(),
            allow_api_key: policy.allow_api_key,
            basic_users: policy.basic_users.clone(),
            oidc: policy.oidc.clone(),
            session_ttl: Duration::from_secs(policy.session_ttl_secs),
            source,
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.policy_type != PolicyType::None
    }
}

/// Compute the effective policy from the three inputs that decide it.
///
/// - custom mode: the application's own policy
/// - inherit mode: the organization's policy, or none
/// - disabled mode, or no application: none
///
/// Custom mode without a stored application policy cannot be evaluated and
/// comes back as an unknown type, leaving the decision to the strict switch.
pub fn resolve(
    app: Option<&Application>,
    app_policy: Option<&AuthPolicy>,
    org_policy: Option<&AuthPolicy>,
) -> EffectivePolicy {
    let Some(app) = app else {
        return EffectivePolicy::none();
    };

    match app.auth_mode {
        AuthMode::Custom => match app_policy {
            Some(policy) => EffectivePolicy::from_stored(policy, PolicySource::App(app.id.clone())),
            None => EffectivePolicy {
                policy_type: PolicyType::Unknown("custom-without-policy".to_string()),
                source: PolicySource::App(app.id.clone()),
                ..EffectivePolicy::none()
            },
        },
        AuthMode::Inherit => org_policy
            .map(|policy| EffectivePolicy::from_stored(policy, PolicySource::Org(app.org_id.clone())))
            .unwrap_or_else(EffectivePolicy::none),
        AuthMode::Disabled => EffectivePolicy::none(),
    }
}

#[derive(Clone)]
struct CachedPolicy {
    ctx: AuthContext,
    policy: Arc<EffectivePolicy>,
}

/// Storage-backed resolver with an invalidatable cache.
///
/// Entries never expire on their own. Every invalidation also bumps a
/// generation counter so a lookup that raced with it does not write its
/// stale result back.
pub struct PolicyResolver {
    store: Arc<dyn Store>,
    cache: DashMap<String, CachedPolicy>,
    generation: AtomicU64,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Context and effective policy for a subdomain
    pub async fn resolve(
        &self,
        subdomain: &str,
    ) -> Result<(AuthContext, Arc<EffectivePolicy>), PolicyError> {
        if let Some(hit) = self.cache.get(subdomain) {
            return Ok((hit.ctx.clone(), hit.policy.clone()));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let entry = match self.load(subdomain).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(subdomain = %subdomain, error = %e, "Policy resolution failed");
                return Err(e);
            }
        };

        if self.generation.load(Ordering::SeqCst) == generation {
            self.cache.insert(subdomain.to_string(), entry.clone());
        }
        debug!(
            subdomain = %subdomain,
            policy = entry.policy.policy_type.as_str(),
            "Resolved auth policy"
        );
        Ok((entry.ctx, entry.policy))
    }

    /// Effective policy for an already-built context
    pub async fn resolve_context(
        &self,
        ctx: &AuthContext,
    ) -> Result<Arc<EffectivePolicy>, PolicyError> {
        if ctx.application.is_none() {
            return Ok(Arc::new(EffectivePolicy::none()));
        }
        self.resolve(&ctx.subdomain).await.map(|(_, policy)| policy)
    }

    async fn load(&self, subdomain: &str) -> Result<CachedPolicy, PolicyError> {
        let Some(app) = self.store.find_application_by_subdomain(subdomain).await? else {
            return Ok(CachedPolicy {
                ctx: AuthContext::ephemeral(subdomain),
                policy: Arc::new(EffectivePolicy::none()),
            });
        };

        let app_policy = match app.auth_mode {
            AuthMode::Custom => self.store.get_policy(&PolicyOwner::App(app.id.clone())).await?,
            _ => None,
        };
        let org_policy = match app.auth_mode {
            AuthMode::Inherit => {
                self.store
                    .get_policy(&PolicyOwner::Org(app.org_id.clone()))
                    .await?
            }
            _ => None,
        };

        let policy = resolve(Some(&app), app_policy.as_ref(), org_policy.as_ref());
        Ok(CachedPolicy {
            ctx: AuthContext::for_application(app),
            policy: Arc::new(policy),
        })
    }

    pub fn invalidate_subdomain(&self, subdomain: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.remove(subdomain);
    }

    pub fn invalidate_app(&self, app_id: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache
            .retain(|_, entry| entry.ctx.app_id.as_deref() != Some(app_id));
    }

    pub fn invalidate_org(&self, org_id: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache
            .retain(|_, entry| entry.ctx.org_id.as_deref() != Some(org_id));
    }

    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}
