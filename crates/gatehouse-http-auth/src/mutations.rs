//! Policy and application writes that keep the caches honest
//!
//! Every write goes to storage first and then invalidates whatever cached
//! view depended on it, inside the same call.

use chrono::Utc;
use gatehouse_store::{
    Application, AuthMode, AuthPolicy, PolicyOwner, RateLimitSettings, Store,
};
use std::sync::Arc;
use tracing::info;

use crate::{PolicyError, PolicyResolver, RateLimitResolver};

pub struct PolicyMutations {
    store: Arc<dyn Store>,
    resolver: Arc<PolicyResolver>,
    rate_limits: Arc<RateLimitResolver>,
}

impl PolicyMutations {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<PolicyResolver>,
        rate_limits: Arc<RateLimitResolver>,
    ) -> Self {
        Self {
            store,
            resolver,
            rate_limits,
        }
    }

    async fn application(&self, app_id: &str) -> Result<Application, PolicyError> {
        self.store
            .get_application(app_id)
            .await?
            .ok_or_else(|| PolicyError::ApplicationNotFound(app_id.to_string()))
    }

    pub async fn set_app_auth_mode(&self, app_id: &str, mode: AuthMode) -> Result<(), PolicyError> {
        let mut app = self.application(app_id).await?;
        app.auth_mode = mode;
        self.store.update_application(&app).await?;
        self.resolver.invalidate_app(app_id);
        info!(app_id = %app_id, mode = mode.as_str(), "Application auth mode changed");
        Ok(())
    }

    pub async fn upsert_app_policy(&self, mut policy: AuthPolicy) -> Result<(), PolicyError> {
        let PolicyOwner::App(app_id) = policy.owner.clone() else {
            return Err(PolicyError::OwnerMismatch("expected an application policy".to_string()));
        };
        policy.updated_at = Utc::now();
        self.store.upsert_policy(&policy).await?;
        self.resolver.invalidate_app(&app_id);
        info!(app_id = %app_id, policy = policy.policy_type.as_str(), "Application policy updated");
        Ok(())
    }

    pub async fn upsert_org_policy(&self, mut policy: AuthPolicy) -> Result<(), PolicyError> {
        let PolicyOwner::Org(org_id) = policy.owner.clone() else {
            return Err(PolicyError::OwnerMismatch("expected an organization policy".to_string()));
        };
        policy.updated_at = Utc::now();
        self.store.upsert_policy(&policy).await?;
        self.resolver.invalidate_org(&org_id);
        info!(org_id = %org_id, policy = policy.policy_type.as_str(), "Organization policy updated");
        Ok(())
    }

    pub async fn delete_policy(&self, owner: &PolicyOwner) -> Result<(), PolicyError> {
        self.store.delete_policy(owner).await?;
        match owner {
            PolicyOwner::App(app_id) => self.resolver.invalidate_app(app_id),
            PolicyOwner::Org(org_id) => self.resolver.invalidate_org(org_id),
        }
        Ok(())
    }

    /// Move an application to a new subdomain. Both names lose their
    /// cached policy.
    pub async fn rename_app(&self, app_id: &str, new_subdomain: &str) -> Result<(), PolicyError> {
        gatehouse_proto::validate_subdomain(new_subdomain)
            .map_err(|e| PolicyError::InvalidSubdomain(e.to_string()))?;

        let mut app = self.application(app_id).await?;
        let old_subdomain = std::mem::replace(&mut app.subdomain, new_subdomain.to_string());
        self.store.update_application(&app).await?;

        self.resolver.invalidate_app(app_id);
        self.resolver.invalidate_subdomain(&old_subdomain);
        self.resolver.invalidate_subdomain(new_subdomain);
        info!(app_id = %app_id, from = %old_subdomain, to = %new_subdomain, "Application renamed");
        Ok(())
    }

    pub async fn set_app_rate_limit(
        &self,
        app_id: &str,
        settings: Option<RateLimitSettings>,
    ) -> Result<(), PolicyError> {
        let mut app = self.application(app_id).await?;
        app.rate_limit = settings;
        self.store.update_application(&app).await?;
        self.rate_limits.invalidate_app(app_id);
        self.resolver.invalidate_app(app_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_store::{MemoryStore, PolicyType};

    fn setup() -> (Arc<MemoryStore>, Arc<PolicyResolver>, PolicyMutations) {
        let store = Arc::new(MemoryStore::new());
        store.insert_application(Application {
            id: "app-1".into(),
            org_id: "org-1".into(),
            name: "Demo".into(),
            subdomain: "demo".into(),
            auth_mode: AuthMode::Inherit,
            rate_limit: None,
            created_at: Utc::now(),
        });
        let resolver = Arc::new(PolicyResolver::new(store.clone()));
        let limits = Arc::new(RateLimitResolver::new(store.clone(), None));
        let mutations = PolicyMutations::new(store.clone(), resolver.clone(), limits);
        (store, resolver, mutations)
    }

    #[tokio::test]
    async fn test_mutations_take_effect_immediately() {
        let (_, resolver, mutations) = setup();
        assert!(!resolver.resolve("demo").await.unwrap().1.requires_auth());

        mutations
            .upsert_org_policy(AuthPolicy::new(PolicyOwner::Org("org-1".into()), PolicyType::Oidc))
            .await
            .unwrap();
        assert_eq!(resolver.resolve("demo").await.unwrap().1.policy_type, PolicyType::Oidc);

        mutations
            .upsert_app_policy(AuthPolicy::new(PolicyOwner::App("app-1".into()), PolicyType::Basic))
            .await
            .unwrap();
        // Still inheriting
        assert_eq!(resolver.resolve("demo").await.unwrap().1.policy_type, PolicyType::Oidc);

        mutations.set_app_auth_mode("app-1", AuthMode::Custom).await.unwrap();
        assert_eq!(resolver.resolve("demo").await.unwrap().1.policy_type, PolicyType::Basic);

        mutations
            .delete_policy(&PolicyOwner::App("app-1".into()))
            .await
            .unwrap();
        assert!(matches!(
            resolver.resolve("demo").await.unwrap().1.policy_type,
            PolicyType::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn test_rename_moves_policy() {
        let (_, resolver, mutations) = setup();
        mutations
            .upsert_org_policy(AuthPolicy::new(PolicyOwner::Org("org-1".into()), PolicyType::Basic))
            .await
            .unwrap();
        resolver.resolve("demo").await.unwrap();
        resolver.resolve("renamed").await.unwrap();

        mutations.rename_app("app-1", "renamed").await.unwrap();

        let (old_ctx, old) = resolver.resolve("demo").await.unwrap();
        assert!(!old_ctx.is_persistent_app);
        assert!(!old.requires_auth());
        let (_, new) = resolver.resolve("renamed").await.unwrap();
        assert_eq!(new.policy_type, PolicyType::Basic);

        assert!(matches!(
            mutations.rename_app("app-1", "Bad_Name").await,
            Err(PolicyError::InvalidSubdomain(_))
        ));
    }

    #[tokio::test]
    async fn test_owner_mismatch_and_missing_app() {
        let (_, _, mutations) = setup();
        assert!(matches!(
            mutations
                .upsert_app_policy(AuthPolicy::new(PolicyOwner::Org("org-1".into()), PolicyType::Basic))
                .await,
            Err(PolicyError::OwnerMismatch(_))
        ));
        assert!(matches!(
            mutations.set_app_auth_mode("missing", AuthMode::Custom).await,
            Err(PolicyError::ApplicationNotFound(_))
        ));
    }
}
