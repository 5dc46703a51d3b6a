//! Read-mostly plan cache

use gatehouse_store::{Plan, Store, StoreError};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Plans by id, plus which plan each org is on.
///
/// Both maps are replaced wholesale by [`PlanCache::refresh`]; org entries
/// are filled lazily between refreshes. A plan id that an org points at but
/// storage does not have triggers one refresh, then stays a miss until the
/// next scheduled refresh.
pub struct PlanCache {
    store: Arc<dyn Store>,
    plans: RwLock<HashMap<String, Plan>>,
    org_plans: RwLock<HashMap<String, Option<String>>>,
    missing: RwLock<HashSet<String>>,
}

impl PlanCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            plans: RwLock::new(HashMap::new()),
            org_plans: RwLock::new(HashMap::new()),
            missing: RwLock::new(HashSet::new()),
        }
    }

    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let plans = self.store.list_plans().await?;
        let count = plans.len();
        *self.plans.write() = plans.into_iter().map(|p| (p.id.clone(), p)).collect();
        self.org_plans.write().clear();
        self.missing.write().clear();
        debug!(count, "Plan cache refreshed");
        Ok(count)
    }

    pub fn get(&self, plan_id: &str) -> Option<Plan> {
        self.plans.read().get(plan_id).cloned()
    }

    /// The org's plan; `None` means the org is not metered against a plan.
    pub async fn plan_for_org(&self, org_id: &str) -> Result<Option<Plan>, StoreError> {
        let cached = self.org_plans.read().get(org_id).cloned();
        let plan_id = match cached {
            Some(plan_id) => plan_id,
            None => {
                let plan_id = self
                    .store
                    .get_organization(org_id)
                    .await?
                    .and_then(|org| org.plan_id);
                self.org_plans
                    .write()
                    .insert(org_id.to_string(), plan_id.clone());
                plan_id
            }
        };

        let Some(plan_id) = plan_id else {
            return Ok(None);
        };
        if let Some(plan) = self.get(&plan_id) {
            return Ok(Some(plan));
        }

        if self.missing.read().contains(&plan_id) {
            return Ok(None);
        }

        // Plan created since the last refresh
        self.refresh().await?;
        let plan = self.get(&plan_id);
        if plan.is_none() {
            warn!(org_id = %org_id, plan_id = %plan_id, "Organization references an unknown plan");
            self.missing.write().insert(plan_id);
        }
        Ok(plan)
    }

    /// Drop the cached plan assignment for an org (plan change)
    pub fn invalidate_org(&self, org_id: &str) {
        self.org_plans.write().remove(org_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gatehouse_store::{MemoryStore, Organization, PlanLimits};

    fn plan(id: &str) -> Plan {
        Plan {
            id: id.to_string(),
            name: id.to_string(),
            limits: PlanLimits::unlimited(),
            overage_percent: 0,
            grace_period_hours: 0,
        }
    }

    #[tokio::test]
    async fn test_plan_for_org() {
        let store = Arc::new(MemoryStore::new());
        store.insert_plan(plan("pro"));
        store.insert_organization(Organization {
            id: "org-1".into(),
            name: "Acme".into(),
            plan_id: Some("pro".into()),
            ip_whitelist: vec![],
            created_at: Utc::now(),
        });
        store.insert_organization(Organization {
            id: "org-2".into(),
            name: "Free".into(),
            plan_id: None,
            ip_whitelist: vec![],
            created_at: Utc::now(),
        });

        let cache = PlanCache::new(store.clone());
        assert_eq!(cache.refresh().await.unwrap(), 1);

        let p = cache.plan_for_org("org-1").await.unwrap().unwrap();
        assert_eq!(p.id, "pro");
        assert!(cache.plan_for_org("org-2").await.unwrap().is_none());
        assert!(cache.plan_for_org("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_plan_picked_up_without_refresh() {
        let store = Arc::new(MemoryStore::new());
        let cache = PlanCache::new(store.clone());
        cache.refresh().await.unwrap();

        store.insert_plan(plan("team"));
        store.insert_organization(Organization {
            id: "org".into(),
            name: "Org".into(),
            plan_id: Some("team".into()),
            ip_whitelist: vec![],
            created_at: Utc::now(),
        });

        assert_eq!(
            cache.plan_for_org("org").await.unwrap().map(|p| p.id),
            Some("team".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_plan_refreshes_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert_organization(Organization {
            id: "org".into(),
            name: "Org".into(),
            plan_id: Some("ghost".into()),
            ip_whitelist: vec![],
            created_at: Utc::now(),
        });
        let cache = PlanCache::new(store.clone());

        assert!(cache.plan_for_org("org").await.unwrap().is_none());

        // Still a miss: no refresh happens on the request path
        store.insert_plan(plan("ghost"));
        assert!(cache.plan_for_org("org").await.unwrap().is_none());
        assert!(cache.get("ghost").is_none());

        // The scheduled refresh clears the miss
        cache.refresh().await.unwrap();
        assert_eq!(
            cache.plan_for_org("org").await.unwrap().map(|p| p.id),
            Some("ghost".to_string())
        );
    }
}
