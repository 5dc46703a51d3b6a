//! In-process store used when no database is configured, and by tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::models::*;
use crate::store::{Store, StoreError};

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    organizations: HashMap<String, Organization>,
    applications: HashMap<String, Application>,
    policies: HashMap<PolicyOwner, AuthPolicy>,
    api_keys: HashMap<String, ApiKey>,
    sessions: HashMap<String, Session>,
    plans: HashMap<String, Plan>,
    usage: HashMap<(String, Granularity, DateTime<Utc>), UsageSnapshot>,
    tunnels: HashMap<String, TunnelRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, account: Account) {
        self.tables
            .write()
            .accounts
            .insert(account.id.clone(), account);
    }

    pub fn insert_organization(&self, org: Organization) {
        self.tables
            .write()
            .organizations
            .insert(org.id.clone(), org);
    }

    pub fn insert_application(&self, app: Application) {
        self.tables.write().applications.insert(app.id.clone(), app);
    }

    pub fn insert_policy(&self, policy: AuthPolicy) {
        self.tables
            .write()
            .policies
            .insert(policy.owner.clone(), policy);
    }

    pub fn insert_api_key(&self, key: ApiKey) {
        self.tables.write().api_keys.insert(key.id.clone(), key);
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.tables.write().plans.insert(plan.id.clone(), plan);
    }

    pub fn tunnel_record(&self, id: &str) -> Option<TunnelRecord> {
        self.tables.read().tunnels.get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.tables.read().sessions.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.tables.read().accounts.get(id).cloned())
    }

    async fn get_organization(&self, id: &str) -> Result<Option<Organization>, StoreError> {
        Ok(self.tables.read().organizations.get(id).cloned())
    }

    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError> {
        Ok(self.tables.read().applications.get(id).cloned())
    }

    async fn find_application_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<Application>, StoreError> {
        Ok(self
            .tables
            .read()
            .applications
            .values()
            .find(|a| a.subdomain == subdomain)
            .cloned())
    }

    async fn update_application(&self, app: &Application) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        match tables.applications.get_mut(&app.id) {
            Some(existing) => {
                *existing = app.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("application {}", app.id))),
        }
    }

    async fn get_policy(&self, owner: &PolicyOwner) -> Result<Option<AuthPolicy>, StoreError> {
        Ok(self.tables.read().policies.get(owner).cloned())
    }

    async fn upsert_policy(&self, policy: &AuthPolicy) -> Result<(), StoreError> {
        self.insert_policy(policy.clone());
        Ok(())
    }

    async fn delete_policy(&self, owner: &PolicyOwner) -> Result<(), StoreError> {
        self.tables.write().policies.remove(owner);
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self
            .tables
            .read()
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn touch_api_key(&self, id: &str, used_at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(key) = self.tables.write().api_keys.get_mut(id) {
            key.last_used_at = Some(used_at);
        }
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.tables
            .write()
            .sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.tables.read().sessions.get(token_hash).cloned())
    }

    async fn delete_session(&self, token_hash: &str) -> Result<(), StoreError> {
        self.tables.write().sessions.remove(token_hash);
        Ok(())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        Ok(self.tables.read().plans.values().cloned().collect())
    }

    async fn add_usage(
        &self,
        org_id: &str,
        granularity: Granularity,
        period_start: DateTime<Utc>,
        delta: &UsageCounters,
        peak_concurrent: i64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let entry = tables
            .usage
            .entry((org_id.to_string(), granularity, period_start))
            .or_insert_with(|| UsageSnapshot {
                org_id: org_id.to_string(),
                granularity,
                period_start,
                counters: UsageCounters::default(),
                peak_concurrent: 0,
            });
        entry.counters.add(delta);
        entry.peak_concurrent = entry.peak_concurrent.max(peak_concurrent);
        Ok(())
    }

    async fn put_usage_snapshot(&self, snapshot: &UsageSnapshot) -> Result<(), StoreError> {
        self.tables.write().usage.insert(
            (
                snapshot.org_id.clone(),
                snapshot.granularity,
                snapshot.period_start,
            ),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn list_usage_snapshots(
        &self,
        org_id: Option<&str>,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageSnapshot>, StoreError> {
        let mut snapshots: Vec<UsageSnapshot> = self
            .tables
            .read()
            .usage
            .values()
            .filter(|s| s.granularity == granularity)
            .filter(|s| org_id.map_or(true, |org| s.org_id == org))
            .filter(|s| s.period_start >= from && s.period_start < to)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| {
            a.org_id
                .cmp(&b.org_id)
                .then(a.period_start.cmp(&b.period_start))
        });
        Ok(snapshots)
    }

    async fn delete_usage_snapshots_before(
        &self,
        granularity: Granularity,
        before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        let initial = tables.usage.len();
        tables
            .usage
            .retain(|(_, g, start), _| !(*g == granularity && *start < before));
        Ok((initial - tables.usage.len()) as u64)
    }

    async fn create_tunnel_record(&self, record: &TunnelRecord) -> Result<(), StoreError> {
        self.tables
            .write()
            .tunnels
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn close_tunnel_record(
        &self,
        id: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.tables.write().tunnels.get_mut(id) {
            Some(record) => {
                record.closed_at = Some(closed_at);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("tunnel {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_add_usage_accumulates() {
        let store = MemoryStore::new();
        let delta = UsageCounters {
            bandwidth_bytes: 100,
            tunnel_seconds: 0,
            requests: 2,
        };

        store
            .add_usage("org-1", Granularity::Hourly, hour(1), &delta, 3)
            .await
            .unwrap();
        store
            .add_usage("org-1", Granularity::Hourly, hour(1), &delta, 1)
            .await
            .unwrap();

        let snaps = store
            .list_usage_snapshots(Some("org-1"), Granularity::Hourly, hour(0), hour(2))
            .await
            .unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].counters.bandwidth_bytes, 200);
        assert_eq!(snaps[0].counters.requests, 4);
        assert_eq!(snaps[0].peak_concurrent, 3);
    }

    #[tokio::test]
    async fn test_delete_snapshots_before() {
        let store = MemoryStore::new();
        let delta = UsageCounters::default();
        for h in 0..4 {
            store
                .add_usage("org-1", Granularity::Hourly, hour(h), &delta, 0)
                .await
                .unwrap();
        }
        store
            .add_usage("org-1", Granularity::Daily, hour(0), &delta, 0)
            .await
            .unwrap();

        let removed = store
            .delete_usage_snapshots_before(Granularity::Hourly, hour(2))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let daily = store
            .list_usage_snapshots(None, Granularity::Daily, hour(0), hour(0) + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(daily.len(), 1);
    }

    #[tokio::test]
    async fn test_close_missing_tunnel_record() {
        let store = MemoryStore::new();
        let result = store.close_tunnel_record("nope", Utc::now()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
