//! The storage seam consumed by the gateway

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Lookup and mutation of everything the gateway keeps outside memory.
///
/// Calls are awaited inline on the request path; implementations must be
/// safe to share across tasks.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_account(&self, id: &str) -> Result<Option<Account>, StoreError>;

    async fn get_organization(&self, id: &str) -> Result<Option<Organization>, StoreError>;

    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError>;

    async fn find_application_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<Application>, StoreError>;

    async fn update_application(&self, app: &Application) -> Result<(), StoreError>;

    async fn get_policy(&self, owner: &PolicyOwner) -> Result<Option<AuthPolicy>, StoreError>;

    async fn upsert_policy(&self, policy: &AuthPolicy) -> Result<(), StoreError>;

    async fn delete_policy(&self, owner: &PolicyOwner) -> Result<(), StoreError>;

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError>;

    async fn touch_api_key(&self, id: &str, used_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, token_hash: &str) -> Result<Option<Session>, StoreError>;

    async fn delete_session(&self, token_hash: &str) -> Result<(), StoreError>;

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;

    /// Add `delta` to the snapshot for (org, granularity, period_start),
    /// creating it when missing.
    async fn add_usage(
        &self,
        org_id: &str,
        granularity: Granularity,
        period_start: DateTime<Utc>,
        delta: &UsageCounters,
        peak_concurrent: i64,
    ) -> Result<(), StoreError>;

    /// Replace a snapshot outright (rollups are recomputed, not accumulated)
    async fn put_usage_snapshot(&self, snapshot: &UsageSnapshot) -> Result<(), StoreError>;

    /// Snapshots with `from <= period_start < to`, optionally for one org
    async fn list_usage_snapshots(
        &self,
        org_id: Option<&str>,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageSnapshot>, StoreError>;

    async fn delete_usage_snapshots_before(
        &self,
        granularity: Granularity,
        before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn create_tunnel_record(&self, record: &TunnelRecord) -> Result<(), StoreError>;

    async fn close_tunnel_record(
        &self,
        id: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
