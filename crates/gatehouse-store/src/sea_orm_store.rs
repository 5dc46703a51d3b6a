//! `Store` backed by a relational database through sea-orm

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tracing::debug;

use crate::entities::{
    account, api_key, application, auth_policy, organization, plan, session, tunnel_record,
    usage_snapshot,
};
use crate::models::*;
use crate::store::{Store, StoreError};

pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("{}: {}", column, e)))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn owner_key(owner: &PolicyOwner) -> (&'static str, &str) {
    match owner {
        PolicyOwner::App(id) => ("app", id.as_str()),
        PolicyOwner::Org(id) => ("org", id.as_str()),
    }
}

impl TryFrom<account::Model> for Account {
    type Error = StoreError;

    fn try_from(m: account::Model) -> Result<Self, Self::Error> {
        Ok(Account {
            ip_whitelist: decode_json("account.ip_whitelist", &m.ip_whitelist)?,
            id: m.id,
            email: m.email,
            org_id: m.org_id,
            is_active: m.is_active,
            created_at: m.created_at,
        })
    }
}

impl TryFrom<organization::Model> for Organization {
    type Error = StoreError;

    fn try_from(m: organization::Model) -> Result<Self, Self::Error> {
        Ok(Organization {
            ip_whitelist: decode_json("organization.ip_whitelist", &m.ip_whitelist)?,
            id: m.id,
            name: m.name,
            plan_id: m.plan_id,
            created_at: m.created_at,
        })
    }
}

impl From<application::Model> for Application {
    fn from(m: application::Model) -> Self {
        let rate_limit = m.rate_limit_enabled.map(|enabled| RateLimitSettings {
            enabled,
            max_failures: m.rate_limit_max_failures.unwrap_or(0).max(0) as u32,
            window_secs: m.rate_limit_window_secs.unwrap_or(0).max(0) as u64,
        });

        Application {
            auth_mode: AuthMode::parse(&m.auth_mode),
            id: m.id,
            org_id: m.org_id,
            name: m.name,
            subdomain: m.subdomain,
            rate_limit,
            created_at: m.created_at,
        }
    }
}

impl TryFrom<auth_policy::Model> for AuthPolicy {
    type Error = StoreError;

    fn try_from(m: auth_policy::Model) -> Result<Self, Self::Error> {
        let owner = match m.owner_kind.as_str() {
            "app" => PolicyOwner::App(m.owner_id),
            "org" => PolicyOwner::Org(m.owner_id),
            other => {
                return Err(StoreError::Corrupt(format!(
                    "auth_policy.owner_kind: {}",
                    other
                )))
            }
        };
        let oidc = m
            .oidc
            .as_deref()
            .map(|raw| decode_json("auth_policy.oidc", raw))
            .transpose()?;

        Ok(AuthPolicy {
            owner,
            policy_type: PolicyType::parse(&m.policy_type),
            allow_api_key: m.allow_api_key,
            basic_users: decode_json("auth_policy.basic_users", &m.basic_users)?,
            oidc,
            session_ttl_secs: m.session_ttl_secs.max(0) as u64,
            updated_at: m.updated_at,
        })
    }
}

impl From<api_key::Model> for ApiKey {
    fn from(m: api_key::Model) -> Self {
        ApiKey {
            id: m.id,
            name: m.name,
            account_id: m.account_id,
            org_id: m.org_id,
            app_id: m.app_id,
            display_prefix: m.display_prefix,
            key_hash: m.key_hash,
            is_active: m.is_active,
            expires_at: m.expires_at,
            last_used_at: m.last_used_at,
            created_at: m.created_at,
        }
    }
}

impl From<session::Model> for Session {
    fn from(m: session::Model) -> Self {
        Session {
            token_hash: m.token_hash,
            subdomain: m.subdomain,
            identity: m.identity,
            method: m.method,
            expires_at: m.expires_at,
            created_at: m.created_at,
        }
    }
}

impl From<plan::Model> for Plan {
    fn from(m: plan::Model) -> Self {
        Plan {
            id: m.id,
            name: m.name,
            limits: PlanLimits {
                bandwidth_bytes: m.bandwidth_bytes,
                tunnel_hours: m.tunnel_hours,
                concurrent_tunnels: m.concurrent_tunnels,
                requests: m.requests,
            },
            overage_percent: m.overage_percent.max(0) as u32,
            grace_period_hours: m.grace_period_hours.max(0) as u32,
        }
    }
}

impl TryFrom<usage_snapshot::Model> for UsageSnapshot {
    type Error = StoreError;

    fn try_from(m: usage_snapshot::Model) -> Result<Self, Self::Error> {
        let granularity = Granularity::parse(&m.granularity).ok_or_else(|| {
            StoreError::Corrupt(format!("usage_snapshot.granularity: {}", m.granularity))
        })?;

        Ok(UsageSnapshot {
            org_id: m.org_id,
            granularity,
            period_start: m.period_start,
            counters: UsageCounters {
                bandwidth_bytes: m.bandwidth_bytes,
                tunnel_seconds: m.tunnel_seconds,
                requests: m.requests,
            },
            peak_concurrent: m.peak_concurrent,
        })
    }
}

#[async_trait]
impl Store for SeaOrmStore {
    async fn get_account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        account::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .map(Account::try_from)
            .transpose()
    }

    async fn get_organization(&self, id: &str) -> Result<Option<Organization>, StoreError> {
        organization::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .map(Organization::try_from)
            .transpose()
    }

    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError> {
        Ok(application::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .map(Application::from))
    }

    async fn find_application_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<Application>, StoreError> {
        Ok(application::Entity::find()
            .filter(application::Column::Subdomain.eq(subdomain))
            .one(&self.db)
            .await?
            .map(Application::from))
    }

    async fn update_application(&self, app: &Application) -> Result<(), StoreError> {
        let existing = application::Entity::find_by_id(app.id.clone())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("application {}", app.id)))?;

        let mut active: application::ActiveModel = existing.into();
        active.org_id = Set(app.org_id.clone());
        active.name = Set(app.name.clone());
        active.subdomain = Set(app.subdomain.clone());
        active.auth_mode = Set(app.auth_mode.as_str().to_string());
        active.rate_limit_enabled = Set(app.rate_limit.as_ref().map(|r| r.enabled));
        active.rate_limit_max_failures = Set(app.rate_limit.as_ref().map(|r| r.max_failures as i32));
        active.rate_limit_window_secs = Set(app.rate_limit.as_ref().map(|r| r.window_secs as i64));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn get_policy(&self, owner: &PolicyOwner) -> Result<Option<AuthPolicy>, StoreError> {
        let (kind, id) = owner_key(owner);
        auth_policy::Entity::find_by_id((kind.to_string(), id.to_string()))
            .one(&self.db)
            .await?
            .map(AuthPolicy::try_from)
            .transpose()
    }

    async fn upsert_policy(&self, policy: &AuthPolicy) -> Result<(), StoreError> {
        let (kind, id) = owner_key(&policy.owner);
        let oidc = policy.oidc.as_ref().map(encode_json).transpose()?;

        let model = auth_policy::ActiveModel {
            owner_kind: Set(kind.to_string()),
            owner_id: Set(id.to_string()),
            policy_type: Set(policy.policy_type.as_str().to_string()),
            allow_api_key: Set(policy.allow_api_key),
            basic_users: Set(encode_json(&policy.basic_users)?),
            oidc: Set(oidc),
            session_ttl_secs: Set(policy.session_ttl_secs as i64),
            updated_at: Set(policy.updated_at),
        };

        auth_policy::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    auth_policy::Column::OwnerKind,
                    auth_policy::Column::OwnerId,
                ])
                .update_columns([
                    auth_policy::Column::PolicyType,
                    auth_policy::Column::AllowApiKey,
                    auth_policy::Column::BasicUsers,
                    auth_policy::Column::Oidc,
                    auth_policy::Column::SessionTtlSecs,
                    auth_policy::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_policy(&self, owner: &PolicyOwner) -> Result<(), StoreError> {
        let (kind, id) = owner_key(owner);
        auth_policy::Entity::delete_by_id((kind.to_string(), id.to_string()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(api_key::Entity::find()
            .filter(api_key::Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?
            .map(ApiKey::from))
    }

    async fn touch_api_key(&self, id: &str, used_at: DateTime<Utc>) -> Result<(), StoreError> {
        api_key::Entity::update_many()
            .col_expr(
                api_key::Column::LastUsedAt,
                sea_orm::sea_query::Expr::value(Some(used_at)),
            )
            .filter(api_key::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn create_session(&self, s: &Session) -> Result<(), StoreError> {
        session::ActiveModel {
            token_hash: Set(s.token_hash.clone()),
            subdomain: Set(s.subdomain.clone()),
            identity: Set(s.identity.clone()),
            method: Set(s.method.clone()),
            expires_at: Set(s.expires_at),
            created_at: Set(s.created_at),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn get_session(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        Ok(session::Entity::find_by_id(token_hash.to_string())
            .one(&self.db)
            .await?
            .map(Session::from))
    }

    async fn delete_session(&self, token_hash: &str) -> Result<(), StoreError> {
        session::Entity::delete_by_id(token_hash.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        Ok(plan::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(Plan::from)
            .collect())
    }

    async fn add_usage(
        &self,
        org_id: &str,
        granularity: Granularity,
        period_start: DateTime<Utc>,
        delta: &UsageCounters,
        peak_concurrent: i64,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;

        let existing = usage_snapshot::Entity::find_by_id((
            org_id.to_string(),
            granularity.as_str().to_string(),
            period_start,
        ))
        .one(&txn)
        .await?;

        match existing {
            Some(row) => {
                let bandwidth = row.bandwidth_bytes + delta.bandwidth_bytes;
                let seconds = row.tunnel_seconds + delta.tunnel_seconds;
                let requests = row.requests + delta.requests;
                let peak = row.peak_concurrent.max(peak_concurrent);

                let mut active: usage_snapshot::ActiveModel = row.into();
                active.bandwidth_bytes = Set(bandwidth);
                active.tunnel_seconds = Set(seconds);
                active.requests = Set(requests);
                active.peak_concurrent = Set(peak);
                active.update(&txn).await?;
            }
            None => {
                usage_snapshot::ActiveModel {
                    org_id: Set(org_id.to_string()),
                    granularity: Set(granularity.as_str().to_string()),
                    period_start: Set(period_start),
                    bandwidth_bytes: Set(delta.bandwidth_bytes),
                    tunnel_seconds: Set(delta.tunnel_seconds),
                    requests: Set(delta.requests),
                    peak_concurrent: Set(peak_concurrent),
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        debug!(org_id = %org_id, granularity = granularity.as_str(), "Usage snapshot updated");
        Ok(())
    }

    async fn put_usage_snapshot(&self, snapshot: &UsageSnapshot) -> Result<(), StoreError> {
        let model = usage_snapshot::ActiveModel {
            org_id: Set(snapshot.org_id.clone()),
            granularity: Set(snapshot.granularity.as_str().to_string()),
            period_start: Set(snapshot.period_start),
            bandwidth_bytes: Set(snapshot.counters.bandwidth_bytes),
            tunnel_seconds: Set(snapshot.counters.tunnel_seconds),
            requests: Set(snapshot.counters.requests),
            peak_concurrent: Set(snapshot.peak_concurrent),
        };

        usage_snapshot::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    usage_snapshot::Column::OrgId,
                    usage_snapshot::Column::Granularity,
                    usage_snapshot::Column::PeriodStart,
                ])
                .update_columns([
                    usage_snapshot::Column::BandwidthBytes,
                    usage_snapshot::Column::TunnelSeconds,
                    usage_snapshot::Column::Requests,
                    usage_snapshot::Column::PeakConcurrent,
                ])
                .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_usage_snapshots(
        &self,
        org_id: Option<&str>,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageSnapshot>, StoreError> {
        let mut query = usage_snapshot::Entity::find()
            .filter(usage_snapshot::Column::Granularity.eq(granularity.as_str()))
            .filter(usage_snapshot::Column::PeriodStart.gte(from))
            .filter(usage_snapshot::Column::PeriodStart.lt(to));
        if let Some(org) = org_id {
            query = query.filter(usage_snapshot::Column::OrgId.eq(org));
        }

        query
            .order_by_asc(usage_snapshot::Column::OrgId)
            .order_by_asc(usage_snapshot::Column::PeriodStart)
            .all(&self.db)
            .await?
            .into_iter()
            .map(UsageSnapshot::try_from)
            .collect()
    }

    async fn delete_usage_snapshots_before(
        &self,
        granularity: Granularity,
        before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = usage_snapshot::Entity::delete_many()
            .filter(usage_snapshot::Column::Granularity.eq(granularity.as_str()))
            .filter(usage_snapshot::Column::PeriodStart.lt(before))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn create_tunnel_record(&self, record: &TunnelRecord) -> Result<(), StoreError> {
        tunnel_record::ActiveModel {
            id: Set(record.id.clone()),
            subdomain: Set(record.subdomain.clone()),
            transport: Set(record.transport.clone()),
            account_id: Set(record.account_id.clone()),
            org_id: Set(record.org_id.clone()),
            app_id: Set(record.app_id.clone()),
            client_addr: Set(record.client_addr.clone()),
            created_at: Set(record.created_at),
            closed_at: Set(record.closed_at),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn close_tunnel_record(
        &self,
        id: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let row = tunnel_record::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("tunnel {}", id)))?;

        let mut active: tunnel_record::ActiveModel = row.into();
        active.closed_at = Set(Some(closed_at));
        active.update(&self.db).await?;
        Ok(())
    }
}
