//! Quota decisions
//!
//! The effective limit for a dimension is `limit * (1 + overage% / 100)`;
//! `-1` means unlimited. Crossing the effective limit starts a grace
//! episode when the plan grants one: the first over-limit check records the
//! time and is allowed, later checks are allowed until the grace window
//! closes, then denied. Concurrent tunnels never get grace.

use chrono::{DateTime, Duration, Utc};
use gatehouse_store::{Plan, Store, StoreError, UNLIMITED};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{OrgUsage, UsageCache};
use crate::period::next_month_start;
use crate::plans::PlanCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageDimension {
    Bandwidth,
    TunnelTime,
    ConcurrentTunnels,
    Requests,
}

impl UsageDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageDimension::Bandwidth => "bandwidth",
            UsageDimension::TunnelTime => "tunnel_time",
            UsageDimension::ConcurrentTunnels => "concurrent_tunnels",
            UsageDimension::Requests => "requests",
        }
    }

    fn grace_applies(&self) -> bool {
        !matches!(self, UsageDimension::ConcurrentTunnels)
    }

    /// Configured limit in the unit usage is tracked in
    fn limit(&self, plan: &Plan) -> i64 {
        match self {
            UsageDimension::Bandwidth => plan.limits.bandwidth_bytes,
            UsageDimension::TunnelTime if plan.limits.tunnel_hours == UNLIMITED => UNLIMITED,
            UsageDimension::TunnelTime => plan.limits.tunnel_hours.saturating_mul(3600),
            UsageDimension::ConcurrentTunnels => plan.limits.concurrent_tunnels,
            UsageDimension::Requests => plan.limits.requests,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaDecision {
    pub dimension: UsageDimension,
    pub allowed: bool,
    /// Effective limit after overage, or -1
    pub limit: i64,
    pub used: i64,
    /// -1 when unlimited
    pub remaining: i64,
    pub reset_time: DateTime<Utc>,
    pub in_grace_period: bool,
    pub limit_hit_at: Option<DateTime<Utc>>,
}

impl QuotaDecision {
    fn unlimited(dimension: UsageDimension, used: i64, now: DateTime<Utc>) -> Self {
        Self {
            dimension,
            allowed: true,
            limit: UNLIMITED,
            used,
            remaining: UNLIMITED,
            reset_time: next_month_start(now),
            in_grace_period: false,
            limit_hit_at: None,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limit != UNLIMITED
    }

    /// `X-Quota-*` response headers; empty when the dimension is unlimited
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if !self.is_limited() {
            return Vec::new();
        }
        vec![
            ("X-Quota-Limit", self.limit.to_string()),
            ("X-Quota-Used", self.used.to_string()),
            ("X-Quota-Remaining", self.remaining.to_string()),
            ("X-Quota-Reset", self.reset_time.timestamp().to_string()),
        ]
    }
}

pub fn effective_limit(limit: i64, overage_percent: u32) -> i64 {
    if limit == UNLIMITED {
        return UNLIMITED;
    }
    limit.saturating_add(limit.saturating_mul(overage_percent as i64) / 100)
}

/// Evaluate one dimension against a plan, updating the org's grace mark.
fn evaluate(
    org: &OrgUsage,
    plan: &Plan,
    dimension: UsageDimension,
    used: i64,
    now: DateTime<Utc>,
) -> QuotaDecision {
    let limit = effective_limit(dimension.limit(plan), plan.overage_percent);
    if limit == UNLIMITED {
        return QuotaDecision::unlimited(dimension, used, now);
    }

    let mut decision = QuotaDecision {
        dimension,
        allowed: true,
        limit,
        used,
        remaining: (limit - used).max(0),
        reset_time: next_month_start(now),
        in_grace_period: false,
        limit_hit_at: None,
    };

    if used < limit {
        return decision;
    }

    if !dimension.grace_applies() || plan.grace_period_hours == 0 {
        decision.allowed = false;
        return decision;
    }

    let mut state = org.state.lock();
    let hit_at = *state.limit_hit_at.entry(dimension).or_insert(now);
    drop(state);

    decision.limit_hit_at = Some(hit_at);
    if now < hit_at + Duration::hours(plan.grace_period_hours as i64) {
        decision.in_grace_period = true;
    } else {
        decision.allowed = false;
    }
    decision
}

pub struct QuotaChecker {
    usage: Arc<UsageCache>,
    plans: Arc<PlanCache>,
}

impl QuotaChecker {
    pub fn new(usage: Arc<UsageCache>, plans: Arc<PlanCache>) -> Self {
        Self { usage, plans }
    }

    pub fn usage(&self) -> &Arc<UsageCache> {
        &self.usage
    }

    pub fn plans(&self) -> &Arc<PlanCache> {
        &self.plans
    }

    pub async fn check_quota(
        &self,
        org_id: &str,
        dimension: UsageDimension,
    ) -> Result<QuotaDecision, StoreError> {
        self.check_quota_at(org_id, dimension, Utc::now()).await
    }

    pub async fn check_quota_at(
        &self,
        org_id: &str,
        dimension: UsageDimension,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        self.decide(org_id, dimension, None, now).await
    }

    /// `concurrent` replaces the live tunnel count when given
    async fn decide(
        &self,
        org_id: &str,
        dimension: UsageDimension,
        concurrent: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        let org = self.usage.ensure_baseline(org_id).await?;
        let current = org.current();
        let used = match dimension {
            UsageDimension::Bandwidth => current.bandwidth_bytes,
            UsageDimension::TunnelTime => current.tunnel_seconds,
            UsageDimension::Requests => current.requests,
            UsageDimension::ConcurrentTunnels => {
                concurrent.unwrap_or_else(|| org.concurrent_tunnels())
            }
        };

        let Some(plan) = self.plans.plan_for_org(org_id).await? else {
            return Ok(QuotaDecision::unlimited(dimension, used, now));
        };

        let decision = evaluate(&org, &plan, dimension, used, now);
        if decision.in_grace_period && decision.limit_hit_at == Some(now) {
            info!(org_id = %org_id, dimension = dimension.as_str(), "Quota exceeded, grace period started");
        } else if !decision.allowed {
            warn!(org_id = %org_id, dimension = dimension.as_str(), used, limit = decision.limit, "Quota exceeded");
        }
        Ok(decision)
    }

    async fn connect_decision(
        &self,
        org_id: &str,
        concurrent: Option<i64>,
    ) -> Result<QuotaDecision, StoreError> {
        let now = Utc::now();
        let concurrency = self
            .decide(org_id, UsageDimension::ConcurrentTunnels, concurrent, now)
            .await?;
        if !concurrency.allowed {
            return Ok(concurrency);
        }
        self.decide(org_id, UsageDimension::Bandwidth, None, now).await
    }

    /// Gate for registering a new tunnel: concurrency, then bandwidth.
    ///
    /// Returns the first denying decision, or the bandwidth decision. This
    /// only reads the counter; admission uses [`QuotaChecker::reserve_tunnel`].
    pub async fn can_connect_tunnel(&self, org_id: &str) -> Result<QuotaDecision, StoreError> {
        self.connect_decision(org_id, None).await
    }

    /// Take a concurrency slot, then run the tunnel gate against the tunnels
    /// that held a slot before this one.
    ///
    /// The slot stays taken only when the decision allows; the caller then
    /// owns it and gives it back with `UsageCache::tunnel_disconnected`.
    /// Concurrent callers race on the atomic increment, so at most `limit`
    /// of them are allowed.
    pub async fn reserve_tunnel(&self, org_id: &str) -> Result<QuotaDecision, StoreError> {
        let ahead = self.usage.tunnel_connected(org_id) - 1;
        let result = self.connect_decision(org_id, Some(ahead)).await;
        if !matches!(&result, Ok(decision) if decision.allowed) {
            self.usage.tunnel_disconnected(org_id);
        }
        result
    }

    /// Gate for proxying a request: request count, then bandwidth.
    ///
    /// Returns the denying decision, else whichever allowed decision should
    /// feed the quota headers (requests when limited, else bandwidth).
    pub async fn can_process_request(&self, org_id: &str) -> Result<QuotaDecision, StoreError> {
        let requests = self.check_quota(org_id, UsageDimension::Requests).await?;
        if !requests.allowed {
            return Ok(requests);
        }
        let bandwidth = self.check_quota(org_id, UsageDimension::Bandwidth).await?;
        if !bandwidth.allowed || !requests.is_limited() {
            return Ok(bandwidth);
        }
        Ok(requests)
    }

    /// Explicit reset of grace episodes, for plan changes
    pub fn reset_grace(&self, org_id: &str) {
        self.usage.clear_limit_hits(org_id);
        self.plans.invalidate_org(org_id);
    }
}

/// Build a checker over a store, with fresh caches
pub fn checker_for(store: Arc<dyn Store>) -> QuotaChecker {
    QuotaChecker::new(
        Arc::new(UsageCache::new(store.clone())),
        Arc::new(PlanCache::new(store)),
    )
}
