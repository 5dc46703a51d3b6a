//! In-memory usage accounting
//!
//! Every org has a baseline (what storage already holds for the current
//! month) and a delta (recorded since the last flush). Reads return
//! `baseline + delta`. Record calls touch only the delta under the org's own
//! lock; the concurrent-tunnel count is a lock-free atomic. Loading the
//! baseline and flushing the delta both go through the org's async `io`
//! lock, so a baseline read never lands in the middle of a flush.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gatehouse_store::{Granularity, Store, StoreError, UsageCounters};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::period::{hour_start, month_start, period_usage};
use crate::quota::UsageDimension;

#[derive(Debug)]
pub(crate) struct OrgState {
    pub(crate) baseline: UsageCounters,
    pub(crate) delta: UsageCounters,
    pub(crate) baseline_loaded: bool,
    pub(crate) period_start: DateTime<Utc>,
    pub(crate) peak_concurrent: i64,
    /// When each dimension first crossed its limit in the current episode
    pub(crate) limit_hit_at: HashMap<UsageDimension, DateTime<Utc>>,
}

/// Usage state for one organization
#[derive(Debug)]
pub struct OrgUsage {
    pub(crate) state: Mutex<OrgState>,
    concurrent: AtomicI64,
    /// Held across every storage round trip for this org
    io: tokio::sync::Mutex<()>,
}

impl OrgUsage {
    fn new(period_start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(OrgState {
                baseline: UsageCounters::default(),
                delta: UsageCounters::default(),
                baseline_loaded: false,
                period_start,
                peak_concurrent: 0,
                limit_hit_at: HashMap::new(),
            }),
            concurrent: AtomicI64::new(0),
            io: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current(&self) -> UsageCounters {
        let state = self.state.lock();
        let mut total = state.baseline;
        total.add(&state.delta);
        total
    }

    pub fn pending_delta(&self) -> UsageCounters {
        self.state.lock().delta
    }

    pub fn concurrent_tunnels(&self) -> i64 {
        self.concurrent.load(Ordering::SeqCst)
    }

    pub fn limit_hit_at(&self, dimension: UsageDimension) -> Option<DateTime<Utc>> {
        self.state.lock().limit_hit_at.get(&dimension).copied()
    }
}

pub struct UsageCache {
    orgs: DashMap<String, Arc<OrgUsage>>,
    store: Arc<dyn Store>,
}

impl UsageCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            orgs: DashMap::new(),
            store,
        }
    }

    /// Get or lazily create an org's usage state
    pub fn org(&self, org_id: &str) -> Arc<OrgUsage> {
        if let Some(existing) = self.orgs.get(org_id) {
            return existing.clone();
        }
        self.orgs
            .entry(org_id.to_string())
            .or_insert_with(|| Arc::new(OrgUsage::new(month_start(Utc::now()))))
            .clone()
    }

    pub fn record_bandwidth(&self, org_id: &str, bytes: u64) {
        let org = self.org(org_id);
        org.state.lock().delta.bandwidth_bytes += bytes as i64;
    }

    pub fn record_request(&self, org_id: &str) {
        let org = self.org(org_id);
        org.state.lock().delta.requests += 1;
    }

    pub fn record_tunnel_time(&self, org_id: &str, seconds: u64) {
        let org = self.org(org_id);
        org.state.lock().delta.tunnel_seconds += seconds as i64;
    }

    /// Count a newly connected tunnel; returns the new concurrency
    pub fn tunnel_connected(&self, org_id: &str) -> i64 {
        let org = self.org(org_id);
        let now = org.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = org.state.lock();
        state.peak_concurrent = state.peak_concurrent.max(now);
        now
    }

    pub fn tunnel_disconnected(&self, org_id: &str) -> i64 {
        let org = self.org(org_id);
        let previous = org
            .concurrent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n - 1).max(0)))
            .unwrap_or(0);
        (previous - 1).max(0)
    }

    /// `baseline + delta`, without touching storage
    pub fn current_usage(&self, org_id: &str) -> UsageCounters {
        self.org(org_id).current()
    }

    pub fn concurrent_tunnels(&self, org_id: &str) -> i64 {
        self.org(org_id).concurrent_tunnels()
    }

    /// Load the org's persisted baseline for the current month, once.
    pub async fn ensure_baseline(&self, org_id: &str) -> Result<Arc<OrgUsage>, StoreError> {
        let org = self.org(org_id);
        if org.state.lock().baseline_loaded {
            return Ok(org);
        }

        {
            let _io = org.io.lock().await;
            if !org.state.lock().baseline_loaded {
                let persisted = period_usage(self.store.as_ref(), org_id, Utc::now()).await?;
                let mut state = org.state.lock();
                state.baseline = persisted;
                state.baseline_loaded = true;
                debug!(org_id = %org_id, ?persisted, "Loaded usage baseline");
            }
        }
        Ok(org)
    }

    pub fn org_ids(&self) -> Vec<String> {
        self.orgs.iter().map(|e| e.key().clone()).collect()
    }

    /// Persist every org's delta into the hourly snapshot containing `now`.
    ///
    /// Each org is flushed independently. A failed org keeps its delta and
    /// is retried on the next call; the error count is returned.
    pub async fn flush(&self, now: DateTime<Utc>) -> usize {
        let bucket = hour_start(now);
        let mut failures = 0;

        for org_id in self.org_ids() {
            let org = self.org(&org_id);
            let _io = org.io.lock().await;
            let (pending, peak) = {
                let state = org.state.lock();
                (state.delta, state.peak_concurrent)
            };
            if pending.is_zero() {
                continue;
            }

            match self
                .store
                .add_usage(&org_id, Granularity::Hourly, bucket, &pending, peak)
                .await
            {
                Ok(()) => {
                    // Move exactly what was persisted; records made during
                    // the write stay in the delta.
                    let mut state = org.state.lock();
                    state.baseline.add(&pending);
                    state.delta.subtract(&pending);
                    state.peak_concurrent = org.concurrent_tunnels();
                }
                Err(e) => {
                    failures += 1;
                    warn!(org_id = %org_id, error = %e, "Usage flush failed, will retry");
                }
            }
        }
        failures
    }

    /// Start a new billing period: baselines drop to zero and grace
    /// episodes end. Call after a flush so the old month's delta is stored.
    pub fn reset_period(&self, period_start: DateTime<Utc>) {
        for entry in self.orgs.iter() {
            let mut state = entry.value().state.lock();
            if state.period_start >= period_start {
                continue;
            }
            state.baseline = UsageCounters::default();
            state.delta = UsageCounters::default();
            state.limit_hit_at.clear();
            state.period_start = period_start;
            state.baseline_loaded = true;
        }
    }

    /// Forget grace marks for an org (plan change)
    pub fn clear_limit_hits(&self, org_id: &str) {
        if let Some(org) = self.orgs.get(org_id) {
            org.state.lock().limit_hit_at.clear();
        }
    }
}
