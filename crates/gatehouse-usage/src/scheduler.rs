//! Background usage jobs
//!
//! Three independent tickers: flush (plus month rollover), plan refresh, and
//! rollups with retention. A failing job logs and waits for its next tick;
//! it never stops the others.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gatehouse_store::{Granularity, Store, StoreError, UsageCounters, UsageSnapshot};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::UsageCache;
use crate::period::{day_start, month_start, previous_month_start};
use crate::plans::PlanCache;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub flush_interval: Duration,
    pub plan_refresh_interval: Duration,
    pub rollup_interval: Duration,
    pub hourly_retention_days: i64,
    pub daily_retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            plan_refresh_interval: Duration::from_secs(300),
            rollup_interval: Duration::from_secs(600),
            hourly_retention_days: 7,
            daily_retention_days: 90,
        }
    }
}

#[derive(Debug, Default)]
struct RollupMarks {
    /// Last day rolled up into a daily snapshot
    daily_done: Option<DateTime<Utc>>,
    /// Last month rolled up into a monthly snapshot
    monthly_done: Option<DateTime<Utc>>,
    /// Billing period the cache is currently accumulating
    period: Option<DateTime<Utc>>,
}

pub struct UsageScheduler {
    cache: Arc<UsageCache>,
    plans: Arc<PlanCache>,
    store: Arc<dyn Store>,
    config: SchedulerConfig,
    marks: Mutex<RollupMarks>,
}

impl UsageScheduler {
    pub fn new(
        cache: Arc<UsageCache>,
        plans: Arc<PlanCache>,
        store: Arc<dyn Store>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            cache,
            plans,
            store,
            config,
            marks: Mutex::new(RollupMarks {
                period: Some(month_start(Utc::now())),
                ..Default::default()
            }),
        }
    }

    /// Spawn the tickers. Abort the handles to stop them.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let flush = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.flush_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    this.tick_flush(Utc::now()).await;
                }
            })
        };

        let plans = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.plan_refresh_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    if let Err(e) = this.plans.refresh().await {
                        warn!(error = %e, "Plan refresh failed");
                    }
                }
            })
        };

        let rollups = {
            let this = self;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.rollup_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    this.tick_rollups(Utc::now()).await;
                }
            })
        };

        info!("Usage scheduler started");
        vec![flush, plans, rollups]
    }

    /// Final flush on shutdown so buffered usage is not lost
    pub async fn shutdown(&self) {
        let failures = self.cache.flush(Utc::now()).await;
        if failures > 0 {
            error!(failures, "Usage could not be persisted on shutdown");
        } else {
            info!("Usage flushed on shutdown");
        }
    }

    /// Flush deltas; on a month change, close out the old period first.
    pub async fn tick_flush(&self, now: DateTime<Utc>) {
        let current_period = month_start(now);
        let previous = self.marks.lock().period;

        if previous.is_some_and(|p| p < current_period) {
            // Attribute the tail of the old month to its last hour
            let failures = self
                .cache
                .flush(current_period - ChronoDuration::seconds(1))
                .await;
            if failures > 0 {
                warn!(failures, "Could not close out usage period, will retry");
                return;
            }
            self.cache.reset_period(current_period);
            self.marks.lock().period = Some(current_period);
            info!(period = %current_period, "Usage period rolled over");
            return;
        }

        let failures = self.cache.flush(now).await;
        if failures > 0 {
            debug!(failures, "Some orgs failed to flush");
        }
    }

    /// Daily and monthly rollups plus retention, each at most once per period.
    pub async fn tick_rollups(&self, now: DateTime<Utc>) {
        let yesterday = day_start(now) - ChronoDuration::days(1);
        let daily_due = self.marks.lock().daily_done != Some(yesterday);
        if daily_due {
            match self
                .rollup(Granularity::Hourly, Granularity::Daily, yesterday, day_start(now))
                .await
            {
                Ok(orgs) => {
                    self.marks.lock().daily_done = Some(yesterday);
                    info!(day = %yesterday, orgs, "Daily usage rollup complete");
                    self.apply_retention(now).await;
                }
                Err(e) => error!(error = %e, "Daily usage rollup failed, will retry"),
            }
        }

        let last_month = previous_month_start(now);
        let monthly_due = self.marks.lock().monthly_done != Some(last_month);
        if monthly_due {
            match self
                .rollup(Granularity::Daily, Granularity::Monthly, last_month, month_start(now))
                .await
            {
                Ok(orgs) => {
                    self.marks.lock().monthly_done = Some(last_month);
                    info!(month = %last_month, orgs, "Monthly usage rollup complete");
                }
                Err(e) => error!(error = %e, "Monthly usage rollup failed, will retry"),
            }
        }
    }

    /// Sum `from` snapshots in `[start, end)` into one `into` snapshot per
    /// org at `start`. Recomputes from scratch, so reruns are harmless.
    async fn rollup(
        &self,
        from: Granularity,
        into: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let snapshots = self
            .store
            .list_usage_snapshots(None, from, start, end)
            .await?;

        let mut per_org: BTreeMap<String, (UsageCounters, i64)> = BTreeMap::new();
        for snapshot in snapshots {
            let entry = per_org.entry(snapshot.org_id).or_default();
            entry.0.add(&snapshot.counters);
            entry.1 = entry.1.max(snapshot.peak_concurrent);
        }

        let mut first_error = None;
        let mut written = 0;
        for (org_id, (counters, peak)) in per_org {
            let snapshot = UsageSnapshot {
                org_id,
                granularity: into,
                period_start: start,
                counters,
                peak_concurrent: peak,
            };
            match self.store.put_usage_snapshot(&snapshot).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(org_id = %snapshot.org_id, error = %e, "Rollup write failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn apply_retention(&self, now: DateTime<Utc>) {
        let policies = [
            (Granularity::Hourly, self.config.hourly_retention_days),
            (Granularity::Daily, self.config.daily_retention_days),
        ];
        for (granularity, days) in policies {
            let cutoff = now - ChronoDuration::days(days);
            match self
                .store
                .delete_usage_snapshots_before(granularity, cutoff)
                .await
            {
                Ok(0) => {}
                Ok(removed) => {
                    debug!(granularity = granularity.as_str(), removed, "Expired usage snapshots purged")
                }
                Err(e) => warn!(granularity = granularity.as_str(), error = %e, "Usage retention failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gatehouse_store::MemoryStore;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn scheduler() -> (Arc<MemoryStore>, Arc<UsageCache>, UsageScheduler) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(UsageCache::new(store.clone()));
        let plans = Arc::new(PlanCache::new(store.clone()));
        let scheduler =
            UsageScheduler::new(cache.clone(), plans, store.clone(), SchedulerConfig::default());
        (store, cache, scheduler)
    }

    fn counters(bytes: i64) -> UsageCounters {
        UsageCounters {
            bandwidth_bytes: bytes,
            tunnel_seconds: 0,
            requests: 1,
        }
    }

    #[tokio::test]
    async fn test_daily_and_monthly_rollups() {
        let (store, _cache, scheduler) = scheduler();
        for h in [1, 5, 23] {
            store
                .add_usage("org", Granularity::Hourly, at(2026, 2, 28, h), &counters(10), h as i64)
                .await
                .unwrap();
        }
        store
            .add_usage("org", Granularity::Daily, at(2026, 2, 10, 0), &counters(100), 0)
            .await
            .unwrap();

        scheduler.tick_rollups(at(2026, 3, 1, 2)).await;

        let daily = store
            .list_usage_snapshots(Some("org"), Granularity::Daily, at(2026, 2, 28, 0), at(2026, 3, 1, 0))
            .await
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].counters.bandwidth_bytes, 30);
        assert_eq!(daily[0].counters.requests, 3);
        assert_eq!(daily[0].peak_concurrent, 23);

        let monthly = store
            .list_usage_snapshots(Some("org"), Granularity::Monthly, at(2026, 2, 1, 0), at(2026, 3, 1, 0))
            .await
            .unwrap();
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].counters.bandwidth_bytes, 130);
    }

    #[tokio::test]
    async fn test_rollup_runs_once_per_period() {
        let (store, _cache, scheduler) = scheduler();
        let now = at(2026, 3, 5, 1);
        scheduler.tick_rollups(now).await;

        // Late-arriving hourly data is not rolled up again the same day
        store
            .add_usage("org", Granularity::Hourly, at(2026, 3, 4, 3), &counters(10), 0)
            .await
            .unwrap();
        scheduler.tick_rollups(now + ChronoDuration::minutes(10)).await;

        let daily = store
            .list_usage_snapshots(None, Granularity::Daily, at(2026, 3, 4, 0), at(2026, 3, 5, 0))
            .await
            .unwrap();
        assert!(daily.is_empty());
    }

    #[tokio::test]
    async fn test_retention_purges_old_hourly() {
        let (store, _cache, scheduler) = scheduler();
        let now = at(2026, 3, 20, 1);
        store
            .add_usage("org", Granularity::Hourly, at(2026, 3, 1, 0), &counters(1), 0)
            .await
            .unwrap();
        store
            .add_usage("org", Granularity::Hourly, at(2026, 3, 18, 0), &counters(1), 0)
            .await
            .unwrap();

        scheduler.tick_rollups(now).await;

        let hourly = store
            .list_usage_snapshots(None, Granularity::Hourly, at(2026, 1, 1, 0), now)
            .await
            .unwrap();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].period_start, at(2026, 3, 18, 0));
    }

    #[tokio::test]
    async fn test_month_rollover_resets_cache() {
        let (store, cache, scheduler) = scheduler();
        cache.record_bandwidth("org", 42);

        let next_month = crate::period::next_month_start(Utc::now());
        scheduler.tick_flush(next_month + ChronoDuration::minutes(1)).await;

        assert!(cache.current_usage("org").is_zero());
        let old = store
            .list_usage_snapshots(
                Some("org"),
                Granularity::Hourly,
                month_start(Utc::now()),
                next_month,
            )
            .await
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].counters.bandwidth_bytes, 42);
    }
}
