//! Calendar helpers for usage periods (all UTC)

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use gatehouse_store::{Granularity, Store, StoreError, UsageCounters};
use std::collections::HashSet;

pub fn hour_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

pub fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t)
}

pub fn month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// Start of the following month; this is when quotas reset
pub fn next_month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

pub fn previous_month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    month_start(month_start(t) - Duration::days(1))
}

/// Persisted usage for `org_id` in the month containing `now`.
///
/// Days already rolled up are read from daily snapshots; the rest come from
/// hourly ones.
pub async fn period_usage(
    store: &dyn Store,
    org_id: &str,
    now: DateTime<Utc>,
) -> Result<UsageCounters, StoreError> {
    let from = month_start(now);
    let to = next_month_start(now);

    let daily = store
        .list_usage_snapshots(Some(org_id), Granularity::Daily, from, to)
        .await?;
    let hourly = store
        .list_usage_snapshots(Some(org_id), Granularity::Hourly, from, to)
        .await?;

    let covered: HashSet<DateTime<Utc>> = daily.iter().map(|s| s.period_start).collect();
    let mut total = UsageCounters::default();
    for snapshot in &daily {
        total.add(&snapshot.counters);
    }
    for snapshot in hourly
        .iter()
        .filter(|s| !covered.contains(&day_start(s.period_start)))
    {
        total.add(&snapshot.counters);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_store::{MemoryStore, UsageSnapshot};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_boundaries() {
        let t = at(2026, 12, 31, 23, 59);
        assert_eq!(hour_start(t), at(2026, 12, 31, 23, 0));
        assert_eq!(day_start(t), at(2026, 12, 31, 0, 0));
        assert_eq!(month_start(t), at(2026, 12, 1, 0, 0));
        assert_eq!(next_month_start(t), at(2027, 1, 1, 0, 0));
        assert_eq!(previous_month_start(at(2026, 1, 15, 0, 0)), at(2025, 12, 1, 0, 0));
    }

    #[tokio::test]
    async fn test_period_usage_prefers_daily_rollups() {
        let store = MemoryStore::new();
        let counters = UsageCounters {
            bandwidth_bytes: 10,
            tunnel_seconds: 0,
            requests: 1,
        };

        // Day 1: hourly rows plus a daily rollup covering them
        for h in 0..3 {
            store
                .add_usage("org", Granularity::Hourly, at(2026, 3, 1, h, 0), &counters, 0)
                .await
                .unwrap();
        }
        store
            .put_usage_snapshot(&UsageSnapshot {
                org_id: "org".into(),
                granularity: Granularity::Daily,
                period_start: at(2026, 3, 1, 0, 0),
                counters: UsageCounters {
                    bandwidth_bytes: 30,
                    tunnel_seconds: 0,
                    requests: 3,
                },
                peak_concurrent: 0,
            })
            .await
            .unwrap();

        // Day 2: not rolled up yet
        store
            .add_usage("org", Granularity::Hourly, at(2026, 3, 2, 5, 0), &counters, 0)
            .await
            .unwrap();

        // Previous month is ignored
        store
            .add_usage("org", Granularity::Hourly, at(2026, 2, 28, 5, 0), &counters, 0)
            .await
            .unwrap();

        let total = period_usage(&store, "org", at(2026, 3, 2, 12, 0)).await.unwrap();
        assert_eq!(total.bandwidth_bytes, 40);
        assert_eq!(total.requests, 4);
    }
}
