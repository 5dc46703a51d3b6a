//! Usage metering and quota enforcement
//!
//! [`UsageCache`] keeps per-organization counters in memory, split into a
//! persisted baseline and an unflushed delta. [`QuotaChecker`] turns those
//! counters and the org's [`Plan`](gatehouse_store::Plan) into allow/deny
//! decisions, with overage and grace-period handling. [`UsageScheduler`]
//! drives flushes, plan refreshes, rollups and retention in the background.

pub mod cache;
pub mod period;
pub mod plans;
pub mod quota;
pub mod scheduler;

pub use cache::{OrgUsage, UsageCache};
pub use plans::PlanCache;
pub use quota::{QuotaChecker, QuotaDecision, UsageDimension};
pub use scheduler::{SchedulerConfig, UsageScheduler};
