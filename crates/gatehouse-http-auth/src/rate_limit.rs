//! Failed-attempt rate limiting
//!
//! Each key gets a governor GCRA budget of `max_failures` cells that refills
//! evenly over `window`. Only failed credential submissions spend a cell, so
//! clients still on their way to a login page are never locked out. A failure
//! that finds the budget empty locks the key until governor would let the
//! next attempt through.

use dashmap::DashMap;
use gatehouse_store::{RateLimitSettings, Store};
use governor::clock::{Clock, DefaultClock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DashMapStateStore;
use governor::Quota;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::AuthContext;

/// Default maximum failed attempts per window
pub const DEFAULT_MAX_FAILURES: u32 = 10;

/// Default window duration in seconds
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// How long a per-application override is trusted before reloading
pub const RATE_LIMIT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub max_failures: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    /// Burst of `max_failures`, one cell back every `window / max_failures`
    pub fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.max_failures).unwrap_or(NonZeroU32::MIN);
        let period = (self.window / burst.get()).max(Duration::from_millis(1));
        Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self {
            max_failures: settings.max_failures,
            window: Duration::from_secs(settings.window_secs),
        }
    }
}

type KeyedLimiter<C> = governor::RateLimiter<
    String,
    DashMapStateStore<String>,
    C,
    NoOpMiddleware<<C as Clock>::Instant>,
>;

pub struct RateLimiter<C: Clock = DefaultClock> {
    config: RateLimitConfig,
    clock: C,
    failures: KeyedLimiter<C>,
    /// Key -> instant the lockout ends
    lockouts: DashMap<String, C::Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, DefaultClock::default())
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(config: RateLimitConfig, clock: C) -> Self {
        let failures =
            governor::RateLimiter::new(config.quota(), DashMapStateStore::default(), &clock);
        Self {
            config,
            clock,
            failures,
            lockouts: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// `Some(retry_after)` while the key is locked out
    pub fn is_limited(&self, key: &str) -> Option<Duration> {
        let until = *self.lockouts.get(key)?;
        let now = self.clock.now();
        if until > now {
            let remaining = Duration::from(until.duration_since(now));
            return Some(remaining.max(Duration::from_secs(1)));
        }
        self.lockouts.remove_if(key, |_, until| *until <= now);
        None
    }

    pub fn record_failure(&self, key: &str) {
        let key = key.to_string();
        if let Err(not_until) = self.failures.check_key(&key) {
            let wait = not_until.wait_time_from(self.clock.now());
            debug!(key = %key, retry_after = ?wait, "Failed attempts exhausted, locking out");
            self.lockouts.insert(key, not_until.earliest_possible());
        }
    }

    /// Drop keys whose budget has fully refilled and lockouts that ended
    pub fn gc(&self) {
        self.failures.retain_recent();
        let now = self.clock.now();
        self.lockouts.retain(|_, until| *until > now);
    }

    pub fn tracked_keys(&self) -> usize {
        self.failures.len()
    }
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tracked_keys", &self.failures.len())
            .finish()
    }
}

#[derive(Clone)]
struct AppLimiter {
    settings: Option<RateLimitSettings>,
    /// `None` when the application turned rate limiting off
    limiter: Option<Arc<RateLimiter>>,
    loaded_at: Instant,
}

/// Picks the limiter for a request: the global one, or an application's
/// own override loaded from storage.
pub struct RateLimitResolver {
    store: Arc<dyn Store>,
    global: Option<Arc<RateLimiter>>,
    key_by_app: bool,
    ttl: Duration,
    per_app: DashMap<String, AppLimiter>,
}

impl RateLimitResolver {
    /// `global = None` disables the default limiter; per-app overrides
    /// still apply.
    pub fn new(store: Arc<dyn Store>, global: Option<RateLimitConfig>) -> Self {
        Self {
            store,
            global: global.map(|config| Arc::new(RateLimiter::new(config))),
            key_by_app: false,
            ttl: RATE_LIMIT_CACHE_TTL,
            per_app: DashMap::new(),
        }
    }

    /// Salt limiter keys with the application id
    pub fn with_app_keys(mut self, key_by_app: bool) -> Self {
        self.key_by_app = key_by_app;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn global(&self) -> Option<&Arc<RateLimiter>> {
        self.global.as_ref()
    }

    pub fn key_for(&self, ctx: &AuthContext, client_ip: IpAddr) -> String {
        match (&ctx.app_id, self.key_by_app) {
            (Some(app_id), true) => format!("{}:{}", app_id, client_ip),
            _ => client_ip.to_string(),
        }
    }

    pub async fn limiter_for(&self, ctx: &AuthContext) -> Option<Arc<RateLimiter>> {
        let Some(app_id) = ctx.app_id.as_deref() else {
            return self.global.clone();
        };

        let cached = self.per_app.get(app_id).map(|entry| entry.clone());
        if let Some(entry) = &cached {
            if entry.loaded_at.elapsed() < self.ttl {
                return self.pick(entry);
            }
        }

        let settings = match self.store.get_application(app_id).await {
            Ok(app) => app.and_then(|app| app.rate_limit),
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "Could not load rate limit override, using default");
                return cached
                    .as_ref()
                    .map_or_else(|| self.global.clone(), |entry| self.pick(entry));
            }
        };

        // Unchanged settings keep their limiter so counts survive a reload
        let limiter = match (&settings, cached) {
            (Some(s), Some(previous)) if previous.settings.as_ref() == Some(s) => previous.limiter,
            (Some(s), _) if s.enabled => Some(Arc::new(RateLimiter::new(s.into()))),
            _ => None,
        };

        let entry = AppLimiter {
            settings,
            limiter,
            loaded_at: Instant::now(),
        };
        debug!(app_id = %app_id, overridden = entry.settings.is_some(), "Loaded rate limit settings");
        let picked = self.pick(&entry);
        self.per_app.insert(app_id.to_string(), entry);
        picked
    }

    fn pick(&self, entry: &AppLimiter) -> Option<Arc<RateLimiter>> {
        match &entry.settings {
            None => self.global.clone(),
            Some(_) => entry.limiter.clone(),
        }
    }

    /// Forget an application's cached override (settings changed)
    pub fn invalidate_app(&self, app_id: &str) {
        self.per_app.remove(app_id);
    }

    /// Garbage-collect every limiter
    pub fn gc(&self) {
        if let Some(global) = &self.global {
            global.gc();
        }
        for entry in self.per_app.iter() {
            if let Some(limiter) = &entry.limiter {
                limiter.gc();
            }
        }
    }
}
