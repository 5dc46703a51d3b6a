//! Domain records shared by every storage backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user who can own tunnels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub org_id: Option<String>,
    /// Addresses allowed to open tunnels for this account (empty = any)
    pub ip_whitelist: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub plan_id: Option<String>,
    pub ip_whitelist: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// How an application picks its auth policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Inherit,
    Custom,
    Disabled,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Inherit => "inherit",
            AuthMode::Custom => "custom",
            AuthMode::Disabled => "disabled",
        }
    }

    /// Unknown values read back from storage are treated as `Disabled`
    pub fn parse(value: &str) -> Self {
        match value {
            "inherit" => AuthMode::Inherit,
            "custom" => AuthMode::Custom,
            _ => AuthMode::Disabled,
        }
    }
}

/// Per-application rate-limit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_failures: u32,
    pub window_secs: u64,
}

/// A persistent application bound to a subdomain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub subdomain: String,
    pub auth_mode: AuthMode,
    /// None uses the gateway default
    pub rate_limit: Option<RateLimitSettings>,
    pub created_at: DateTime<Utc>,
}

/// Authentication requirement type.
///
/// `Unknown` keeps whatever string storage held so the dispatcher can apply
/// the strict/permissive switch to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    None,
    Basic,
    ApiKey,
    Oidc,
    Unknown(String),
}

impl PolicyType {
    pub fn as_str(&self) -> &str {
        match self {
            PolicyType::None => "none",
            PolicyType::Basic => "basic",
            PolicyType::ApiKey => "api_key",
            PolicyType::Oidc => "oidc",
            PolicyType::Unknown(s) => s,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "none" => PolicyType::None,
            "basic" => PolicyType::Basic,
            "api_key" => PolicyType::ApiKey,
            "oidc" => PolicyType::Oidc,
            other => PolicyType::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyOwner {
    App(String),
    Org(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicCredential {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcSettings {
    pub issuer: String,
    pub client_id: String,
    pub authorize_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Email domains admitted after login (empty = any)
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

/// An auth policy attached to an application or an organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPolicy {
    pub owner: PolicyOwner,
    pub policy_type: PolicyType,
    /// Accept API keys in addition to the primary method
    pub allow_api_key: bool,
    pub basic_users: Vec<BasicCredential>,
    pub oidc: Option<OidcSettings>,
    pub session_ttl_secs: u64,
    pub updated_at: DateTime<Utc>,
}

impl AuthPolicy {
    pub fn new(owner: PolicyOwner, policy_type: PolicyType) -> Self {
        Self {
            owner,
            policy_type,
            allow_api_key: false,
            basic_users: Vec::new(),
            oidc: None,
            session_ttl_secs: 24 * 3600,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    /// Account the key acts as, used for tunnel registration
    pub account_id: Option<String>,
    pub org_id: Option<String>,
    /// Restricts the key to a single application
    pub app_id: Option<String>,
    pub display_prefix: String,
    pub key_hash: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Browser session established by Basic or OIDC login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token_hash: String,
    /// Subdomain the session was issued for
    pub subdomain: String,
    pub identity: String,
    pub method: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Sentinel limit meaning "no limit"
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub bandwidth_bytes: i64,
    pub tunnel_hours: i64,
    pub concurrent_tunnels: i64,
    pub requests: i64,
}

impl PlanLimits {
    pub fn unlimited() -> Self {
        Self {
            bandwidth_bytes: UNLIMITED,
            tunnel_hours: UNLIMITED,
            concurrent_tunnels: UNLIMITED,
            requests: UNLIMITED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub limits: PlanLimits,
    pub overage_percent: u32,
    pub grace_period_hours: u32,
}

/// Metered counters for one organization over some period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub bandwidth_bytes: i64,
    pub tunnel_seconds: i64,
    pub requests: i64,
}

impl UsageCounters {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn add(&mut self, other: &UsageCounters) {
        self.bandwidth_bytes += other.bandwidth_bytes;
        self.tunnel_seconds += other.tunnel_seconds;
        self.requests += other.requests;
    }

    pub fn subtract(&mut self, other: &UsageCounters) {
        self.bandwidth_bytes -= other.bandwidth_bytes;
        self.tunnel_seconds -= other.tunnel_seconds;
        self.requests -= other.requests;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hourly" => Some(Granularity::Hourly),
            "daily" => Some(Granularity::Daily),
            "monthly" => Some(Granularity::Monthly),
            _ => None,
        }
    }
}

/// Persisted usage for one org over one hour, day or month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub org_id: String,
    pub granularity: Granularity,
    pub period_start: DateTime<Utc>,
    pub counters: UsageCounters,
    pub peak_concurrent: i64,
}

/// Persisted record of a tunnel's lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: String,
    pub subdomain: String,
    pub transport: String,
    pub account_id: Option<String>,
    pub org_id: Option<String>,
    pub app_id: Option<String>,
    pub client_addr: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_type_parse_keeps_unknown() {
        assert_eq!(PolicyType::parse("basic"), PolicyType::Basic);
        assert_eq!(PolicyType::parse("api_key"), PolicyType::ApiKey);
        assert_eq!(
            PolicyType::parse("saml"),
            PolicyType::Unknown("saml".to_string())
        );
        assert_eq!(PolicyType::parse("saml").as_str(), "saml");
    }

    #[test]
    fn test_counters_add_subtract() {
        let mut a = UsageCounters {
            bandwidth_bytes: 10,
            tunnel_seconds: 5,
            requests: 1,
        };
        let b = a;
        a.add(&b);
        assert_eq!(a.bandwidth_bytes, 20);
        a.subtract(&b);
        assert_eq!(a, b);
        a.subtract(&b);
        assert!(a.is_zero());
    }

    #[test]
    fn test_api_key_usable() {
        let now = Utc::now();
        let mut key = ApiKey {
            id: "k".into(),
            name: "ci".into(),
            account_id: None,
            org_id: None,
            app_id: None,
            display_prefix: "ghk_abcd".into(),
            key_hash: "h".into(),
            is_active: true,
            expires_at: None,
            last_used_at: None,
            created_at: now,
        };
        assert!(key.is_usable_at(now));
        key.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!key.is_usable_at(now));
        key.expires_at = None;
        key.is_active = false;
        assert!(!key.is_usable_at(now));
    }
}
