//! Tunnel admission and teardown
//!
//! Both transports register tunnels through [`TunnelAdmission::admit`]. The
//! checks run in a fixed order: credential, IP whitelist, subdomain
//! ownership, quota, then the registry claim. The quota step takes the
//! org's concurrency slot up front and holds it in a reservation, so every
//! later failure gives it back. Nothing is claimed or persisted
//! until every check has passed. The returned [`TunnelLease`] owns
//! everything the registration created and undoes it exactly once.

use chrono::Utc;
use gatehouse_auth::{hash_api_key, looks_like_api_key, JwtValidator};
use gatehouse_proto::{validate_subdomain, IpFilter};
use gatehouse_router::{RegistryError, RouteClaim, TunnelOwner};
use gatehouse_store::{Account, Store, TunnelRecord};
use gatehouse_usage::{QuotaChecker, UsageCache};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{AdmissionError, PendingRequests, TunnelHandle, TunnelRegistry};

/// Credential presented by a tunnel client
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    /// Signed account token
    AccountToken(String),
    ApiKey(String),
}

impl Credential {
    /// Classify a bare secret by its shape
    pub fn classify(value: impl Into<String>) -> Self {
        let value = value.into();
        if looks_like_api_key(&value) {
            Credential::ApiKey(value)
        } else {
            Credential::AccountToken(value)
        }
    }

    /// WS registration carries `token` and/or `secret`; `secret` wins.
    pub fn from_parts(token: Option<String>, secret: Option<String>) -> Option<Self> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        match (non_empty(token), non_empty(secret)) {
            (_, Some(secret)) => Some(Credential::classify(secret)),
            (Some(token), None) => Some(Credential::classify(token)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Base domain; tunnels are served at `<subdomain>.<domain>`
    pub domain: String,
    pub scheme: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            scheme: "https".to_string(),
        }
    }
}

impl AdmissionConfig {
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("{}://{}.{}", self.scheme, subdomain, self.domain)
    }
}

/// Who a credential resolved to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Principal {
    pub account_id: Option<String>,
    pub org_id: Option<String>,
    /// Set when an API key is restricted to one application
    pub key_app_id: Option<String>,
    account: Option<Account>,
}

/// Persisted tunnel record id for one subdomain of a tunnel
pub fn record_id(tunnel_id: &str, subdomain: &str) -> String {
    format!("{}:{}", tunnel_id, subdomain)
}

pub struct TunnelAdmission {
    store: Arc<dyn Store>,
    jwt: Option<JwtValidator>,
    registry: Arc<TunnelRegistry>,
    quota: Arc<QuotaChecker>,
    config: AdmissionConfig,
}

impl TunnelAdmission {
    pub fn new(
        store: Arc<dyn Store>,
        jwt: Option<JwtValidator>,
        registry: Arc<TunnelRegistry>,
        quota: Arc<QuotaChecker>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            jwt,
            registry,
            quota,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn public_url(&self, subdomain: &str) -> String {
        self.config.public_url(subdomain)
    }

    /// Resolve a credential to the account and organization it acts for
    pub async fn authenticate(&self, credential: &Credential) -> Result<Principal, AdmissionError> {
        match credential {
            Credential::AccountToken(token) => {
                let jwt = self.jwt.as_ref().ok_or_else(|| {
                    AdmissionError::Config("account tokens are not accepted".to_string())
                })?;
                let claims = jwt
                    .validate(token)
                    .map_err(|e| AdmissionError::InvalidCredentials(e.to_string()))?;
                let account = self
                    .store
                    .get_account(&claims.sub)
                    .await?
                    .ok_or_else(|| AdmissionError::InvalidCredentials("unknown account".to_string()))?;
                if !account.is_active {
                    return Err(AdmissionError::AccountDisabled);
                }
                Ok(Principal {
                    account_id: Some(account.id.clone()),
                    org_id: account.org_id.clone().or(claims.org_id),
                    key_app_id: None,
                    account: Some(account),
                })
            }
            Credential::ApiKey(key) => {
                let now = Utc::now();
                let record = self
                    .store
                    .find_api_key_by_hash(&hash_api_key(key))
                    .await?
                    .ok_or_else(|| AdmissionError::InvalidCredentials("unknown API key".to_string()))?;
                if !record.is_usable_at(now) {
                    return Err(AdmissionError::InvalidCredentials(
                        "API key is inactive or expired".to_string(),
                    ));
                }

                let account = match &record.account_id {
                    Some(id) => self.store.get_account(id).await?,
                    None => None,
                };
                if account.as_ref().is_some_and(|a| !a.is_active) {
                    return Err(AdmissionError::AccountDisabled);
                }

                if let Err(e) = self.store.touch_api_key(&record.id, now).await {
                    warn!(key_id = %record.id, error = %e, "Failed to update API key last use");
                }

                Ok(Principal {
                    account_id: record.account_id.clone(),
                    org_id: record
                        .org_id
                        .clone()
                        .or_else(|| account.as_ref().and_then(|a| a.org_id.clone())),
                    key_app_id: record.app_id.clone(),
                    account,
                })
            }
        }
    }

    async fn check_whitelist(&self, principal: &Principal, peer_ip: IpAddr) -> Result<(), AdmissionError> {
        let mut lists = Vec::new();
        if let Some(account) = &principal.account {
            lists.push(account.ip_whitelist.clone());
        }
        if let Some(org_id) = &principal.org_id {
            if let Some(org) = self.store.get_organization(org_id).await? {
                lists.push(org.ip_whitelist);
            }
        }

        for entries in lists {
            let filter = IpFilter::from_allowlist(&entries)
                .map_err(|e| AdmissionError::Config(format!("invalid IP whitelist: {}", e)))?;
            if !filter.is_allowed(&peer_ip) {
                return Err(AdmissionError::IpNotAllowed(peer_ip));
            }
        }
        Ok(())
    }

    /// Map each subdomain to its persistent application, refusing names
    /// that belong to another organization or fall outside a key's scope.
    async fn check_ownership(
        &self,
        principal: &Principal,
        subdomains: &[String],
    ) -> Result<Vec<RouteClaim>, AdmissionError> {
        let mut claims = Vec::with_capacity(subdomains.len());
        for subdomain in subdomains {
            validate_subdomain(subdomain).map_err(|source| RegistryError::InvalidSubdomain {
                subdomain: subdomain.clone(),
                source,
            })?;

            let app = self.store.find_application_by_subdomain(subdomain).await?;
            if let Some(app) = &app {
                if principal.org_id.as_deref() != Some(app.org_id.as_str()) {
                    return Err(AdmissionError::SubdomainReserved(subdomain.clone()));
                }
            }
            if let Some(key_app) = &principal.key_app_id {
                if app.as_ref().map(|a| &a.id) != Some(key_app) {
                    return Err(AdmissionError::KeyScope(subdomain.clone()));
                }
            }
            claims.push(RouteClaim::new(subdomain.clone()).with_app(app.map(|a| a.id)));
        }
        Ok(claims)
    }

    /// Run every registration check and, if all pass, claim the
    /// subdomains for `handle`.
    pub async fn admit(
        &self,
        credential: Option<&Credential>,
        peer_ip: IpAddr,
        subdomains: &[String],
        handle: TunnelHandle,
    ) -> Result<TunnelLease, AdmissionError> {
        let tunnel_id = handle.tunnel_id().to_string();
        let transport = handle.kind();

        let credential = credential.ok_or(AdmissionError::MissingCredentials)?;
        let principal = self.authenticate(credential).await?;
        self.check_whitelist(&principal, peer_ip).await?;
        let claims = self.check_ownership(&principal, subdomains).await?;

        let slot = match &principal.org_id {
            Some(org_id) => {
                let decision = self.quota.reserve_tunnel(org_id).await?;
                if !decision.allowed {
                    return Err(AdmissionError::QuotaExceeded(decision.dimension));
                }
                Some(SlotReservation {
                    usage: self.quota.usage().clone(),
                    org_id: org_id.clone(),
                    kept: false,
                })
            }
            None => None,
        };

        let owner = TunnelOwner {
            account_id: principal.account_id.clone(),
            org_id: principal.org_id.clone(),
        };
        let pending = handle.pending().clone();
        self.registry
            .claim(&tunnel_id, transport, &owner, &claims, handle)?;

        let now = Utc::now();
        let mut record_ids = Vec::with_capacity(claims.len());
        for claim in &claims {
            let record = TunnelRecord {
                id: record_id(&tunnel_id, &claim.subdomain),
                subdomain: claim.subdomain.clone(),
                transport: transport.as_str().to_string(),
                account_id: owner.account_id.clone(),
                org_id: owner.org_id.clone(),
                app_id: claim.app_id.clone(),
                client_addr: Some(peer_ip.to_string()),
                created_at: now,
                closed_at: None,
            };
            match self.store.create_tunnel_record(&record).await {
                Ok(()) => record_ids.push(record.id),
                Err(e) => warn!(tunnel_id = %tunnel_id, subdomain = %claim.subdomain, error = %e, "Failed to persist tunnel record"),
            }
        }

        // The lease gives the slot back from here on
        if let Some(slot) = slot {
            slot.keep();
        }

        let subdomains: Vec<String> = claims.into_iter().map(|c| c.subdomain).collect();
        info!(
            tunnel_id = %tunnel_id,
            transport = %transport,
            subdomains = ?subdomains,
            org_id = owner.org_id.as_deref().unwrap_or("-"),
            "Tunnel admitted"
        );

        Ok(TunnelLease {
            tunnel_id,
            subdomains,
            org_id: owner.org_id,
            record_ids,
            started: Instant::now(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            usage: self.quota.usage().clone(),
            pending,
            released: AtomicBool::new(false),
        })
    }
}

/// A concurrency slot taken during admission, returned on drop unless the
/// tunnel was admitted
struct SlotReservation {
    usage: Arc<UsageCache>,
    org_id: String,
    kept: bool,
}

impl SlotReservation {
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        debug!(org_id = %self.org_id, "Admission failed, releasing tunnel slot");
        self.usage.tunnel_disconnected(&self.org_id);
    }
}

/// Everything one admitted tunnel holds. Released by [`TunnelLease::close`],
/// or on drop if the owner never got that far.
pub struct TunnelLease {
    tunnel_id: String,
    subdomains: Vec<String>,
    org_id: Option<String>,
    record_ids: Vec<String>,
    started: Instant,
    registry: Arc<TunnelRegistry>,
    store: Arc<dyn Store>,
    usage: Arc<UsageCache>,
    pending: PendingRequests,
    released: AtomicBool,
}

impl TunnelLease {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn subdomains(&self) -> &[String] {
        &self.subdomains
    }

    pub fn org_id(&self) -> Option<&str> {
        self.org_id.as_deref()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Registry, waiters and usage; everything that needs no I/O
    fn release_in_memory(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        let removed = self.registry.release(&self.tunnel_id);
        let drained = self.pending.close_all();

        if let Some(org_id) = &self.org_id {
            self.usage.tunnel_disconnected(org_id);
            self.usage
                .record_tunnel_time(org_id, self.started.elapsed().as_secs());
        }

        info!(
            tunnel_id = %self.tunnel_id,
            subdomains = ?removed,
            drained,
            duration_secs = self.started.elapsed().as_secs(),
            "Tunnel released"
        );
        true
    }

    /// Tear the tunnel down. Later calls are no-ops.
    pub async fn close(&self) {
        if !self.release_in_memory() {
            return;
        }
        close_records(self.store.clone(), self.record_ids.clone()).await;
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        if !self.release_in_memory() {
            return;
        }
        let records = std::mem::take(&mut self.record_ids);
        if records.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(close_records(self.store.clone(), records));
            }
            Err(_) => debug!(tunnel_id = %self.tunnel_id, "No runtime; tunnel records left open"),
        }
    }
}

async fn close_records(store: Arc<dyn Store>, record_ids: Vec<String>) {
    let now = Utc::now();
    for id in record_ids {
        if let Err(e) = store.close_tunnel_record(&id, now).await {
            warn!(record_id = %id, error = %e, "Failed to close tunnel record");
        }
    }
}
