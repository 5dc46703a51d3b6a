//! Subdomain registry spanning every tunnel transport
//!
//! WebSocket tunnels and multiplexed TCP sessions keep separate maps, but
//! both sit behind one lock so that claiming a name is a single
//! check-and-insert across transports. A TCP session claiming several names
//! gets all of them or none.

use chrono::{DateTime, Utc};
use gatehouse_proto::{validate_subdomain, SubdomainError, TransportKind};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Invalid subdomain '{subdomain}': {source}")]
    InvalidSubdomain {
        subdomain: String,
        #[source]
        source: SubdomainError,
    },

    #[error("Subdomain already in use: {0}")]
    AlreadyInUse(String),

    #[error("Subdomain requested twice: {0}")]
    DuplicateInRequest(String),

    #[error("No subdomains requested")]
    NoSubdomains,
}

/// Who a tunnel belongs to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelOwner {
    pub account_id: Option<String>,
    pub org_id: Option<String>,
}

/// One subdomain requested by a tunnel, with the application it resolved to
#[derive(Debug, Clone, PartialEq)]
pub struct RouteClaim {
    pub subdomain: String,
    pub app_id: Option<String>,
}

impl RouteClaim {
    pub fn new(subdomain: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            app_id: None,
        }
    }

    pub fn with_app(mut self, app_id: Option<String>) -> Self {
        self.app_id = app_id;
        self
    }
}

/// A registered subdomain and the connection handle that serves it
#[derive(Debug, Clone)]
pub struct TunnelRoute<H> {
    pub tunnel_id: String,
    pub subdomain: String,
    pub transport: TransportKind,
    pub owner: TunnelOwner,
    pub app_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub handle: H,
}

/// Handle-free view of a route, for enumeration
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSummary {
    pub tunnel_id: String,
    pub subdomain: String,
    pub transport: TransportKind,
    pub account_id: Option<String>,
    pub org_id: Option<String>,
    pub app_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<H> From<&TunnelRoute<H>> for TunnelSummary {
    fn from(route: &TunnelRoute<H>) -> Self {
        Self {
            tunnel_id: route.tunnel_id.clone(),
            subdomain: route.subdomain.clone(),
            transport: route.transport,
            account_id: route.owner.account_id.clone(),
            org_id: route.owner.org_id.clone(),
            app_id: route.app_id.clone(),
            created_at: route.created_at,
        }
    }
}

struct Maps<H> {
    websocket: HashMap<String, TunnelRoute<H>>,
    tcp: HashMap<String, TunnelRoute<H>>,
}

impl<H> Maps<H> {
    fn get(&self, subdomain: &str) -> Option<&TunnelRoute<H>> {
        self.websocket
            .get(subdomain)
            .or_else(|| self.tcp.get(subdomain))
    }

    fn for_transport(&mut self, transport: TransportKind) -> &mut HashMap<String, TunnelRoute<H>> {
        match transport {
            TransportKind::WebSocket => &mut self.websocket,
            TransportKind::Tcp => &mut self.tcp,
        }
    }

    fn all(&self) -> impl Iterator<Item = &TunnelRoute<H>> {
        self.websocket.values().chain(self.tcp.values())
    }
}

pub struct SubdomainRegistry<H> {
    maps: RwLock<Maps<H>>,
}

impl<H: Clone> SubdomainRegistry<H> {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                websocket: HashMap::new(),
                tcp: HashMap::new(),
            }),
        }
    }

    /// Claim every subdomain in `claims` for one tunnel, or none of them.
    pub fn claim(
        &self,
        tunnel_id: &str,
        transport: TransportKind,
        owner: &TunnelOwner,
        claims: &[RouteClaim],
        handle: H,
    ) -> Result<(), RegistryError> {
        if claims.is_empty() {
            return Err(RegistryError::NoSubdomains);
        }

        let mut seen = HashSet::with_capacity(claims.len());
        for claim in claims {
            validate_subdomain(&claim.subdomain).map_err(|source| {
                RegistryError::InvalidSubdomain {
                    subdomain: claim.subdomain.clone(),
                    source,
                }
            })?;
            if !seen.insert(claim.subdomain.as_str()) {
                return Err(RegistryError::DuplicateInRequest(claim.subdomain.clone()));
            }
        }

        let mut maps = self.maps.write();
        if let Some(taken) = claims.iter().find(|c| maps.get(&c.subdomain).is_some()) {
            debug!(subdomain = %taken.subdomain, tunnel_id = %tunnel_id, "Subdomain already claimed");
            return Err(RegistryError::AlreadyInUse(taken.subdomain.clone()));
        }

        let now = Utc::now();
        let target = maps.for_transport(transport);
        for claim in claims {
            target.insert(
                claim.subdomain.clone(),
                TunnelRoute {
                    tunnel_id: tunnel_id.to_string(),
                    subdomain: claim.subdomain.clone(),
                    transport,
                    owner: owner.clone(),
                    app_id: claim.app_id.clone(),
                    created_at: now,
                    handle: handle.clone(),
                },
            );
            trace!(subdomain = %claim.subdomain, tunnel_id = %tunnel_id, %transport, "Subdomain registered");
        }
        Ok(())
    }

    pub fn lookup(&self, subdomain: &str) -> Option<TunnelRoute<H>> {
        self.maps.read().get(subdomain).cloned()
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.maps.read().get(subdomain).is_some()
    }

    /// Remove every subdomain owned by `tunnel_id`. Names since re-claimed by
    /// another tunnel are left alone.
    pub fn release(&self, tunnel_id: &str) -> Vec<String> {
        let mut guard = self.maps.write();
        let maps = &mut *guard;
        let mut removed = Vec::new();
        for map in [&mut maps.websocket, &mut maps.tcp] {
            map.retain(|subdomain, route| {
                if route.tunnel_id == tunnel_id {
                    removed.push(subdomain.clone());
                    false
                } else {
                    true
                }
            });
        }
        if !removed.is_empty() {
            debug!(tunnel_id = %tunnel_id, subdomains = ?removed, "Released subdomains");
        }
        removed
    }

    pub fn list(&self) -> Vec<TunnelSummary> {
        self.collect(|_| true)
    }

    pub fn list_by_org(&self, org_id: &str) -> Vec<TunnelSummary> {
        self.collect(|r| r.owner.org_id.as_deref() == Some(org_id))
    }

    pub fn list_by_app(&self, app_id: &str) -> Vec<TunnelSummary> {
        self.collect(|r| r.app_id.as_deref() == Some(app_id))
    }

    fn collect(&self, filter: impl Fn(&TunnelRoute<H>) -> bool) -> Vec<TunnelSummary> {
        let maps = self.maps.read();
        let mut out: Vec<TunnelSummary> = maps
            .all()
            .filter(|r| filter(r))
            .map(TunnelSummary::from)
            .collect();
        out.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        out
    }

    pub fn len(&self) -> usize {
        let maps = self.maps.read();
        maps.websocket.len() + maps.tcp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Clone> Default for SubdomainRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
