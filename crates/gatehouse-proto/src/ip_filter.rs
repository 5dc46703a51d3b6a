//! Source-address whitelisting for tunnel registration
//!
//! Accounts and organizations may restrict which addresses can open tunnels.
//! Entries are single addresses ("203.0.113.7") or CIDR ranges ("10.0.0.0/8").

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Parsed whitelist. An empty filter allows everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpFilter {
    networks: Vec<IpNetwork>,
}

#[derive(Debug, Clone, PartialEq)]
struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    fn parse(entry: &str) -> Result<Self, IpFilterError> {
        let entry = entry.trim();
        let (ip_part, prefix_part) = match entry.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (entry, None),
        };

        let addr = IpAddr::from_str(ip_part)
            .map_err(|_| IpFilterError::InvalidIpAddress(entry.to_string()))?;
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };

        let prefix_len = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|len| *len <= max_prefix)
                .ok_or_else(|| IpFilterError::InvalidCidr(entry.to_string()))?,
            None => max_prefix,
        };

        Ok(Self { addr, prefix_len })
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        if self.prefix_len == 0 {
            return self.addr.is_ipv4() == ip.is_ipv4();
        }

        match (self.addr, normalize(ip)) {
            (IpAddr::V4(net), IpAddr::V4(candidate)) => {
                let mask = !0u32 << (32 - self.prefix_len);
                (u32::from(net) & mask) == (u32::from(candidate) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(candidate)) => {
                let mask = !0u128 << (128 - self.prefix_len);
                (u128::from(net) & mask) == (u128::from(candidate) & mask)
            }
            _ => false,
        }
    }
}

/// Treat IPv4-mapped IPv6 peers (dual-stack listeners) as plain IPv4
fn normalize(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(*v6)),
        v4 => *v4,
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IpFilterError {
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),
}

impl IpFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from whitelist entries; blank entries are skipped.
    pub fn from_allowlist<I, S>(entries: I) -> Result<Self, IpFilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let networks = entries
            .into_iter()
            .filter(|e| !e.as_ref().trim().is_empty())
            .map(|e| IpNetwork::parse(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { networks })
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        self.networks.is_empty() || self.networks.iter().any(|n| n.contains(ip))
    }

    pub fn is_socket_allowed(&self, addr: &SocketAddr) -> bool {
        self.is_allowed(&addr.ip())
    }
}
