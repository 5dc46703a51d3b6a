//! Request facts derived from headers: target subdomain and client address

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

use crate::GatewayState;

/// The tunnel label of `host` under `domain`.
///
/// Only a single label directly below the domain is a tunnel:
/// `demo.tunnels.example` yields `demo`, `a.b.tunnels.example` yields nothing.
pub fn subdomain_for_host(host: &str, domain: &str) -> Option<String> {
    let host = strip_port(host).to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    let label = host.strip_suffix(&domain)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal; never a tunnel host but keep it intact
        return host;
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Subdomain addressed by a request's `Host` header
pub fn request_subdomain(headers: &HeaderMap, domain: &str) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    subdomain_for_host(host, domain)
}

/// Header list in the shape the auth pipeline reads; non-UTF-8 values are skipped
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// First address in `X-Forwarded-For`
pub fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Address of the public client, used for rate limiting and logs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientIp(pub IpAddr);

impl FromRequestParts<Arc<GatewayState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<GatewayState>,
    ) -> Result<Self, Self::Rejection> {
        if state.config.trust_forwarded_for {
            if let Some(ip) = forwarded_for(&parts.headers) {
                return Ok(ClientIp(ip));
            }
        }
        match parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => Ok(ClientIp(addr.ip())),
            None => {
                debug!("No peer address on request");
                Ok(ClientIp(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_subdomain_for_host() {
        assert_eq!(
            subdomain_for_host("demo.tunnels.test", "tunnels.test").as_deref(),
            Some("demo")
        );
        assert_eq!(
            subdomain_for_host("Demo.Tunnels.Test:8080", "tunnels.test").as_deref(),
            Some("demo")
        );
        assert_eq!(subdomain_for_host("tunnels.test", "tunnels.test"), None);
        assert_eq!(subdomain_for_host("a.b.tunnels.test", "tunnels.test"), None);
        assert_eq!(subdomain_for_host("demotunnels.test", "tunnels.test"), None);
        assert_eq!(subdomain_for_host("demo.other.test", "tunnels.test"), None);
        assert_eq!(subdomain_for_host("[::1]:80", "tunnels.test"), None);
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.2"),
        );
        assert_eq!(forwarded_for(&headers), Some("203.0.113.9".parse().unwrap()));

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(forwarded_for(&headers), None);
    }

    #[test]
    fn test_header_pairs_skips_binary_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ok", HeaderValue::from_static("yes"));
        headers.insert("x-bin", HeaderValue::from_bytes(&[0xFF, 0xFE]).unwrap());
        let pairs = header_pairs(&headers);
        assert_eq!(pairs, vec![("x-ok".to_string(), "yes".to_string())]);
    }
}
