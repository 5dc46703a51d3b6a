//! Public request path: route, authorize, meter, forward

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use gatehouse_control::ForwardError;
use gatehouse_http_auth::paths::is_internal;
use gatehouse_http_auth::{
    session_cookie, AuthContext, AuthIdentity, AuthOutcome, DenyReason, EffectivePolicy,
    IncomingRequest,
};
use gatehouse_proto::{ForwardResponse, WireHeaders};
use gatehouse_usage::QuotaDecision;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::host::{header_pairs, request_subdomain, ClientIp};
use crate::{GatewayError, GatewayState};

/// Headers that describe one hop and are never copied across the tunnel
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

pub async fn proxy_handler(
    State(state): State<Arc<GatewayState>>,
    ClientIp(client_ip): ClientIp,
    request: Request,
) -> Response<Body> {
    match proxy(&state, client_ip, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn proxy(
    state: &GatewayState,
    client_ip: IpAddr,
    request: Request,
) -> Result<Response<Body>, GatewayError> {
    let subdomain =
        request_subdomain(request.headers(), state.domain()).ok_or(GatewayError::TunnelNotFound)?;
    if is_internal(request.uri().path()) {
        return Err(GatewayError::NotFound);
    }
    let route = state.registry().lookup(&subdomain).ok_or_else(|| {
        debug!(subdomain = %subdomain, "No tunnel for subdomain");
        GatewayError::TunnelNotFound
    })?;

    let method = request.method().as_str().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let pairs = header_pairs(request.headers());

    let (ctx, policy) = match state.resolver.resolve(&subdomain).await {
        Ok(resolved) => resolved,
        Err(e) if state.dispatcher.is_strict() => {
            warn!(subdomain = %subdomain, error = %e, "Denying request: policy unavailable");
            return Err(GatewayError::AuthUnavailable);
        }
        Err(e) => {
            warn!(subdomain = %subdomain, error = %e, "Policy unavailable, allowing (permissive mode)");
            (
                AuthContext::ephemeral(subdomain.clone()),
                Arc::new(EffectivePolicy::none()),
            )
        }
    };

    let incoming = IncomingRequest::new(&method, &path, &pairs, client_ip);
    let identity = match state.dispatcher.authenticate(&incoming, &policy, &ctx).await {
        AuthOutcome::Authenticated(identity) => identity,
        denied => return Ok(outcome_response(denied)),
    };
    debug!(subdomain = %subdomain, identity = %identity.identity, method = identity.method, "Request authorized");

    let org_id = route.owner.org_id.clone();
    let quota = match &org_id {
        Some(org_id) => match state.quota.can_process_request(org_id).await {
            Ok(decision) if !decision.allowed => {
                return Ok(quota_exceeded(&decision));
            }
            Ok(decision) => Some(decision),
            Err(e) => {
                warn!(subdomain = %subdomain, org_id = %org_id, error = %e, "Quota check failed");
                None
            }
        },
        None => None,
    };

    let headers = wire_headers(request.headers(), client_ip);
    let body = to_bytes(request.into_body(), state.config.max_body_bytes)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge)?;
    let request_bytes = body.len();

    let forwarded = state
        .forwarder
        .forward(route.handle.as_ref(), &method, &path, headers, body.to_vec())
        .await;

    if let Some(org_id) = &org_id {
        if let Some(bytes) = metered_bytes(request_bytes, &forwarded) {
            let usage = state.quota.usage();
            usage.record_request(org_id);
            usage.record_bandwidth(org_id, bytes);
        }
    }

    let response = forwarded.map_err(|e| {
        warn!(
            subdomain = %subdomain,
            tunnel_id = %route.tunnel_id,
            kind = e.kind().as_str(),
            error = %e,
            "Forwarding failed"
        );
        GatewayError::Forward(e)
    })?;

    Ok(build_response(
        response,
        quota.as_ref(),
        &identity,
        state.config.secure_cookies,
    ))
}

/// Bytes to bill for one exchange. A request that reached the tunnel is
/// billed even when no response came back; one that never left is not.
fn metered_bytes(
    request_bytes: usize,
    forwarded: &Result<ForwardResponse, ForwardError>,
) -> Option<u64> {
    match forwarded {
        Ok(response) => Some((request_bytes + response.body.len()) as u64),
        Err(e) if e.request_sent() => Some(request_bytes as u64),
        Err(_) => None,
    }
}

/// Request headers as sent to the tunnel client, with the client address
/// appended to `X-Forwarded-For`
fn wire_headers(headers: &HeaderMap, client_ip: IpAddr) -> WireHeaders {
    let mut wire = WireHeaders::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            wire.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    let chain = match wire.remove("x-forwarded-for") {
        Some(existing) => format!("{}, {}", existing.join(", "), client_ip),
        None => client_ip.to_string(),
    };
    wire.insert("x-forwarded-for".to_string(), vec![chain]);
    wire
}

fn build_response(
    forwarded: ForwardResponse,
    quota: Option<&QuotaDecision>,
    identity: &AuthIdentity,
    secure_cookies: bool,
) -> Response<Body> {
    let status = StatusCode::from_u16(forwarded.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(forwarded.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &forwarded.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "Dropping invalid response header name");
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }

    if let Some(decision) = quota {
        append_quota_headers(headers, decision);
    }
    if let Some(session) = &identity.new_session {
        let cookie = session_cookie(session, secure_cookies).to_string();
        if let Ok(cookie) = HeaderValue::from_str(&cookie) {
            headers.append(header::SET_COOKIE, cookie);
        }
    }
    response
}

fn append_quota_headers(headers: &mut HeaderMap, decision: &QuotaDecision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

fn quota_exceeded(decision: &QuotaDecision) -> Response<Body> {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        format!("Quota exceeded: {}", decision.dimension.as_str()),
    )
        .into_response();
    append_quota_headers(response.headers_mut(), decision);
    response
}

/// Response for every outcome other than `Authenticated`
pub(crate) fn outcome_response(outcome: AuthOutcome) -> Response<Body> {
    match outcome {
        AuthOutcome::Authenticated(_) => StatusCode::NO_CONTENT.into_response(),
        AuthOutcome::Redirect(location) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        AuthOutcome::Challenge(challenge) => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, challenge)],
            "Authentication required",
        )
            .into_response(),
        AuthOutcome::Failure(_) => (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response(),
        AuthOutcome::Denied(DenyReason::RateLimited { retry_after }) => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string())],
            "Too many failed attempts",
        )
            .into_response(),
        AuthOutcome::Denied(DenyReason::Misconfigured(_)) => {
            GatewayError::Forbidden.into_response()
        }
        AuthOutcome::Denied(DenyReason::Unavailable) => {
            GatewayError::AuthUnavailable.into_response()
        }
    }
}
