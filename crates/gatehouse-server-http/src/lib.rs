//! Public HTTP gateway
//!
//! Requests for `<subdomain>.<domain>` are authorized against the
//! subdomain's effective policy, checked against the owning organization's
//! quota, then forwarded through whichever tunnel holds the subdomain.
//! Paths under `/_gatehouse` are served here: the WebSocket tunnel endpoint,
//! the Basic login form, the OIDC redirect pair and logout.

pub mod error;
pub mod host;
pub mod login;
pub mod proxy;
pub mod ws_tunnel;

pub use error::GatewayError;
pub use ws_tunnel::WsTunnel;

use axum::{routing::get, Router};
use gatehouse_control::{RequestForwarder, TunnelAdmission, TunnelRegistry};
use gatehouse_http_auth::paths::{
    LOGIN_PATH, LOGOUT_PATH, OIDC_CALLBACK_PATH, OIDC_LOGIN_PATH, TUNNEL_PATH,
};
use gatehouse_http_auth::{AuthDispatcher, OidcExchange, PolicyMutations, PolicyResolver};
use gatehouse_usage::QuotaChecker;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Largest request body accepted for forwarding
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Mark session cookies `Secure`
    pub secure_cookies: bool,
    /// Take the client address from `X-Forwarded-For`
    pub trust_forwarded_for: bool,
    /// WebSocket ping interval; a tunnel silent for three intervals is dropped
    pub heartbeat_interval: Duration,
    /// Time allowed between WebSocket upgrade and the `register` message
    pub handshake_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            secure_cookies: true,
            trust_forwarded_for: false,
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Everything the handlers share
pub struct GatewayState {
    pub admission: Arc<TunnelAdmission>,
    pub resolver: Arc<PolicyResolver>,
    /// Policy and application writes; shares `resolver` and the dispatcher's
    /// rate limits so changes apply to the next request
    pub mutations: Arc<PolicyMutations>,
    pub dispatcher: Arc<AuthDispatcher>,
    pub quota: Arc<QuotaChecker>,
    pub forwarder: RequestForwarder,
    pub oidc: Option<Arc<dyn OidcExchange>>,
    pub config: GatewayConfig,
}

impl GatewayState {
    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        self.admission.registry()
    }

    /// Public domain tunnels are served under
    pub fn domain(&self) -> &str {
        &self.admission.config().domain
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(TUNNEL_PATH, get(ws_tunnel::tunnel_handler))
        .route(LOGIN_PATH, get(login::login_form).post(login::login_submit))
        .route(LOGOUT_PATH, get(login::logout))
        .route(OIDC_LOGIN_PATH, get(login::oidc_login))
        .route(OIDC_CALLBACK_PATH, get(login::oidc_callback))
        .fallback(proxy::proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway on an already-bound listener until the future is dropped
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> Result<(), GatewayError> {
    let addr = listener.local_addr()?;
    info!("HTTP gateway listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
