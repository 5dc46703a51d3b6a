//! TCP+TLS tunnel transport
//!
//! Clients open one TLS connection, authenticate on stream 0 with an
//! `AuthRequest` naming every subdomain they want, and then serve
//! forwarded requests on server-opened streams.

pub mod proxy_protocol;
pub mod server;
pub mod session;
pub mod tls;

pub use server::{BoundTcpServer, TcpServerConfig, TcpTunnelServer};
pub use session::{serve_session, SessionConfig, SessionError, TcpTunnel};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TcpServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("PROXY protocol error: {0}")]
    ProxyProtocol(String),

    #[error("Session error: {0}")]
    Session(String),
}
