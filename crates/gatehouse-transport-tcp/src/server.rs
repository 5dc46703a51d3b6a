//! TLS listener for multiplexed tunnel sessions

use gatehouse_control::TunnelAdmission;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::proxy_protocol::accept_proxy_header;
use crate::session::{serve_session, SessionConfig};
use crate::tls::build_acceptor;
use crate::TcpServerError;

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub bind_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Expect a PROXY header from a load balancer in front of us
    pub proxy_protocol: bool,
    pub proxy_header_timeout: Duration,
    pub session: SessionConfig,
}

impl TcpServerConfig {
    pub fn new(bind_addr: SocketAddr, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            proxy_protocol: false,
            proxy_header_timeout: Duration::from_secs(5),
            session: SessionConfig::default(),
        }
    }
}

pub struct TcpTunnelServer {
    config: TcpServerConfig,
    admission: Arc<TunnelAdmission>,
}

impl TcpTunnelServer {
    pub fn new(config: TcpServerConfig, admission: Arc<TunnelAdmission>) -> Self {
        Self { config, admission }
    }

    /// Load the certificate and bind. Errors here are startup errors.
    pub async fn bind(self) -> Result<BoundTcpServer, TcpServerError> {
        info!("Loading TLS certificate from: {}", self.config.cert_path.display());
        let acceptor = build_acceptor(&self.config.cert_path, &self.config.key_path)?;

        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TcpServerError::Bind {
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(BoundTcpServer {
            listener,
            acceptor,
            config: self.config,
            admission: self.admission,
        })
    }
}

pub struct BoundTcpServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    config: TcpServerConfig,
    admission: Arc<TunnelAdmission>,
}

impl BoundTcpServer {
    pub fn local_addr(&self) -> Result<SocketAddr, TcpServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("TCP tunnel listener on {}", addr),
            Err(e) => warn!("TCP tunnel listener address unknown: {}", e),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let acceptor = self.acceptor.clone();
                    let admission = self.admission.clone();
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, peer_addr, acceptor, admission, config).await
                        {
                            debug!("TCP tunnel connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept tunnel connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    admission: Arc<TunnelAdmission>,
    config: TcpServerConfig,
) -> Result<(), TcpServerError> {
    let mut client_addr = peer_addr;
    if config.proxy_protocol {
        match timeout(config.proxy_header_timeout, accept_proxy_header(&mut stream)).await {
            Ok(Ok(Some(addr))) => {
                debug!(%peer_addr, client = %addr, "PROXY header accepted");
                client_addr = addr;
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return Err(TcpServerError::ProxyProtocol(e.to_string())),
            Err(_) => return Err(TcpServerError::ProxyProtocol("timed out".to_string())),
        }
    }

    let tls_stream = acceptor.accept(stream).await.map_err(|e| {
        warn!("TLS handshake failed from {}: {}", client_addr, e);
        TcpServerError::Tls(format!("Handshake failed: {}", e))
    })?;
    debug!("TLS handshake completed for {}", client_addr);

    serve_session(tls_stream, client_addr.ip(), admission, config.session)
        .await
        .map_err(|e| TcpServerError::Session(e.to_string()))
}
