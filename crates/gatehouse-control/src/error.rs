//! Error taxonomy for the tunnel control plane

use gatehouse_proto::ProtoError;
use gatehouse_router::RegistryError;
use gatehouse_store::StoreError;
use gatehouse_usage::UsageDimension;
use std::net::IpAddr;
use thiserror::Error;

/// Coarse classification shared by every gateway error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad credentials; terminal for the attempt
    AuthenticationFailure,
    /// Quota, whitelist or ownership refusal; terminal
    AuthorizationDenied,
    /// Malformed frame or message; terminal for the connection
    ProtocolError,
    /// I/O failure or timeout; terminal for the request only
    TransportError,
    /// Storage or policy unavailable
    ConfigurationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::AuthorizationDenied => "authorization_denied",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ConfigurationError => "configuration_error",
        }
    }
}

/// Why a tunnel registration was refused
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Connections from {0} are not allowed")]
    IpNotAllowed(IpAddr),

    #[error("Subdomain is reserved by another organization: {0}")]
    SubdomainReserved(String),

    #[error("API key is not valid for subdomain: {0}")]
    KeyScope(String),

    #[error("Quota exceeded: {}", .0.as_str())]
    QuotaExceeded(UsageDimension),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AdmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdmissionError::MissingCredentials
            | AdmissionError::InvalidCredentials(_)
            | AdmissionError::AccountDisabled => ErrorKind::AuthenticationFailure,
            AdmissionError::IpNotAllowed(_)
            | AdmissionError::SubdomainReserved(_)
            | AdmissionError::KeyScope(_)
            | AdmissionError::QuotaExceeded(_)
            | AdmissionError::Registry(RegistryError::AlreadyInUse(_)) => {
                ErrorKind::AuthorizationDenied
            }
            AdmissionError::Registry(_) => ErrorKind::ProtocolError,
            AdmissionError::Store(_) | AdmissionError::Config(_) => ErrorKind::ConfigurationError,
        }
    }
}

/// Failure writing to a tunnel
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Tunnel is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("Stream limit reached")]
    StreamsExhausted,
}

/// Why a forwarded request produced no response
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Failed to send request to tunnel: {0}")]
    SendFailed(#[from] TransportError),

    #[error("Tunnel did not accept the request in time")]
    SendTimeout,

    #[error("Tunnel did not respond in time")]
    Timeout,

    #[error("Malformed response from tunnel: {0}")]
    Malformed(String),

    #[error("Stream reset by tunnel: {0}")]
    StreamReset(String),
}

impl ForwardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForwardError::Malformed(_) => ErrorKind::ProtocolError,
            _ => ErrorKind::TransportError,
        }
    }

    /// HTTP status returned to the public client
    pub fn status_code(&self) -> u16 {
        match self {
            ForwardError::Timeout | ForwardError::SendTimeout => 504,
            _ => 502,
        }
    }

    /// Whether the request reached the tunnel before things went wrong
    pub fn request_sent(&self) -> bool {
        !matches!(self, ForwardError::SendFailed(_) | ForwardError::SendTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_kinds() {
        assert_eq!(
            AdmissionError::InvalidCredentials("x".into()).kind(),
            ErrorKind::AuthenticationFailure
        );
        assert_eq!(
            AdmissionError::Registry(RegistryError::AlreadyInUse("demo".into())).kind(),
            ErrorKind::AuthorizationDenied
        );
        assert_eq!(
            AdmissionError::Registry(RegistryError::NoSubdomains).kind(),
            ErrorKind::ProtocolError
        );
        assert_eq!(
            AdmissionError::QuotaExceeded(UsageDimension::ConcurrentTunnels).kind(),
            ErrorKind::AuthorizationDenied
        );
    }

    #[test]
    fn test_registry_message_passes_through() {
        let err = AdmissionError::from(RegistryError::AlreadyInUse("demo".into()));
        assert_eq!(err.to_string(), "Subdomain already in use: demo");
    }

    #[test]
    fn test_forward_status_codes() {
        assert_eq!(ForwardError::Timeout.status_code(), 504);
        assert_eq!(ForwardError::TunnelClosed.status_code(), 502);
        assert_eq!(ForwardError::Malformed("bad".into()).status_code(), 502);
        assert_eq!(ForwardError::Malformed("bad".into()).kind(), ErrorKind::ProtocolError);
        assert_eq!(ForwardError::Timeout.kind(), ErrorKind::TransportError);
        assert_eq!(ForwardError::SendTimeout.status_code(), 504);
    }

    #[test]
    fn test_request_sent() {
        assert!(!ForwardError::SendFailed(TransportError::Closed).request_sent());
        assert!(!ForwardError::SendTimeout.request_sent());
        assert!(ForwardError::Timeout.request_sent());
        assert!(ForwardError::TunnelClosed.request_sent());
        assert!(ForwardError::StreamReset("reset".into()).request_sent());
    }
}
