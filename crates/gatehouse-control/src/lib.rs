//! Tunnel control plane
//!
//! Transport-independent pieces shared by the WebSocket and TCP tunnel
//! endpoints: admission of new tunnels, the per-tunnel correlation table,
//! and the forwarder that turns a public request into a tunnel exchange.

pub mod admission;
pub mod error;
pub mod forwarder;
pub mod pending_requests;
pub mod transport;

pub use admission::{record_id, AdmissionConfig, Credential, Principal, TunnelAdmission, TunnelLease};
pub use error::{AdmissionError, ErrorKind, ForwardError, TransportError};
pub use forwarder::{RequestForwarder, DEFAULT_FORWARD_TIMEOUT};
pub use pending_requests::{Delivery, PendingRequests, Routed};
pub use transport::{TunnelHandle, TunnelRegistry, TunnelTransport};
