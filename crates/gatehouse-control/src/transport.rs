//! The seam between the forwarder and a live tunnel connection

use async_trait::async_trait;
use gatehouse_proto::{ForwardRequest, TransportKind};
use gatehouse_router::SubdomainRegistry;
use std::sync::Arc;

use crate::{PendingRequests, TransportError};

/// A live tunnel that can carry forwarded requests.
///
/// Implementations write the request and later route the response into
/// [`TunnelTransport::pending`]; they never wait for it themselves.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    fn tunnel_id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Write one request to the client
    async fn send_request(&self, request: ForwardRequest) -> Result<(), TransportError>;

    /// Correlation table for this tunnel's in-flight requests
    fn pending(&self) -> &PendingRequests;

    /// Ask the connection to shut down; teardown follows from its read loop
    fn close(&self);
}

/// Handle stored in the registry for every live tunnel
pub type TunnelHandle = Arc<dyn TunnelTransport>;

/// The registry as used by the gateway
pub type TunnelRegistry = SubdomainRegistry<TunnelHandle>;
