//! Request forwarding
//!
//! One call per public request: allocate an id, register it, write the
//! request, then wait for the response. A single deadline covers both the
//! write and the wait, so a client that stops draining its queue still
//! yields a 504. The pending entry is owned by a guard so it is removed even
//! when the caller's future is dropped halfway.

use gatehouse_proto::{ForwardRequest, ForwardResponse, WireHeaders};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pending_requests::Delivery;
use crate::{ForwardError, PendingRequests, TransportError, TunnelTransport};

/// How long a forwarded request may wait for its response
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(300);

/// Removes the pending entry on every exit path
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
    }
}

#[derive(Debug, Clone)]
pub struct RequestForwarder {
    timeout: Duration,
}

impl Default for RequestForwarder {
    fn default() -> Self {
        Self::new(DEFAULT_FORWARD_TIMEOUT)
    }
}

impl RequestForwarder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn forward(
        &self,
        tunnel: &dyn TunnelTransport,
        method: &str,
        path: &str,
        headers: WireHeaders,
        body: Vec<u8>,
    ) -> Result<ForwardResponse, ForwardError> {
        let deadline = Instant::now() + self.timeout;
        let id = Uuid::new_v4().to_string();
        let pending = tunnel.pending();
        let rx = pending
            .register(&id)
            .ok_or(ForwardError::SendFailed(TransportError::Closed))?;
        let _guard = PendingGuard {
            pending,
            id: &id,
        };

        let request = ForwardRequest {
            id: id.clone(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        };

        match timeout_at(deadline, tunnel.send_request(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(tunnel_id = %tunnel.tunnel_id(), request_id = %id, error = %e, "Failed to write request to tunnel");
                return Err(ForwardError::SendFailed(e));
            }
            Err(_) => {
                warn!(tunnel_id = %tunnel.tunnel_id(), request_id = %id, timeout_secs = self.timeout.as_secs(), "Tunnel did not accept the request before the deadline");
                return Err(ForwardError::SendTimeout);
            }
        }
        debug!(tunnel_id = %tunnel.tunnel_id(), request_id = %id, %method, %path, "Request forwarded");

        match timeout_at(deadline, rx).await {
            Ok(Ok(Delivery::Response(response))) => Ok(response),
            Ok(Ok(Delivery::Malformed(reason))) => Err(ForwardError::Malformed(reason)),
            Ok(Ok(Delivery::Failed(reason))) => Err(ForwardError::StreamReset(reason)),
            Ok(Err(_)) => {
                debug!(tunnel_id = %tunnel.tunnel_id(), request_id = %id, "Tunnel closed with request in flight");
                Err(ForwardError::TunnelClosed)
            }
            Err(_) => {
                warn!(tunnel_id = %tunnel.tunnel_id(), request_id = %id, timeout_secs = self.timeout.as_secs(), "Forwarded request timed out");
                Err(ForwardError::Timeout)
            }
        }
    }
}
