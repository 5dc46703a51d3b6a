//! Pending requests tracker
//!
//! Correlates requests sent through a tunnel with the responses that come
//! back. Every entry leaves the table exactly once: answered, cancelled (the
//! forwarder gave up) or drained when the tunnel closes. Draining drops the
//! senders, so every waiter wakes immediately.

use gatehouse_proto::{decode_forward_response, ForwardResponse};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a waiting forwarder receives
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Response(ForwardResponse),
    /// The client answered with something that could not be decoded
    Malformed(String),
    /// The client reset the exchange
    Failed(String),
}

/// Outcome of routing an inbound response payload
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Delivered,
    /// No waiter for this id (already answered, timed out, or never sent)
    Unknown,
    /// No readable id; nothing to route
    Unroutable,
}

#[derive(Default)]
struct State {
    waiters: HashMap<String, oneshot::Sender<Delivery>>,
    closed: bool,
}

/// Tracks requests awaiting responses on one tunnel
#[derive(Clone, Default)]
pub struct PendingRequests {
    state: Arc<Mutex<State>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id. `None` once the tunnel is closed, or if the
    /// id is already waiting.
    pub fn register(&self, id: &str) -> Option<oneshot::Receiver<Delivery>> {
        let mut state = self.state.lock();
        if state.closed || state.waiters.contains_key(id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id.to_string(), tx);
        debug!(request_id = %id, "Registered pending request");
        Some(rx)
    }

    fn deliver(&self, id: &str, delivery: Delivery) -> bool {
        let Some(tx) = self.state.lock().waiters.remove(id) else {
            debug!(request_id = %id, "No pending request, dropping response");
            return false;
        };
        if tx.send(delivery).is_err() {
            debug!(request_id = %id, "Waiter already gone");
            return false;
        }
        true
    }

    pub fn complete(&self, response: ForwardResponse) -> bool {
        let id = response.id.clone();
        self.deliver(&id, Delivery::Response(response))
    }

    pub fn malformed(&self, id: &str, reason: impl Into<String>) -> bool {
        self.deliver(id, Delivery::Malformed(reason.into()))
    }

    pub fn fail(&self, id: &str, reason: impl Into<String>) -> bool {
        self.deliver(id, Delivery::Failed(reason.into()))
    }

    /// Route a raw `response` payload from the client
    pub fn route_payload(&self, payload: Value) -> Routed {
        match decode_forward_response(payload) {
            Ok(response) => {
                if self.complete(response) {
                    Routed::Delivered
                } else {
                    Routed::Unknown
                }
            }
            Err(bad) => match bad.id {
                Some(id) => {
                    warn!(request_id = %id, reason = %bad.reason, "Malformed response from tunnel");
                    if self.malformed(&id, bad.reason) {
                        Routed::Delivered
                    } else {
                        Routed::Unknown
                    }
                }
                None => {
                    warn!(reason = %bad.reason, "Response without request id, dropping");
                    Routed::Unroutable
                }
            },
        }
    }

    /// Remove a request without answering it
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.state.lock().waiters.remove(id).is_some();
        if removed {
            debug!(request_id = %id, "Cancelled pending request");
        }
        removed
    }

    /// Refuse new requests and wake every waiter. Returns how many were
    /// drained.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.waiters.drain().collect()
        };
        let count = drained.len();
        drop(drained);
        if count > 0 {
            debug!(count, "Drained pending requests");
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().waiters.contains_key(id)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
