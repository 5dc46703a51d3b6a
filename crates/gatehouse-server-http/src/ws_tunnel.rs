//! WebSocket tunnels
//!
//! One connection, one subdomain. The client's first message must be a
//! `register` envelope; after the `registered` reply, forwarded requests
//! go out as `request` envelopes and come back as `response` envelopes
//! matched by id.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use gatehouse_control::{
    Credential, PendingRequests, Routed, TransportError, TunnelAdmission, TunnelTransport,
};
use gatehouse_proto::{
    Envelope, ForwardRequest, RegisterRequest, RegisterResponse, TransportKind, MSG_PING,
    MSG_PONG, MSG_REGISTER, MSG_REGISTERED, MSG_REQUEST, MSG_RESPONSE,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::host::ClientIp;
use crate::GatewayState;

/// Outbound queue depth per tunnel
const OUTBOUND_QUEUE: usize = 256;

/// Live WebSocket tunnel as seen by the registry and the forwarder
pub struct WsTunnel {
    id: String,
    outbound: mpsc::Sender<Envelope>,
    pending: PendingRequests,
    shutdown: Notify,
}

impl WsTunnel {
    pub fn new(outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            id: format!("ws-{}", Uuid::new_v4()),
            outbound,
            pending: PendingRequests::new(),
            shutdown: Notify::new(),
        }
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Route an inbound `response` payload to its waiter
    fn on_response(&self, envelope: Envelope) {
        match self.pending.route_payload(envelope.payload) {
            Routed::Delivered => {}
            Routed::Unknown => debug!(tunnel_id = %self.id, "Response for unknown request"),
            Routed::Unroutable => warn!(tunnel_id = %self.id, "Response without a request id"),
        }
    }
}

#[async_trait]
impl TunnelTransport for WsTunnel {
    fn tunnel_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send_request(&self, request: ForwardRequest) -> Result<(), TransportError> {
        let envelope = Envelope::new(MSG_REQUEST, &request)?;
        self.send(envelope).await
    }

    fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    fn close(&self) {
        self.shutdown.notify_one();
    }
}

pub async fn tunnel_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    ClientIp(client_ip): ClientIp,
) -> impl IntoResponse {
    let admission = state.admission.clone();
    let heartbeat = state.config.heartbeat_interval;
    let handshake_timeout = state.config.handshake_timeout;
    ws.on_upgrade(move |socket| {
        serve_ws_tunnel(socket, client_ip, admission, heartbeat, handshake_timeout)
    })
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_envelope(sink: &mut WsSink, envelope: &Envelope) -> bool {
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
            return false;
        }
    };
    sink.send(Message::Text(text.into())).await.is_ok()
}

async fn reply_registered(sink: &mut WsSink, response: &RegisterResponse) -> bool {
    match Envelope::new(MSG_REGISTERED, response) {
        Ok(envelope) => send_envelope(sink, &envelope).await,
        Err(e) => {
            warn!(error = %e, "Failed to encode registration reply");
            false
        }
    }
}

async fn reject(mut sink: WsSink, subdomain: &str, reason: String) {
    reply_registered(&mut sink, &RegisterResponse::rejected(subdomain, reason)).await;
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Wait for the `register` envelope. Anything else ends the connection.
async fn read_registration(
    source: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Result<RegisterRequest, String> {
    loop {
        let message = match source.next().await {
            None => return Err("connection closed".to_string()),
            Some(Err(e)) => return Err(format!("read failed: {}", e)),
            Some(Ok(message)) => message,
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err("connection closed".to_string()),
            Message::Binary(_) => return Err("expected a text register message".to_string()),
        };
        let envelope = Envelope::decode(text.as_str()).map_err(|e| format!("Malformed message: {}", e))?;
        if envelope.kind != MSG_REGISTER {
            return Err(format!("expected {}, got {}", MSG_REGISTER, envelope.kind));
        }
        return envelope
            .payload_as::<RegisterRequest>()
            .map_err(|e| format!("Malformed register payload: {}", e));
    }
}

/// Run one WebSocket tunnel: registration, admission, then the message
/// loop until the client leaves or stops answering pings.
pub async fn serve_ws_tunnel(
    socket: WebSocket,
    client_ip: IpAddr,
    admission: Arc<TunnelAdmission>,
    heartbeat: Duration,
    handshake_timeout: Duration,
) {
    let (mut sink, mut source) = socket.split();

    let request = match timeout(handshake_timeout, read_registration(&mut source)).await {
        Err(_) => {
            warn!(%client_ip, "No registration received");
            reject(sink, "", "registration timed out".to_string()).await;
            return;
        }
        Ok(Err(reason)) => {
            debug!(%client_ip, reason = %reason, "Registration failed");
            reject(sink, "", reason).await;
            return;
        }
        Ok(Ok(request)) => request,
    };

    let subdomain = request.subdomain.clone();
    let credential = Credential::from_parts(request.token, request.secret);
    let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    let tunnel = Arc::new(WsTunnel::new(tx));

    let lease = match admission
        .admit(
            credential.as_ref(),
            client_ip,
            std::slice::from_ref(&subdomain),
            tunnel.clone(),
        )
        .await
    {
        Ok(lease) => lease,
        Err(e) => {
            warn!(%client_ip, subdomain = %subdomain, kind = e.kind().as_str(), error = %e, "WebSocket tunnel rejected");
            reject(sink, &subdomain, e.to_string()).await;
            return;
        }
    };

    let url = admission.public_url(&subdomain);
    if !reply_registered(&mut sink, &RegisterResponse::accepted(&subdomain, &url)).await {
        lease.close().await;
        return;
    }
    info!(tunnel_id = %lease.tunnel_id(), %client_ip, subdomain = %subdomain, url = %url, "WebSocket tunnel established");

    let writer_tunnel = tunnel.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if !send_envelope(&mut sink, &envelope).await {
                debug!(tunnel_id = %writer_tunnel.tunnel_id(), "WebSocket write failed");
                writer_tunnel.close();
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            next = source.next() => match next {
                None | Some(Ok(Message::Close(_))) => break "client disconnected",
                Some(Err(e)) => {
                    debug!(tunnel_id = %lease.tunnel_id(), error = %e, "WebSocket read failed");
                    break "read error";
                }
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    let envelope = match Envelope::decode(text.as_str()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(tunnel_id = %lease.tunnel_id(), error = %e, "Malformed envelope");
                            break "protocol error";
                        }
                    };
                    match envelope.kind.as_str() {
                        MSG_RESPONSE => tunnel.on_response(envelope),
                        MSG_PING => {
                            if tunnel.send(Envelope::pong()).await.is_err() {
                                break "writer closed";
                            }
                        }
                        MSG_PONG => trace!(tunnel_id = %lease.tunnel_id(), "Pong"),
                        other => debug!(tunnel_id = %lease.tunnel_id(), kind = %other, "Ignoring message"),
                    }
                }
                Some(Ok(_)) => last_seen = Instant::now(),
            },
            _ = ticker.tick() => {
                if last_seen.elapsed() > heartbeat * 3 {
                    break "heartbeat timeout";
                }
                if tunnel.send(Envelope::ping()).await.is_err() {
                    break "writer closed";
                }
            }
            _ = tunnel.shutdown.notified() => break "closed by gateway",
        }
    };

    info!(tunnel_id = %lease.tunnel_id(), subdomain = %subdomain, reason, "WebSocket tunnel ended");
    lease.close().await;
    writer.abort();
}
