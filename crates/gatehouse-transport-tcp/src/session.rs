//! Multiplexed tunnel sessions
//!
//! A session is one TLS connection carrying many logical streams. Stream 0
//! carries the `AuthRequest`/`AuthResponse` handshake and then heartbeats.
//! Every forwarded request gets a fresh even-numbered stream: the request
//! JSON goes out as a single FIN-terminated data frame and the response is
//! accumulated until the client's FIN. A RST fails the exchange.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use gatehouse_control::{
    AdmissionError, Credential, PendingRequests, TransportError, TunnelAdmission, TunnelTransport,
};
use gatehouse_proto::{
    AuthRequest, AuthResponse, ControlMessage, ForwardRequest, Frame, FrameCodec, FrameType,
    ProtoError, StreamAllocator, StreamId, TransportKind, TunnelInfo, CONTROL_STREAM_ID,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

/// Largest response body accumulated for one stream
const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a client has to send its `AuthRequest`
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    /// Drop the session when nothing arrives for this long
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Registration rejected: {0}")]
    Rejected(#[from] AdmissionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),
}

struct InFlight {
    request_id: String,
    body: BytesMut,
}

/// The registry handle for a TCP session
pub struct TcpTunnel {
    id: String,
    outbound: mpsc::Sender<Frame>,
    pending: PendingRequests,
    streams: StreamAllocator,
    in_flight: Mutex<HashMap<StreamId, InFlight>>,
    shutdown: Notify,
}

impl TcpTunnel {
    fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: format!("tcp-{}", uuid::Uuid::new_v4()),
            outbound,
            pending: PendingRequests::new(),
            streams: StreamAllocator::new(),
            in_flight: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        }
    }

    pub fn open_streams(&self) -> usize {
        self.streams.open_streams()
    }

    fn take_stream(&self, stream_id: StreamId) -> Option<InFlight> {
        let entry = self.in_flight.lock().remove(&stream_id);
        if entry.is_some() {
            self.streams.release(stream_id);
        }
        entry
    }

    fn complete_stream(&self, stream_id: StreamId) {
        let Some(entry) = self.take_stream(stream_id) else {
            return;
        };
        match serde_json::from_slice::<serde_json::Value>(&entry.body) {
            Ok(payload) => {
                self.pending.route_payload(payload);
            }
            Err(e) => {
                warn!(tunnel_id = %self.id, stream_id, request_id = %entry.request_id, error = %e, "Unreadable response on stream");
                self.pending.malformed(&entry.request_id, e.to_string());
            }
        }
    }

    fn fail_stream(&self, stream_id: StreamId, reason: &str) {
        if let Some(entry) = self.take_stream(stream_id) {
            debug!(tunnel_id = %self.id, stream_id, request_id = %entry.request_id, reason, "Stream failed");
            self.pending.fail(&entry.request_id, reason);
        }
    }

    /// Handle a frame on a data stream
    fn on_stream_frame(&self, frame: Frame) {
        let stream_id = frame.stream_id;
        match frame.frame_type {
            FrameType::Data => {
                let overflow = {
                    let mut in_flight = self.in_flight.lock();
                    let Some(entry) = in_flight.get_mut(&stream_id) else {
                        trace!(tunnel_id = %self.id, stream_id, "Data for unknown stream");
                        return;
                    };
                    entry.body.extend_from_slice(&frame.payload);
                    entry.body.len() > MAX_RESPONSE_BYTES
                };
                if overflow {
                    self.fail_stream(stream_id, "response too large");
                    let _ = self.outbound.try_send(Frame::reset(stream_id));
                } else if frame.flags.has_rst() {
                    self.fail_stream(stream_id, "stream reset by client");
                } else if frame.flags.has_fin() {
                    self.complete_stream(stream_id);
                }
            }
            FrameType::Close => {
                if frame.flags.has_rst() {
                    self.fail_stream(stream_id, "stream reset by client");
                } else {
                    let has_body = self
                        .in_flight
                        .lock()
                        .get(&stream_id)
                        .is_some_and(|e| !e.body.is_empty());
                    if has_body {
                        self.complete_stream(stream_id);
                    } else {
                        self.fail_stream(stream_id, "stream closed without response");
                    }
                }
            }
            FrameType::Control => {
                trace!(tunnel_id = %self.id, stream_id, frame_type = ?frame.frame_type, "Ignoring frame");
            }
        }
    }

    /// Reset streams whose forwarder has already given up
    fn reap_abandoned(&self) -> usize {
        let abandoned: Vec<StreamId> = self
            .in_flight
            .lock()
            .iter()
            .filter(|(_, e)| !self.pending.contains(&e.request_id))
            .map(|(id, _)| *id)
            .collect();
        for stream_id in &abandoned {
            self.take_stream(*stream_id);
            let _ = self.outbound.try_send(Frame::reset(*stream_id));
        }
        if !abandoned.is_empty() {
            debug!(tunnel_id = %self.id, count = abandoned.len(), "Reset abandoned streams");
        }
        abandoned.len()
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message).map_err(ProtoError::from)?;
        self.outbound
            .send(Frame::control(Bytes::from(payload)))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl TunnelTransport for TcpTunnel {
    fn tunnel_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn send_request(&self, request: ForwardRequest) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(&request).map_err(ProtoError::from)?;
        let stream_id = self
            .streams
            .allocate()
            .ok_or(TransportError::StreamsExhausted)?;
        self.in_flight.lock().insert(
            stream_id,
            InFlight {
                request_id: request.id.clone(),
                body: BytesMut::new(),
            },
        );

        trace!(tunnel_id = %self.id, stream_id, request_id = %request.id, "Opening stream");
        if self
            .outbound
            .send(Frame::message(stream_id, Bytes::from(payload)))
            .await
            .is_err()
        {
            self.take_stream(stream_id);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    fn close(&self) {
        self.shutdown.notify_one();
    }
}

type FrameSink<S> = SplitSink<Framed<S, FrameCodec>, Frame>;

async fn send_auth_response<S>(sink: &mut FrameSink<S>, response: &AuthResponse) -> Result<(), ProtoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(response)?;
    sink.send(Frame::control(Bytes::from(payload))).await
}

async fn reject<S>(sink: &mut FrameSink<S>, reason: String) -> SessionError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = send_auth_response(sink, &AuthResponse::rejected(reason.clone())).await {
        debug!(error = %e, "Failed to send handshake rejection");
    }
    let _ = sink.close().await;
    SessionError::Handshake(reason)
}

/// Run one session to completion: handshake, admission, then the frame
/// loop until the client leaves or the heartbeat lapses.
pub async fn serve_session<S>(
    io: S,
    client_ip: IpAddr,
    admission: Arc<TunnelAdmission>,
    config: SessionConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut source) = Framed::new(io, FrameCodec::new()).split();

    let frame = match timeout(config.handshake_timeout, source.next()).await {
        Err(_) => {
            warn!(%client_ip, "No handshake received");
            return Err(SessionError::HandshakeTimeout);
        }
        Ok(None) => return Err(SessionError::Handshake("connection closed".to_string())),
        Ok(Some(Err(e))) => return Err(SessionError::Protocol(e)),
        Ok(Some(Ok(frame))) => frame,
    };

    if frame.stream_id != CONTROL_STREAM_ID {
        return Err(reject(&mut sink, format!("expected handshake on stream 0, got {}", frame.stream_id)).await);
    }
    let request: AuthRequest = match serde_json::from_slice(&frame.payload) {
        Ok(request) => request,
        Err(e) => return Err(reject(&mut sink, format!("Malformed handshake: {}", e)).await),
    };

    let (tx, mut rx) = mpsc::channel::<Frame>(256);
    let tunnel = Arc::new(TcpTunnel::new(tx));
    let subdomains: Vec<String> = request.forwards.iter().map(|f| f.subdomain.clone()).collect();
    let credential = (!request.token.trim().is_empty()).then(|| Credential::classify(request.token.clone()));

    let lease = match admission
        .admit(credential.as_ref(), client_ip, &subdomains, tunnel.clone())
        .await
    {
        Ok(lease) => lease,
        Err(e) => {
            warn!(%client_ip, subdomains = ?subdomains, kind = e.kind().as_str(), error = %e, "TCP tunnel rejected");
            let _ = send_auth_response(&mut sink, &AuthResponse::rejected(e.to_string())).await;
            let _ = sink.close().await;
            return Err(SessionError::Rejected(e));
        }
    };

    let tunnels = request
        .forwards
        .iter()
        .map(|f| TunnelInfo {
            subdomain: f.subdomain.clone(),
            url: admission.public_url(&f.subdomain),
            local_port: f.local_port,
        })
        .collect();
    if let Err(e) = send_auth_response(&mut sink, &AuthResponse::accepted(tunnels)).await {
        lease.close().await;
        return Err(SessionError::Protocol(e));
    }
    info!(tunnel_id = %lease.tunnel_id(), %client_ip, subdomains = ?lease.subdomains(), "TCP session established");

    // Writer task: everything after the handshake goes through the channel
    let writer_tunnel = tunnel.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!(tunnel_id = %writer_tunnel.tunnel_id(), error = %e, "Session write failed");
                writer_tunnel.close();
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut heartbeat = interval(config.ping_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            next = source.next() => match next {
                None => break "client disconnected",
                Some(Err(e)) => {
                    warn!(tunnel_id = %lease.tunnel_id(), error = %e, "Protocol error on session");
                    break "protocol error";
                }
                Some(Ok(frame)) => {
                    last_seen = Instant::now();
                    if frame.stream_id == CONTROL_STREAM_ID {
                        match serde_json::from_slice::<ControlMessage>(&frame.payload) {
                            Ok(ControlMessage::Ping) => {
                                if tunnel.send_control(&ControlMessage::Pong).await.is_err() {
                                    break "writer closed";
                                }
                            }
                            Ok(ControlMessage::Pong) => trace!(tunnel_id = %lease.tunnel_id(), "Pong"),
                            Err(e) => debug!(tunnel_id = %lease.tunnel_id(), error = %e, "Unknown control message"),
                        }
                    } else {
                        tunnel.on_stream_frame(frame);
                    }
                }
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > config.idle_timeout {
                    break "heartbeat timeout";
                }
                tunnel.reap_abandoned();
                if tunnel.send_control(&ControlMessage::Ping).await.is_err() {
                    break "writer closed";
                }
            }
            _ = tunnel.shutdown.notified() => break "closed by gateway",
        }
    };

    info!(tunnel_id = %lease.tunnel_id(), reason, "TCP session ended");
    lease.close().await;
    writer.abort();
    Ok(())
}
