//! Gatehouse wire protocol
//!
//! Defines the JSON envelope spoken by WebSocket tunnels, the handshake and
//! control messages of multiplexed TCP sessions, the binary frame format those
//! sessions use, and a few shared validation helpers.

pub mod codec;
pub mod ip_filter;
pub mod messages;
pub mod mux;
pub mod subdomain;

pub use codec::FrameCodec;
pub use ip_filter::{IpFilter, IpFilterError};
pub use messages::*;
pub use mux::{Frame, FrameFlags, FrameType, StreamAllocator, StreamId};
pub use subdomain::{validate_subdomain, SubdomainError};

use thiserror::Error;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Stream reserved for the auth handshake and heartbeats
pub const CONTROL_STREAM_ID: StreamId = 0;

/// Transport a tunnel is connected over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol errors. Any of these terminates the connection that produced it.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected message type: {0}")]
    UnexpectedMessage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
