//! Protocol message types
//!
//! WebSocket tunnels exchange JSON envelopes of the form
//! `{"type": "...", "payload": {...}}`. TCP sessions reuse the forward
//! request/response payloads on data streams and add a one-shot
//! `AuthRequest`/`AuthResponse` handshake on the control stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ProtoError;

/// Envelope type tags
pub const MSG_REGISTER: &str = "register";
pub const MSG_REGISTERED: &str = "registered";
pub const MSG_REQUEST: &str = "request";
pub const MSG_RESPONSE: &str = "response";
pub const MSG_PING: &str = "ping";
pub const MSG_PONG: &str = "pong";
pub const MSG_ERROR: &str = "error";

/// HTTP headers as carried on the wire (name -> values)
pub type WireHeaders = BTreeMap<String, Vec<String>>;

/// JSON envelope used on WebSocket tunnels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Result<Self, ProtoError> {
        Ok(Self {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn bare(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            payload: Value::Null,
        }
    }

    pub fn ping() -> Self {
        Self::bare(MSG_PING)
    }

    pub fn pong() -> Self {
        Self::bare(MSG_PONG)
    }

    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload into a concrete message type
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtoError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// First message on a WebSocket tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub subdomain: String,
    /// Account token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Reply to `RegisterRequest`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterResponse {
    pub success: bool,
    pub subdomain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegisterResponse {
    pub fn accepted(subdomain: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            success: true,
            subdomain: subdomain.into(),
            url: Some(url.into()),
            error: None,
        }
    }

    pub fn rejected(subdomain: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            subdomain: subdomain.into(),
            url: None,
            error: Some(error.into()),
        }
    }
}

/// HTTP request forwarded to a tunnel client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: WireHeaders,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// HTTP response relayed back by a tunnel client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardResponse {
    pub id: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: WireHeaders,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

/// A response payload that could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedResponse {
    /// Request ID, when it could still be read from the payload
    pub id: Option<String>,
    pub reason: String,
}

/// Decode a forwarded response, keeping the request ID when only the rest
/// of the payload is broken so the waiting caller can be failed promptly.
pub fn decode_forward_response(payload: Value) -> Result<ForwardResponse, MalformedResponse> {
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string);

    serde_json::from_value::<ForwardResponse>(payload).map_err(|e| MalformedResponse {
        id,
        reason: e.to_string(),
    })
}

/// Handshake sent by a TCP client on stream 0
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRequest {
    pub token: String,
    #[serde(default)]
    pub forwards: Vec<ForwardSpec>,
}

/// A subdomain the TCP client wants to expose, and the local port behind it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardSpec {
    pub subdomain: String,
    #[serde(rename = "localPort")]
    pub local_port: u16,
}

/// Handshake reply on stream 0
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub tunnels: Vec<TunnelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResponse {
    pub fn accepted(tunnels: Vec<TunnelInfo>) -> Self {
        Self {
            success: true,
            tunnels,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tunnels: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// A registered forward as reported back to the TCP client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelInfo {
    pub subdomain: String,
    pub url: String,
    #[serde(rename = "localPort")]
    pub local_port: u16,
}

/// Heartbeats on the TCP control stream after the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Ping,
    Pong,
}

/// Serde helper: bodies travel as base64 strings
mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) if !s.is_empty() => STANDARD.decode(s).map_err(serde::de::Error::custom),
            _ => Ok(Vec::new()),
        }
    }
}
