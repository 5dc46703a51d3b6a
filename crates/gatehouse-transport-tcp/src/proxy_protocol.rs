//! PROXY protocol (v1 text, v2 binary) header parsing
//!
//! When the tunnel listener sits behind a TCP load balancer, the balancer
//! prepends a PROXY header carrying the real client address. The header
//! precedes the TLS handshake, so it is read straight off the socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;

/// v2 signature
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Longest legal v1 line, CRLF included
const V1_MAX_LEN: usize = 107;

/// Upper bound on the v2 address block we are willing to buffer
const V2_MAX_BODY: usize = 4096;

#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid PROXY header: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ProxyProtocolError {
    ProxyProtocolError::Invalid(msg.into())
}

/// Parse one v1 line without its trailing CRLF.
///
/// `PROXY UNKNOWN` yields `None`: the balancer could not tell us the source.
pub fn parse_v1(line: &str) -> Result<Option<SocketAddr>, ProxyProtocolError> {
    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(invalid("missing PROXY prefix"));
    }
    let family = parts.next().ok_or_else(|| invalid("missing protocol family"))?;
    if family == "UNKNOWN" {
        return Ok(None);
    }

    let fields: Vec<&str> = parts.collect();
    let [src, _dst, src_port, _dst_port] = fields.as_slice() else {
        return Err(invalid(format!("expected 4 address fields, got {}", fields.len())));
    };

    let ip: IpAddr = src
        .parse()
        .map_err(|_| invalid(format!("bad source address {}", src)))?;
    match (family, ip) {
        ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => {}
        _ => return Err(invalid(format!("address does not match family {}", family))),
    }
    let port: u16 = src_port
        .parse()
        .map_err(|_| invalid(format!("bad source port {}", src_port)))?;
    Ok(Some(SocketAddr::new(ip, port)))
}

/// Parse the v2 address block. `ver_cmd` and `family` are header bytes 13
/// and 14.
pub fn parse_v2(ver_cmd: u8, family: u8, body: &[u8]) -> Result<Option<SocketAddr>, ProxyProtocolError> {
    if ver_cmd >> 4 != 2 {
        return Err(invalid(format!("unsupported version {}", ver_cmd >> 4)));
    }
    match ver_cmd & 0x0F {
        // LOCAL: health checks from the balancer itself
        0x0 => return Ok(None),
        0x1 => {}
        cmd => return Err(invalid(format!("unsupported command {}", cmd))),
    }

    match family >> 4 {
        0x1 => {
            if body.len() < 12 {
                return Err(invalid("short IPv4 address block"));
            }
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[8], body[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        0x2 => {
            if body.len() < 36 {
                return Err(invalid("short IPv6 address block"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            let port = u16::from_be_bytes([body[32], body[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        // AF_UNSPEC / AF_UNIX carry nothing we can use
        _ => Ok(None),
    }
}

/// Consume a PROXY header (either version) from the start of `reader`
pub async fn read_header<R>(reader: &mut R) -> Result<Option<SocketAddr>, ProxyProtocolError>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read_u8().await?;
    match first {
        b'P' => {
            let mut line = vec![first];
            loop {
                let byte = reader.read_u8().await?;
                line.push(byte);
                if line.ends_with(b"\r\n") {
                    break;
                }
                if line.len() >= V1_MAX_LEN {
                    return Err(invalid("v1 header too long"));
                }
            }
            let text = std::str::from_utf8(&line[..line.len() - 2])
                .map_err(|_| invalid("v1 header is not ASCII"))?;
            parse_v1(text)
        }
        0x0D => {
            let mut header = [0u8; 16];
            header[0] = first;
            reader.read_exact(&mut header[1..]).await?;
            if header[..12] != V2_SIGNATURE {
                return Err(invalid("bad v2 signature"));
            }
            let len = u16::from_be_bytes([header[14], header[15]]) as usize;
            if len > V2_MAX_BODY {
                return Err(invalid(format!("v2 address block too large: {}", len)));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            parse_v2(header[12], header[13], &body)
        }
        other => Err(invalid(format!("unexpected first byte 0x{:02x}", other))),
    }
}

/// Read a PROXY header if the connection starts with one.
///
/// Peeks first so a direct TLS client (first byte 0x16) is passed through
/// untouched.
pub async fn accept_proxy_header(stream: &mut TcpStream) -> Result<Option<SocketAddr>, ProxyProtocolError> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 || !matches!(first[0], b'P' | 0x0D) {
        return Ok(None);
    }
    read_header(stream).await
}
