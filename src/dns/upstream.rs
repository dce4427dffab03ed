//! Upstream DNS transports.
//!
//! Exchanges a wire-format query with an upstream resolver over UDP,
//! plain TCP, or TLS, selected by the scheme of the upstream descriptor
//! (`udp://host:port/ecs=…&pd=…&type=…`). Every socket operation is
//! bounded by a five second deadline. Replies are capped at 1024 bytes;
//! an overrun is a silent empty return, not an error.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::warn;

use super::wire::{QTYPE_A, QTYPE_AAAA};
use crate::proxy::insecure_tls_config;

/// Deadline for connect, read and write on upstream sockets.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply buffer size; larger replies are dropped.
const MAX_PACKET: usize = 1024;

/// Resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream timed out")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Options carried in the trailing segment of an upstream descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// EDNS client subnet address.
    pub ecs: String,
    /// Force a single address family: `"A"` or `"AAAA"`.
    pub typ: String,
    /// Prefix prepended to each returned address for cross-family
    /// synthesis.
    pub pd: String,
}

/// Parse a `k=v&k=v` options string; unknown keys are ignored.
pub fn parse_options(options: &str) -> ServerOptions {
    let mut parsed = ServerOptions::default();
    for option in options.split('&') {
        if let Some((key, value)) = option.split_once('=') {
            match key {
                "ecs" => parsed.ecs = value.to_string(),
                "pd" => parsed.pd = value.to_string(),
                "type" => parsed.typ = value.to_string(),
                _ => {}
            }
        }
    }
    parsed
}

/// A parsed upstream descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Transport scheme, colon included (`"udp:"`, `"tcp:"`, `"tls:"`).
    pub scheme: String,
    /// `host:port` of the resolver.
    pub address: String,
    pub options: ServerOptions,
}

impl Upstream {
    /// Split `scheme://host:port[/options]`. `None` when the descriptor
    /// has no authority part at all.
    pub fn parse(descriptor: &str) -> Option<Self> {
        let parts: Vec<&str> = descriptor.splitn(4, '/').collect();
        if parts.len() <= 2 {
            return None;
        }
        Some(Self {
            scheme: parts[0].to_string(),
            address: parts[2].to_string(),
            options: parts
                .get(3)
                .map(|tail| parse_options(tail))
                .unwrap_or_default(),
        })
    }
}

/// Single-datagram exchange.
///
/// When the request carries an additional-records section, replies
/// without one are discarded and the read repeated until the deadline.
pub async fn udp_lookup(request: &[u8], address: &str) -> Result<Vec<u8>, ResolveError> {
    let bind = match address.parse::<SocketAddr>() {
        Ok(addr) if addr.is_ipv6() => "[::]:0",
        _ => "0.0.0.0:0",
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(address).await?;
    socket.send(request).await?;

    let mut response = vec![0u8; MAX_PACKET];
    let wants_additional = request.get(11).copied().unwrap_or(0) != 0;
    let exchange = async {
        loop {
            let n = socket.recv(&mut response).await?;
            if !wants_additional || response.get(11).copied().unwrap_or(0) > 0 {
                return Ok::<usize, std::io::Error>(n);
            }
        }
    };
    let n = timeout(LOOKUP_TIMEOUT, exchange)
        .await
        .map_err(|_| ResolveError::Timeout)??;
    response.truncate(n);
    Ok(response)
}

/// Length-prefixed exchange over an established stream.
async fn stream_lookup<S>(mut stream: S, request: &[u8]) -> Result<Vec<u8>, ResolveError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = BytesMut::with_capacity(request.len() + 2);
    framed.put_u16(request.len() as u16);
    framed.put_slice(request);
    timeout(LOOKUP_TIMEOUT, stream.write_all(&framed))
        .await
        .map_err(|_| ResolveError::Timeout)??;

    let mut buf = vec![0u8; MAX_PACKET];
    let mut received = 0usize;
    let mut total = 0usize;
    loop {
        if received >= MAX_PACKET {
            // oversized reply, silently dropped
            return Ok(Vec::new());
        }
        let n = timeout(LOOKUP_TIMEOUT, stream.read(&mut buf[received..]))
            .await
            .map_err(|_| ResolveError::Timeout)??;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        received += n;
        if total == 0 && received >= 2 {
            total = u16::from_be_bytes([buf[0], buf[1]]) as usize + 2;
        }
        if total > 0 && received >= total {
            return Ok(buf[2..received].to_vec());
        }
    }
}

/// Exchange over plain TCP.
pub async fn tcp_lookup(request: &[u8], address: &str) -> Result<Vec<u8>, ResolveError> {
    let stream = timeout(LOOKUP_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| ResolveError::Timeout)??;
    stream_lookup(stream, request).await
}

/// Exchange over TLS. The session does not validate the peer.
pub async fn tls_lookup(request: &[u8], address: &str) -> Result<Vec<u8>, ResolveError> {
    let config = insecure_tls_config().map_err(|e| ResolveError::Tls(e.to_string()))?;
    let connector = TlsConnector::from(config);
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| ResolveError::Tls(e.to_string()))?;

    let tcp = timeout(LOOKUP_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| ResolveError::Timeout)??;
    let stream = timeout(LOOKUP_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ResolveError::Timeout)??;
    stream_lookup(stream, request).await
}

/// DNS64-style lookup: force the question to A over `tcp:`, then mirror
/// each A answer as an AAAA whose address is `prefix` + the four A
/// octets. `question_end` is the offset just past the question section.
pub async fn tcp_lookup_dns64(
    request: &[u8],
    address: &str,
    question_end: usize,
    prefix: &[u8],
) -> Result<Vec<u8>, ResolveError> {
    if question_end < 4 || question_end > request.len() {
        return Ok(Vec::new());
    }
    let mut request = request.to_vec();
    request[question_end - 4..question_end - 2].copy_from_slice(&QTYPE_A.to_be_bytes());
    let response = tcp_lookup(&request, address).await?;
    Ok(rewrite_dns64(&response, question_end, prefix))
}

/// Rewrite an A response into an AAAA response by prefixing each A RDATA.
/// Non-A records are copied verbatim. Malformed input yields empty.
pub(crate) fn rewrite_dns64(response: &[u8], question_end: usize, prefix: &[u8]) -> Vec<u8> {
    if prefix.len() < 12 || question_end < 4 || question_end > response.len() || response.len() < 8
    {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(response.len() + 16 * 8);
    out.extend_from_slice(&response[..question_end]);
    out[question_end - 4..question_end - 2].copy_from_slice(&QTYPE_AAAA.to_be_bytes());

    let count = u16::from_be_bytes([response[6], response[7]]) as usize;
    let mut offset = question_end;
    let mut tail = question_end;

    for _ in 0..count {
        loop {
            if offset >= response.len() {
                warn!(offset, "truncated answer name");
                return Vec::new();
            }
            let length = response[offset] as usize;
            offset += 1;
            if length == 0 {
                break;
            }
            if length < 63 {
                offset += length;
                if offset + 2 > response.len() {
                    warn!(offset, "truncated answer name");
                    return Vec::new();
                }
            } else {
                offset += 1;
                break;
            }
        }
        if offset + 2 > response.len() {
            return Vec::new();
        }
        out.extend_from_slice(&response[tail..offset]);
        tail = offset;

        let rtype = u16::from_be_bytes([response[offset], response[offset + 1]]);
        offset += 8;
        if offset + 2 > response.len() {
            return Vec::new();
        }
        let data_len = u16::from_be_bytes([response[offset], response[offset + 1]]) as usize;
        offset += 2;
        offset += data_len;
        if offset > response.len() {
            return Vec::new();
        }

        if rtype == QTYPE_A {
            out.extend_from_slice(&QTYPE_AAAA.to_be_bytes());
            tail += 2;
            out.extend_from_slice(&response[tail..tail + 6]); // class + ttl
            tail += 6;
            out.extend_from_slice(&((data_len as u16) + 12).to_be_bytes());
            tail += 2;
            out.extend_from_slice(&prefix[..12]);
            out.extend_from_slice(&response[tail..offset]);
            tail = offset;
        } else {
            out.extend_from_slice(&response[tail..offset]);
            tail = offset;
        }
    }

    out
}
