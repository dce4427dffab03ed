//! Boundary helpers for the transport front-ends.
//!
//! The pieces the out-of-crate transport needs from the core when it acts
//! on a policy: forging an HTTP answer that moves the client elsewhere,
//! redialing TLS without validation (optionally under a fronting SNI),
//! and picking the local IPv6 address used for crafted segments.

use std::io;
use std::net::Ipv6Addr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::inspect::find_host;

/// Proxy-boundary errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid server name: {0}")]
    InvalidName(String),
}

/// Certificate verifier that accepts anything. The intermediary redials
/// servers whose certificates it has no basis to validate.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client config shared by every non-validating TLS dial in the crate.
pub fn insecure_tls_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = Arc::new(ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// The path of the request line: everything between the 4-byte method
/// token and the next space.
fn request_path(payload: &[u8]) -> Option<&[u8]> {
    let start = 4;
    if start >= payload.len() {
        return None;
    }
    let end = payload[start..].iter().position(|&b| b == b' ')? + start;
    Some(&payload[start..end])
}

/// Answer a client's HTTP request with a forged response.
///
/// - empty `host`: a bare `200 OK`
/// - `"https"`: `302 Found` to the same path under `https://<Host>`
/// - anything else: `302 Found` to `<host><path>`
///
/// Returns `Ok(false)` without writing when the request cannot be parsed.
pub async fn http_move<W>(conn: &mut W, host: &str, payload: &[u8]) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let mut data = Vec::with_capacity(1460);
    if host.is_empty() {
        data.extend_from_slice(b"HTTP/1.1 200 OK");
    } else if host == "https" {
        let Some((offset, length)) = find_host(payload) else {
            return Ok(false);
        };
        let Some(path) = request_path(payload) else {
            return Ok(false);
        };
        data.extend_from_slice(b"HTTP/1.1 302 Found\r\nLocation: https://");
        data.extend_from_slice(&payload[offset..offset + length]);
        data.extend_from_slice(path);
    } else {
        let Some(path) = request_path(payload) else {
            return Ok(false);
        };
        data.extend_from_slice(b"HTTP/1.1 302 Found\r\nLocation: ");
        data.extend_from_slice(host.as_bytes());
        data.extend_from_slice(path);
    }
    data.extend_from_slice(
        b"\r\nCache-Control: private\r\nServer: pinocchio\r\nContent-Length: 0\r\n\r\n",
    );
    conn.write_all(&data).await?;
    Ok(true)
}

/// Open a non-validating TLS connection to `host:443`. A non-empty
/// `fronting` name replaces `host` in the ClientHello SNI.
pub async fn dial_strip(host: &str, fronting: &str) -> Result<TlsStream<TcpStream>, ProxyError> {
    let config = insecure_tls_config().map_err(|e| ProxyError::Tls(e.to_string()))?;
    let sni = if fronting.is_empty() { host } else { fronting };
    let server_name =
        ServerName::try_from(sni.to_string()).map_err(|e| ProxyError::InvalidName(e.to_string()))?;

    let tcp = TcpStream::connect((host, 443)).await?;
    tcp.set_nodelay(true).ok();
    let connector = TlsConnector::from(config);
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    Ok(stream)
}

/// The local address crafted IPv6 segments should claim: the first
/// interface address carrying a /128 netmask that is neither loopback
/// nor a mapped IPv4 address.
#[cfg(unix)]
pub fn local_ipv6() -> Option<Ipv6Addr> {
    let mut ifaddrs_ptr: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifaddrs_ptr) } != 0 {
        return None;
    }

    let mut found = None;
    let mut current = ifaddrs_ptr;
    while !current.is_null() {
        let ifa = unsafe { &*current };
        if !ifa.ifa_addr.is_null()
            && !ifa.ifa_netmask.is_null()
            && unsafe { (*ifa.ifa_addr).sa_family } as i32 == libc::AF_INET6
        {
            let addr = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
            let mask = unsafe { &*(ifa.ifa_netmask as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let prefix: u32 = mask.sin6_addr.s6_addr.iter().map(|b| b.count_ones()).sum();
            if prefix == 128 && ip != Ipv6Addr::LOCALHOST && ip.to_ipv4_mapped().is_none() {
                found = Some(ip);
                break;
            }
        }
        current = ifa.ifa_next;
    }

    unsafe { libc::freeifaddrs(ifaddrs_ptr) };
    found
}

#[cfg(not(unix))]
pub fn local_ipv6() -> Option<Ipv6Addr> {
    None
}
