//! First-payload inspection.
//!
//! Extracts the destination hostname, and where it sits, from the first
//! buffer a client sends: the `Host:` header of a plain HTTP request or
//! the SNI extension of a TLS ClientHello. Both walkers are allocation
//! free, never copy payload, and answer `None` the moment a length field
//! disagrees with the bytes actually present.

mod http;
mod tls;

pub use http::find_host;
pub use tls::find_sni;
