//! # Pinocchio
//!
//! The core of a censorship-circumvention TCP/TLS intermediary. It watches
//! the first payload of an outbound connection, names the destination, and
//! decides how the transport layer should misbehave on its behalf.
//!
//! ## Features
//!
//! - **Domain policy engine**: hostname/suffix/IP/CIDR rules mapping to a
//!   bitmask of evasion options plus TTL/MSS/upstream/interface parameters
//! - **Payload inspectors** for HTTP `Host:` headers and TLS ClientHello SNI
//! - **Lying DNS resolver**: fabricates A/AAAA answers that point clients at
//!   a sentinel address carrying an index into the Nose table
//! - **Upstream DNS client** over UDP, TCP and (non-validating) TLS, with
//!   EDNS Client Subnet and a DNS64-style prefix rewrite
//! - **PAC export** of the policy table as a JavaScript auto-config script
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │             Transport layer (out of crate)          │
//! │   (segment forger, port forwarders, front-ends)     │
//! ├─────────────────────────────────────────────────────┤
//! │          inspect: Host / SNI extraction             │
//! ├─────────────────────────────────────────────────────┤
//! │    config: policy table, option flags, loaders      │
//! ├─────────────────────────────────────────────────────┤
//! │   dns: caches, Nose, wire codec, upstream client    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! All shared state lives in a [`World`], created once at startup and handed
//! to every component; there are no process-wide statics.

pub mod config;
pub mod dns;
pub mod inspect;
pub mod pac;
pub mod proxy;
pub mod world;

pub use config::{Config, PortForwarder};
pub use dns::DomainIp;
pub use world::World;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] dns::upstream::ResolveError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),
}
