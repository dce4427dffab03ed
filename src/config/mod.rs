//! Domain policy engine.
//!
//! A policy ([`Config`]) attaches a bitmask of evasion options and a few
//! transport parameters to a hostname, a dotted parent suffix, a literal
//! address, or a CIDR block. Lookups try the exact name first, then walk
//! parent suffixes (keeping the leading dot) up to the configured depth,
//! and finally fall back to the process-wide default policy.

mod loader;

pub use loader::PortForwarder;

use thiserror::Error;

use crate::world::World;

/// No evasion.
pub const OPT_NONE: u32 = 0;
/// Emit decoy segments with a low IP TTL.
pub const OPT_TTL: u32 = 1 << 0;
/// Advertise a reduced MSS.
pub const OPT_MSS: u32 = 1 << 1;
/// Fake segments carrying a wrong MD5 option.
pub const OPT_WMD5: u32 = 1 << 2;
/// Fake segments with the ACK flag cleared.
pub const OPT_NACK: u32 = 1 << 3;
/// Fake segments with a wrong ACK number.
pub const OPT_WACK: u32 = 1 << 4;
/// Fake segments with a wrong checksum.
pub const OPT_WCSUM: u32 = 1 << 5;
/// Fake segments with a wrong sequence number.
pub const OPT_WSEQ: u32 = 1 << 6;
/// Fake segments with a wrong timestamp.
pub const OPT_WTIME: u32 = 1 << 7;

/// TCP Fast Open.
pub const OPT_TFO: u32 = 1 << 8;
/// Half TCP Fast Open.
pub const OPT_HTFO: u32 = 1 << 9;
/// Keep-alive probes during the handshake.
pub const OPT_KEEPALIVE: u32 = 1 << 10;
/// Duplicate SYN.
pub const OPT_SYNX2: u32 = 1 << 11;

/// Plain-HTTP handling hint.
pub const OPT_HTTP: u32 = 1 << 16;
/// HTTPS address-binding hint.
pub const OPT_HTTPS: u32 = 1 << 17;
/// Answer plain HTTP with a synthetic redirect.
pub const OPT_MOVE: u32 = 1 << 18;
/// Strip TLS by redialing without validation.
pub const OPT_STRIP: u32 = 1 << 19;
/// Force IPv4 resolution.
pub const OPT_IPV4: u32 = 1 << 20;
/// Force IPv6 resolution.
pub const OPT_IPV6: u32 = 1 << 21;
/// Alternate segmentation mode.
pub const OPT_MODE2: u32 = 1 << 22;
/// Set Don't Fragment.
pub const OPT_DF: u32 = 1 << 23;
/// Satellite-latency pacing.
pub const OPT_SAT: u32 = 1 << 24;
/// Randomized segment sizes.
pub const OPT_RAND: u32 = 1 << 25;
/// Split the first segment.
pub const OPT_SSEG: u32 = 1 << 26;
/// Send the payload as one segment.
pub const OPT_1SEG: u32 = 1 << 27;

/// Route via an external proxy.
pub const OPT_PROXY: u32 = 1 << 31;

/// Options that emit fake segments.
pub const OPT_FAKE: u32 =
    OPT_TTL | OPT_WMD5 | OPT_NACK | OPT_WACK | OPT_WCSUM | OPT_WSEQ | OPT_WTIME;

/// Options that modify the client's own segments.
pub const OPT_MODIFY: u32 = OPT_FAKE | OPT_SSEG | OPT_TFO | OPT_HTFO | OPT_MODE2;

/// Map a `method=` name onto its option bit.
pub fn method_option(name: &str) -> Option<u32> {
    match name {
        "none" => Some(OPT_NONE),
        "ttl" => Some(OPT_TTL),
        "mss" => Some(OPT_MSS),
        "w-md5" => Some(OPT_WMD5),
        "n-ack" => Some(OPT_NACK),
        "w-ack" => Some(OPT_WACK),
        "w-csum" => Some(OPT_WCSUM),
        "w-seq" => Some(OPT_WSEQ),
        "w-time" => Some(OPT_WTIME),
        "tfo" => Some(OPT_TFO),
        "half-tfo" => Some(OPT_HTFO),
        "keep-alive" => Some(OPT_KEEPALIVE),
        "synx2" => Some(OPT_SYNX2),
        "http" => Some(OPT_HTTP),
        "https" => Some(OPT_HTTPS),
        "move" => Some(OPT_MOVE),
        "strip" => Some(OPT_STRIP),
        "ipv4" => Some(OPT_IPV4),
        "ipv6" => Some(OPT_IPV6),
        "mode2" => Some(OPT_MODE2),
        "df" => Some(OPT_DF),
        "sat" => Some(OPT_SAT),
        "rand" => Some(OPT_RAND),
        "s-seg" => Some(OPT_SSEG),
        "1-seg" => Some(OPT_1SEG),
        "proxy" => Some(OPT_PROXY),
        _ => None,
    }
}

/// Policy attached to a matched host or address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Evasion option bitmask (`OPT_*`).
    pub option: u32,
    /// IP TTL floor for crafted segments.
    pub ttl: u8,
    /// IP TTL ceiling for crafted segments.
    pub max_ttl: u8,
    /// TCP MSS hint.
    pub mss: u16,
    /// Upstream DNS descriptor for names under this policy.
    pub server: String,
    /// Outbound interface; empty means the default route.
    pub device: String,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid {key} value {value:?}")]
    BadValue { key: &'static str, value: String },
}

/// Parent suffixes of `name`, leading dot included, most specific first.
/// Yields at most `depth` entries: `"a.b.co.uk"` → `".b.co.uk"`, `".co.uk"`.
pub(crate) fn parent_suffixes(name: &str, depth: usize) -> impl Iterator<Item = &str> + '_ {
    let mut offset = 0usize;
    let mut remaining = depth;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        remaining -= 1;
        let off = name[offset..].find('.')?;
        offset += off;
        let suffix = &name[offset..];
        offset += 1;
        Some(suffix)
    })
}

impl World {
    /// Resolve the policy for `name`.
    ///
    /// Exact match wins over any suffix; a more specific suffix wins over a
    /// less specific one; the default policy is a last resort and only
    /// applies when its option mask is nonzero. Performs at most
    /// `subdomain_depth + 1` table probes.
    pub fn config_lookup(&self, name: &str) -> Option<Config> {
        {
            let domains = self.domains.read();
            if let Some(config) = domains.get(name) {
                return Some(config.clone());
            }
            for suffix in parent_suffixes(name, self.subdomain_depth()) {
                if let Some(config) = domains.get(suffix) {
                    return Some(config.clone());
                }
            }
        }

        let default = self.default_config.read();
        if default.option != 0 {
            return Some(default.clone());
        }
        None
    }
}
