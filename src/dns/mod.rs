//! The lying resolver.
//!
//! Two entry points, both on [`World`]: [`World::ns_lookup`] answers
//! host-local queries with `(nose index, addresses)`, and
//! [`World::ns_request`] turns a wire-format request into a wire-format
//! response for the DNS front-end. Both consult the caches first, then
//! the suffix chain, then the policy table, and only then an upstream.
//!
//! A name under policy never receives its real addresses: the client is
//! handed a lie pointing at a sentinel address whose trailing bytes carry
//! the name's Nose index, which the transport layer later resolves back
//! through [`World::nose_name`].

pub mod upstream;
pub mod wire;

use std::net::IpAddr;

use tracing::{debug, info, warn};

use crate::config::{parent_suffixes, OPT_IPV6};
use crate::world::World;
use upstream::{ServerOptions, Upstream};
use wire::{QTYPE_A, QTYPE_AAAA};

/// Per-name DNS memo.
///
/// `index > 0` marks a name under policy; `index > 0` with no addresses
/// is the poisoned form, meaning "answer this name with a lie".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainIp {
    /// Position in the Nose table, 0 when the name is not under policy.
    pub index: usize,
    /// Known addresses of this name, one family per cache.
    pub addresses: Vec<IpAddr>,
}

/// Prepend `pd` to each address textually and reparse, dropping whatever
/// does not survive the trip.
fn rewrite_prefixed(pd: &str, ips: &[IpAddr]) -> Vec<IpAddr> {
    ips.iter()
        .filter_map(|ip| match format!("{pd}{ip}").parse() {
            Ok(rewritten) => Some(rewritten),
            Err(_) => {
                warn!(%ip, pd, "prefixed address did not parse");
                None
            }
        })
        .collect()
}

impl World {
    /// Cached memo for `(name, qtype)`, trying the exact name first and
    /// then up to `subdomain_depth` parent suffixes. A suffix hit is
    /// returned as-is, not copied down to the narrower name.
    fn lookup_cached(&self, name: &str, qtype: u16) -> Option<DomainIp> {
        if let Some(memo) = self.load_cache(name, qtype) {
            debug!(name, qtype, addresses = ?memo.addresses, "cached");
            return Some(memo);
        }
        for suffix in parent_suffixes(name, self.subdomain_depth()) {
            if let Some(memo) = self.load_cache(suffix, qtype) {
                debug!(name, suffix, qtype, addresses = ?memo.addresses, "cached");
                return Some(memo);
            }
        }
        None
    }

    /// Reserve a Nose index for `name` and poison its memos: the A cache
    /// gets the lie marker, the AAAA cache an empty record.
    fn poison(&self, name: &str) -> usize {
        let index = self.reserve_nose(name);
        self.store_cache(
            name,
            QTYPE_A,
            DomainIp {
                index,
                addresses: Vec::new(),
            },
        );
        self.store_cache(name, QTYPE_AAAA, DomainIp::default());
        index
    }

    /// Resolve `name` against an explicit upstream descriptor.
    ///
    /// Returns the name's Nose index and addresses. Every successful
    /// miss-path resolution reserves a fresh index; callers reach this
    /// for names the policy already marked.
    pub async fn ns_lookup(&self, name: &str, qtype: u16, server: &str) -> (usize, Vec<IpAddr>) {
        if qtype != QTYPE_A && qtype != QTYPE_AAAA {
            return (0, Vec::new());
        }

        if let Some(memo) = self.lookup_cached(name, qtype) {
            return (memo.index, memo.addresses);
        }

        let mut options = ServerOptions::default();
        let mut response = Vec::new();

        if let Some(up) = Upstream::parse(server) {
            options = up.options.clone();
            let request = wire::pack_request(name, qtype, &options.ecs);
            let result = match up.scheme.as_str() {
                "udp:" => upstream::udp_lookup(&request, &up.address).await,
                "tcp:" => upstream::tcp_lookup(&request, &up.address).await,
                "tls:" => upstream::tls_lookup(&request, &up.address).await,
                _ => return (self.poison(name), Vec::new()),
            };
            match result {
                Ok(reply) => response = reply,
                Err(err) => {
                    warn!(%name, %err, "upstream lookup failed");
                    return (0, Vec::new());
                }
            }
        }

        let mut ips = wire::get_answers(&response);
        if !options.pd.is_empty() {
            ips = rewrite_prefixed(&options.pd, &ips);
        }
        debug!(%name, qtype, ?ips, "resolved");

        let index = self.reserve_nose(name);
        self.store_cache(
            name,
            qtype,
            DomainIp {
                index,
                addresses: ips.clone(),
            },
        );
        (index, ips)
    }

    /// Answer a wire-format request from the DNS front-end.
    ///
    /// `None` means the request was malformed or the upstream failed;
    /// the front-end drops the query either way.
    pub async fn ns_request(&self, request: &[u8]) -> Option<Vec<u8>> {
        let (name, qtype, _) = match wire::get_qname(request) {
            Some(question) if !question.0.is_empty() => question,
            _ => {
                info!("malformed dns question");
                return None;
            }
        };

        if qtype != QTYPE_A && qtype != QTYPE_AAAA {
            return Some(wire::build_response(request, &[], qtype));
        }

        if let Some(memo) = self.lookup_cached(&name, qtype) {
            return Some(if memo.index > 0 {
                wire::build_lie(request, memo.index, qtype)
            } else {
                wire::build_response(request, &memo.addresses, qtype)
            });
        }

        let config = self.config_lookup(&name);
        let (method, server) = match &config {
            Some(config) => {
                info!(%name, server = %config.server, "resolving under policy");
                (config.option, config.server.clone())
            }
            None => {
                let server = self.upstream_descriptor();
                info!(%name, %server, "resolving");
                (0, server)
            }
        };

        let up = Upstream::parse(&server);
        let options = up
            .as_ref()
            .map(|up| up.options.clone())
            .unwrap_or_default();

        // single-family domains declared by the upstream descriptor
        if (options.typ == "A" && qtype == QTYPE_AAAA)
            || (options.typ == "AAAA" && qtype == QTYPE_A)
        {
            return Some(wire::build_response(request, &[], qtype));
        }

        let mut ips: Vec<IpAddr> = Vec::new();
        let mut forwarded: Option<Vec<u8>> = None;

        if let Some(up) = up {
            if method != 0 {
                if qtype == QTYPE_AAAA && method & OPT_IPV6 == 0 {
                    return Some(wire::build_response(request, &[], qtype));
                }
                let upstream_qtype = if method & OPT_IPV6 != 0 {
                    QTYPE_AAAA
                } else {
                    qtype
                };
                let query = wire::pack_request(&name, upstream_qtype, &options.ecs);
                let result = match up.scheme.as_str() {
                    "udp:" => upstream::udp_lookup(&query, &up.address).await,
                    "tcp:" => upstream::tcp_lookup(&query, &up.address).await,
                    "tls:" => upstream::tls_lookup(&query, &up.address).await,
                    _ => {
                        // no way to ask anyone; lie right away
                        let index = self.poison(&name);
                        return Some(wire::build_lie(request, index, qtype));
                    }
                };
                match result {
                    Ok(reply) => ips = wire::get_answers(&reply),
                    Err(err) => {
                        warn!(%name, %err, "upstream lookup failed");
                        return None;
                    }
                }
            } else {
                // no policy: hand the client's own request bytes upstream
                let result = match up.scheme.as_str() {
                    "udp:" => upstream::udp_lookup(request, &up.address).await,
                    "tcp:" => upstream::tcp_lookup(request, &up.address).await,
                    "tls:" => upstream::tls_lookup(request, &up.address).await,
                    _ => return None,
                };
                match result {
                    Ok(reply) => {
                        ips = wire::get_answers(&reply);
                        forwarded = Some(reply);
                    }
                    Err(err) => {
                        warn!(%name, %err, "upstream lookup failed");
                        return None;
                    }
                }
            }
        }

        if !options.pd.is_empty() {
            ips = rewrite_prefixed(&options.pd, &ips);
        }
        debug!(%name, qtype, ?ips, "resolved");

        if method != 0 {
            let index = self.reserve_nose(&name);
            self.store_cache(
                &name,
                QTYPE_A,
                DomainIp {
                    index,
                    addresses: ips,
                },
            );
            self.store_cache(&name, QTYPE_AAAA, DomainIp::default());
            return Some(wire::build_lie(request, index, qtype));
        }

        if !options.pd.is_empty() {
            self.store_cache(
                &name,
                qtype,
                DomainIp {
                    index: 0,
                    addresses: ips.clone(),
                },
            );
            return Some(wire::build_response(request, &ips, qtype));
        }

        self.store_cache(
            &name,
            qtype,
            DomainIp {
                index: 0,
                addresses: ips,
            },
        );
        forwarded
    }
}
