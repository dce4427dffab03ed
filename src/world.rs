//! Process-wide state handle.
//!
//! Everything the intermediary mutates at runtime hangs off a [`World`]:
//! the domain policy table, the default policy, the A/AAAA/HTTPS caches,
//! the Nose table, and the resolver globals. One `World` is created at
//! startup and shared (behind an `Arc`) by the DNS service, the config
//! loader and the front-ends; it is dropped at process exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{Config, PortForwarder};
use crate::dns::wire::{QTYPE_A, QTYPE_AAAA};
use crate::dns::DomainIp;

/// Nose element 0; never handed out as a real name.
pub const NOSE_SENTINEL: &str = "phantom.socks";

/// Default number of parent suffixes probed during lookups.
pub const DEFAULT_SUBDOMAIN_DEPTH: usize = 2;

/// Shared state of the intermediary.
pub struct World {
    pub(crate) domains: RwLock<HashMap<String, Config>>,
    pub(crate) default_config: RwLock<Config>,
    pub(crate) a_cache: RwLock<HashMap<String, DomainIp>>,
    pub(crate) aaaa_cache: RwLock<HashMap<String, DomainIp>>,
    pub(crate) https_cache: RwLock<HashMap<String, DomainIp>>,
    nose: Mutex<Vec<String>>,
    upstream: RwLock<String>,
    subdomain_depth: AtomicUsize,
    dns_min_ttl: AtomicU32,
    pub(crate) forwarder: RwLock<Option<Arc<dyn PortForwarder>>>,
}

impl World {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            default_config: RwLock::new(Config::default()),
            a_cache: RwLock::new(HashMap::new()),
            aaaa_cache: RwLock::new(HashMap::new()),
            https_cache: RwLock::new(HashMap::new()),
            nose: Mutex::new(vec![NOSE_SENTINEL.to_string()]),
            upstream: RwLock::new(String::new()),
            subdomain_depth: AtomicUsize::new(DEFAULT_SUBDOMAIN_DEPTH),
            dns_min_ttl: AtomicU32::new(0),
            forwarder: RwLock::new(None),
        }
    }

    /// Register the collaborator that services `tcpmapping=`/`udpmapping=`
    /// config lines.
    pub fn set_port_forwarder(&self, forwarder: Arc<dyn PortForwarder>) {
        *self.forwarder.write() = Some(forwarder);
    }

    /// Append `name` to the Nose table and return its index.
    ///
    /// Indices are 1-based (element 0 is [`NOSE_SENTINEL`]), dense, and
    /// stable for the process lifetime.
    pub fn reserve_nose(&self, name: &str) -> usize {
        let mut nose = self.nose.lock();
        let index = nose.len();
        nose.push(name.to_string());
        index
    }

    /// Recover the name a Nose index was issued for.
    pub fn nose_name(&self, index: usize) -> Option<String> {
        self.nose.lock().get(index).cloned()
    }

    pub fn nose_len(&self) -> usize {
        self.nose.lock().len()
    }

    /// Look up the cached memo for `(name, qtype)`.
    pub fn load_cache(&self, name: &str, qtype: u16) -> Option<DomainIp> {
        let cache = match qtype {
            QTYPE_A => &self.a_cache,
            QTYPE_AAAA => &self.aaaa_cache,
            _ => return None,
        };
        cache.read().get(name).cloned()
    }

    /// Store a memo for `(name, qtype)`. Entries are only ever replaced,
    /// never evicted, within a run.
    pub fn store_cache(&self, name: &str, qtype: u16, memo: DomainIp) {
        let cache = match qtype {
            QTYPE_A => &self.a_cache,
            QTYPE_AAAA => &self.aaaa_cache,
            _ => return,
        };
        cache.write().insert(name.to_string(), memo);
    }

    /// Memo advertising whether a name binds addresses over HTTPS.
    pub fn https_record(&self, name: &str) -> Option<DomainIp> {
        self.https_cache.read().get(name).cloned()
    }

    pub(crate) fn store_https(&self, name: &str, memo: DomainIp) {
        self.https_cache.write().insert(name.to_string(), memo);
    }

    /// Insert a policy under a canonical key (hostname, suffix, IP text
    /// form, or normalized CIDR).
    pub fn insert_policy(&self, key: &str, config: Config) {
        self.domains.write().insert(key.to_string(), config);
    }

    /// All keys currently in the policy table.
    pub fn policy_keys(&self) -> Vec<String> {
        self.domains.read().keys().cloned().collect()
    }

    /// The fallback policy captured from the `default.config.com` key.
    pub fn default_config(&self) -> Config {
        self.default_config.read().clone()
    }

    /// Global upstream DNS descriptor, seeded by the first `server=` line.
    pub fn upstream_descriptor(&self) -> String {
        self.upstream.read().clone()
    }

    pub fn set_upstream_descriptor(&self, descriptor: &str) {
        *self.upstream.write() = descriptor.to_string();
    }

    pub fn subdomain_depth(&self) -> usize {
        self.subdomain_depth.load(Ordering::Relaxed)
    }

    pub fn set_subdomain_depth(&self, depth: usize) {
        self.subdomain_depth.store(depth, Ordering::Relaxed);
    }

    /// Floor applied to answer TTLs by the DNS front-end.
    pub fn dns_min_ttl(&self) -> u32 {
        self.dns_min_ttl.load(Ordering::Relaxed)
    }

    pub fn set_dns_min_ttl(&self, ttl: u32) {
        self.dns_min_ttl.store(ttl, Ordering::Relaxed);
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
