//! Config and hosts file loading.
//!
//! The config grammar is line-oriented: `#` introduces a comment, empty
//! lines are skipped, and every other line is either a directive
//! (`key=value` with a recognized key, or a bare key) or a policy binding.
//! Directives mutate the *current* policy; binding lines snapshot it into
//! the table under their key.

use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;

use ipnet::IpNet;
use tracing::{info, warn};

use super::{method_option, Config, ConfigError, OPT_HTTPS, OPT_IPV6, OPT_NONE};
use crate::dns::wire::{QTYPE_A, QTYPE_AAAA};
use crate::dns::DomainIp;
use crate::world::World;

/// The key whose policy becomes the process-wide fallback.
const DEFAULT_CONFIG_KEY: &str = "default.config.com";

/// Collaborator that services `tcpmapping=`/`udpmapping=` lines by starting
/// port forwarders. Implemented outside this crate.
pub trait PortForwarder: Send + Sync {
    fn tcp_mapping(&self, local: &str, remote: &str);
    fn udp_mapping(&self, local: &str, remote: &str);
}

fn parse_field<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadValue {
        key,
        value: value.to_string(),
    })
}

impl World {
    /// Load a policy file from disk.
    pub fn load_config(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.load_config_str(&content)
    }

    /// Load policy from config text. See the module docs for the grammar.
    pub fn load_config_str(&self, content: &str) -> Result<(), ConfigError> {
        let mut option: u32 = OPT_NONE;
        let mut min_ttl: u8 = 0;
        let mut max_ttl: u8 = 0;
        let mut mss: u16 = 0;
        let mut server = String::new();
        let mut device = String::new();

        self.set_upstream_descriptor("");

        for raw in content.lines() {
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let line = raw.split('#').next().unwrap_or("");
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                let current = Config {
                    option,
                    ttl: min_ttl,
                    max_ttl,
                    mss,
                    server: server.clone(),
                    device: device.clone(),
                };
                self.bind_bare(line, &current);
                continue;
            };

            match key {
                "server" => {
                    if self.upstream_descriptor().is_empty() {
                        self.set_upstream_descriptor(value);
                    }
                    server = value.to_string();
                    info!(upstream = value, "dns upstream");
                }
                "dns-min-ttl" => {
                    self.set_dns_min_ttl(parse_field("dns-min-ttl", value)?);
                }
                "method" => {
                    option = OPT_NONE;
                    for name in value.split(',') {
                        match method_option(name) {
                            Some(bit) => option |= bit,
                            None => warn!(method = name, "unsupported method"),
                        }
                    }
                }
                "ttl" => min_ttl = parse_field("ttl", value)?,
                "max-ttl" => max_ttl = parse_field("max-ttl", value)?,
                "mss" => mss = parse_field("mss", value)?,
                "device" => {
                    device = if value == "default" {
                        String::new()
                    } else {
                        value.to_string()
                    };
                }
                "subdomain" => {
                    self.set_subdomain_depth(parse_field("subdomain", value)?);
                }
                "tcpmapping" => {
                    if let Some((local, remote)) = value.split_once('>') {
                        if let Some(forwarder) = self.forwarder.read().clone() {
                            forwarder.tcp_mapping(local, remote);
                        }
                    }
                }
                "udpmapping" => {
                    if let Some((local, remote)) = value.split_once('>') {
                        if let Some(forwarder) = self.forwarder.read().clone() {
                            forwarder.udp_mapping(local, remote);
                        }
                    }
                }
                _ => {
                    let current = Config {
                        option,
                        ttl: min_ttl,
                        max_ttl,
                        mss,
                        server: server.clone(),
                        device: device.clone(),
                    };
                    self.bind_entry(key, value, &current);
                }
            }
        }

        Ok(())
    }

    /// A `key=value` policy binding.
    fn bind_entry(&self, key: &str, value: &str, config: &Config) {
        // CIDR keys only attach policy; addresses inside the block are
        // matched by the transport layer, not cached here.
        if key.parse::<IpAddr>().is_err() && key.contains('/') {
            if let Ok(net) = key.parse::<IpNet>() {
                self.insert_policy(&net.trunc().to_string(), config.clone());
                return;
            }
        }

        let mut record_a = DomainIp::default();
        let mut record_aaaa = DomainIp::default();

        if let Some(alias) = value
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            if let Some(memo) = self.load_cache(alias, QTYPE_A) {
                record_a = memo;
            } else if let Some(memo) = self.load_cache(alias, QTYPE_AAAA) {
                record_aaaa = memo;
            } else {
                // the alias has no cached addresses yet; keep the policy
                // and move on to the next line
                warn!(key, alias, "alias without cached addresses");
                self.insert_policy(key, config.clone());
                return;
            }
        } else {
            if config.option != 0 {
                record_a.index = self.reserve_nose(key);
            }
            for part in value.split(',') {
                match part.parse::<IpAddr>() {
                    Ok(ip @ IpAddr::V4(_)) => record_a.addresses.push(ip),
                    Ok(ip @ IpAddr::V6(_)) => record_aaaa.addresses.push(ip),
                    Err(_) => warn!(address = part, "bad ip"),
                }
            }
        }

        match key.parse::<IpAddr>() {
            Ok(ip) => {
                let key = ip.to_string();
                self.insert_policy(&key, config.clone());
                self.store_cache(&key, QTYPE_A, record_a);
                self.store_cache(&key, QTYPE_AAAA, record_aaaa);
            }
            Err(_) => {
                self.insert_policy(key, config.clone());
                self.store_cache(key, QTYPE_A, record_a.clone());
                self.store_cache(key, QTYPE_AAAA, record_aaaa.clone());
                let https = if config.option & OPT_HTTPS != 0 {
                    if config.option & OPT_IPV6 == 0 {
                        record_a
                    } else {
                        record_aaaa
                    }
                } else {
                    DomainIp::default()
                };
                self.store_https(key, https);
            }
        }
    }

    /// A bare key: a CIDR, a resolvable `host:port`, or a plain hostname.
    fn bind_bare(&self, key: &str, config: &Config) {
        if key.contains('/') {
            if let Ok(net) = key.parse::<IpNet>() {
                self.insert_policy(&net.trunc().to_string(), config.clone());
                return;
            }
        }

        match key.to_socket_addrs() {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    self.insert_policy(&addr.ip().to_string(), config.clone());
                }
            }
            Err(_) => {
                if config.server.is_empty() && config.option == 0 {
                    self.store_cache(key, QTYPE_A, DomainIp::default());
                    self.store_cache(key, QTYPE_AAAA, DomainIp::default());
                } else {
                    self.insert_policy(key, config.clone());
                    if key == DEFAULT_CONFIG_KEY {
                        info!(key, "captured as default config");
                        *self.default_config.write() = config.clone();
                    }
                }
            }
        }
    }

    /// Load a hosts file from disk.
    pub fn load_hosts(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.load_hosts_str(&content);
        Ok(())
    }

    /// Load hosts entries (`<ip>\t<name>` lines) into the caches. Names
    /// under policy get a Nose index reserved for them.
    pub fn load_hosts_str(&self, content: &str) {
        for line in content.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((address, name)) = line.split_once('\t') else {
                continue;
            };

            if self.load_cache(name, QTYPE_A).is_some()
                || self.load_cache(name, QTYPE_AAAA).is_some()
            {
                continue;
            }

            let Ok(ip) = address.parse::<IpAddr>() else {
                warn!(address, "bad ip address");
                continue;
            };

            let index = match self.config_lookup(name) {
                Some(config) if config.option != 0 => self.reserve_nose(name),
                _ => 0,
            };

            let memo = DomainIp {
                index,
                addresses: vec![ip],
            };
            match ip {
                IpAddr::V4(_) => {
                    self.store_cache(name, QTYPE_A, memo);
                    self.store_cache(name, QTYPE_AAAA, DomainIp::default());
                }
                IpAddr::V6(_) => {
                    self.store_cache(name, QTYPE_AAAA, memo);
                    self.store_cache(name, QTYPE_A, DomainIp::default());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OPT_HTTPS, OPT_TTL};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn binding_with_method_reserves_nose_and_caches() {
        let world = World::new();
        world
            .load_config_str("method=ttl\nexample.com=1.1.1.1\n")
            .unwrap();

        let config = world.config_lookup("example.com").unwrap();
        assert_eq!(config.option, OPT_TTL);

        let memo = world.load_cache("example.com", QTYPE_A).unwrap();
        assert_eq!(memo.index, 1);
        assert_eq!(memo.addresses, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(world.nose_name(1).as_deref(), Some("example.com"));
    }

    #[test]
    fn binding_without_method_does_not_reserve() {
        let world = World::new();
        world.load_config_str("plain.com=2.2.2.2\n").unwrap();

        let memo = world.load_cache("plain.com", QTYPE_A).unwrap();
        assert_eq!(memo.index, 0);
        assert_eq!(world.nose_len(), 1);
    }

    #[test]
    fn mixed_family_value_splits_across_caches() {
        let world = World::new();
        world
            .load_config_str("dual.com=1.2.3.4,2001:db8::1\n")
            .unwrap();

        let a = world.load_cache("dual.com", QTYPE_A).unwrap();
        let aaaa = world.load_cache("dual.com", QTYPE_AAAA).unwrap();
        assert_eq!(a.addresses, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
        assert_eq!(
            aaaa.addresses,
            vec!["2001:db8::1".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn alias_binding_copies_cached_memo() {
        let world = World::new();
        world
            .load_config_str("first.com=3.3.3.3\nsecond.com=[first.com]\n")
            .unwrap();

        let memo = world.load_cache("second.com", QTYPE_A).unwrap();
        assert_eq!(memo.addresses, vec!["3.3.3.3".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn unresolved_alias_keeps_policy_and_continues() {
        let world = World::new();
        world
            .load_config_str("method=ttl\nbroken.com=[missing.com]\nafter.com=4.4.4.4\n")
            .unwrap();

        // the broken alias still records its policy...
        assert!(world.config_lookup("broken.com").is_some());
        // ...and the rest of the file is not lost
        assert!(world.load_cache("after.com", QTYPE_A).is_some());
    }

    #[test]
    fn ip_and_cidr_keys_use_canonical_forms() {
        let world = World::new();
        world
            .load_config_str("method=ttl\n192.168.0.1=192.168.0.1\n10.11.13.0/24=\n")
            .unwrap();

        assert!(world.config_lookup("192.168.0.1").is_some());
        let keys = world.policy_keys();
        assert!(keys.contains(&"10.11.13.0/24".to_string()));
    }

    #[test]
    fn bare_cidr_line_attaches_policy() {
        let world = World::new();
        world.load_config_str("method=ttl\n10.0.0.0/8\n").unwrap();
        assert!(world.config_lookup("10.0.0.0/8").is_some());
    }

    #[test]
    fn bare_hostname_with_current_policy_binds_without_addresses() {
        let world = World::new();
        world
            .load_config_str("server=udp://1.1.1.1:53\nmethod=ttl\nbare.example.com\n")
            .unwrap();

        let config = world.config_lookup("bare.example.com").unwrap();
        assert_eq!(config.option, OPT_TTL);
        assert_eq!(config.server, "udp://1.1.1.1:53");
        assert!(world.load_cache("bare.example.com", QTYPE_A).is_none());
    }

    #[test]
    fn default_config_key_is_captured() {
        let world = World::new();
        world
            .load_config_str("method=ttl\ndefault.config.com\n")
            .unwrap();
        assert_eq!(world.default_config().option, OPT_TTL);
        // the fallback now answers for any unmatched name
        assert!(world.config_lookup("never.seen.example").is_some());
    }

    #[test]
    fn first_server_line_seeds_global_upstream() {
        let world = World::new();
        world
            .load_config_str("server=udp://1.1.1.1:53\nserver=tcp://9.9.9.9:53\n")
            .unwrap();
        assert_eq!(world.upstream_descriptor(), "udp://1.1.1.1:53");
    }

    #[test]
    fn https_method_populates_https_cache() {
        let world = World::new();
        world
            .load_config_str("method=https,ttl\nsite.com=5.5.5.5\nmethod=ttl\nother.com=6.6.6.6\n")
            .unwrap();

        let https = world.https_record("site.com").unwrap();
        assert!(https.index > 0);
        assert_eq!(https.addresses, vec!["5.5.5.5".parse::<IpAddr>().unwrap()]);

        let none = world.https_record("other.com").unwrap();
        assert_eq!(none.index, 0);
        assert!(none.addresses.is_empty());
        assert!(world.config_lookup("site.com").unwrap().option & OPT_HTTPS != 0);
    }

    #[test]
    fn numeric_directives_apply_and_bad_values_abort() {
        let world = World::new();
        world
            .load_config_str("subdomain=3\ndns-min-ttl=60\nttl=8\nmax-ttl=64\nmss=1220\nmethod=ttl\nt.com=7.7.7.7\n")
            .unwrap();
        assert_eq!(world.subdomain_depth(), 3);
        assert_eq!(world.dns_min_ttl(), 60);
        let config = world.config_lookup("t.com").unwrap();
        assert_eq!((config.ttl, config.max_ttl, config.mss), (8, 64, 1220));

        let err = world.load_config_str("ttl=banana\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadValue { key: "ttl", .. }));
    }

    #[test]
    fn unknown_method_is_skipped_not_fatal() {
        let world = World::new();
        world
            .load_config_str("method=ttl,warp-drive\nx.com=8.8.8.8\n")
            .unwrap();
        assert_eq!(world.config_lookup("x.com").unwrap().option, OPT_TTL);
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let world = World::new();
        world
            .load_config_str("# header\n\nmethod=ttl\n# tail\ny.com=9.9.9.9\n")
            .unwrap();
        assert!(world.config_lookup("y.com").is_some());
    }

    #[test]
    fn mapping_lines_reach_the_forwarder() {
        #[derive(Default)]
        struct Recorder {
            tcp: AtomicUsize,
            udp: AtomicUsize,
        }
        impl PortForwarder for Recorder {
            fn tcp_mapping(&self, local: &str, remote: &str) {
                assert_eq!((local, remote), ("127.0.0.1:8053", "1.1.1.1:53"));
                self.tcp.fetch_add(1, Ordering::SeqCst);
            }
            fn udp_mapping(&self, _local: &str, _remote: &str) {
                self.udp.fetch_add(1, Ordering::SeqCst);
            }
        }

        let world = World::new();
        let recorder = Arc::new(Recorder::default());
        world.set_port_forwarder(recorder.clone());
        world
            .load_config_str("tcpmapping=127.0.0.1:8053>1.1.1.1:53\nudpmapping=127.0.0.1:8053>1.1.1.1:53\n")
            .unwrap();
        assert_eq!(recorder.tcp.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.udp.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hosts_entries_populate_by_family() {
        let world = World::new();
        world.load_config_str("method=ttl\n.lied.com=\n").unwrap();
        world.load_hosts_str(
            "# hosts\n1.2.3.4\tplain.host\n2001:db8::7\tsix.host\nwww.lied.com\nbad\tbad.host\n255.1.2.3.4\talso.bad\n",
        );

        let plain = world.load_cache("plain.host", QTYPE_A).unwrap();
        assert_eq!(plain.index, 0);
        assert_eq!(plain.addresses, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
        assert_eq!(
            world.load_cache("plain.host", QTYPE_AAAA).unwrap(),
            DomainIp::default()
        );

        let six = world.load_cache("six.host", QTYPE_AAAA).unwrap();
        assert_eq!(six.addresses, vec!["2001:db8::7".parse::<IpAddr>().unwrap()]);
        assert!(world.load_cache("also.bad", QTYPE_A).is_none());
    }

    #[test]
    fn hosts_entry_under_policy_reserves_nose() {
        let world = World::new();
        world.load_config_str("method=ttl\n.lied.com=\n").unwrap();
        let before = world.nose_len();
        world.load_hosts_str("9.9.9.9\twww.lied.com\n");

        let memo = world.load_cache("www.lied.com", QTYPE_A).unwrap();
        assert_eq!(memo.index, before);
        assert_eq!(world.nose_name(memo.index).as_deref(), Some("www.lied.com"));
    }

    #[test]
    fn hosts_does_not_clobber_existing_cache() {
        let world = World::new();
        world.load_config_str("fixed.com=1.1.1.1\n").unwrap();
        world.load_hosts_str("2.2.2.2\tfixed.com\n");

        let memo = world.load_cache("fixed.com", QTYPE_A).unwrap();
        assert_eq!(memo.addresses, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
    }
}
