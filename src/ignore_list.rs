//! Ignore-IP allow list
//!
//! Trusted sources that must never be reported, whatever the log says.
//! Entries can be:
//! - literal addresses (`127.0.0.1`, `::1`)
//! - networks in CIDR notation (`10.0.0.0/8`)
//! - hostnames, resolved once when the entry is added

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{debug, warn};

use crate::dns::IdentityResolver;

/// Set of addresses and networks exempt from failure accounting
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    /// Single addresses are stored as host networks (/32, /128)
    networks: Vec<IpNetwork>,
}

impl IgnoreList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Returns the number of networks it contributed, zero
    /// when the entry was malformed or did not resolve.
    pub fn add(&mut self, entry: &str, resolver: &IdentityResolver) -> usize {
        let entry = entry.trim();
        if entry.is_empty() {
            warn!("Ignoring empty ignore-ip entry");
            return 0;
        }

        if let Some(ip) = IdentityResolver::parse_literal(entry) {
            self.networks.push(IpNetwork::from(ip));
            return 1;
        }

        if entry.contains('/') {
            return match entry.parse::<IpNetwork>() {
                Ok(network) => {
                    self.networks.push(network);
                    1
                }
                Err(e) => {
                    warn!("Invalid network in ignore-ip list: {} ({})", entry, e);
                    0
                }
            };
        }

        let addrs = resolver.dns_to_ip(entry);
        if addrs.is_empty() {
            warn!("Unable to use ignore-ip entry: {}", entry);
            return 0;
        }
        debug!("Ignore-ip entry {} resolved to {:?}", entry, addrs);
        let added = addrs.len();
        self.networks.extend(addrs.into_iter().map(IpNetwork::from));
        added
    }

    /// True when `ip` falls in any entry
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(*ip))
    }

    /// Check a textual candidate; malformed text is never ignored
    pub fn contains_text(&self, candidate: &str) -> bool {
        IdentityResolver::parse_literal(candidate).is_some_and(|ip| self.contains(&ip))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticLookup;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(
            StaticLookup::new().with_host("www.epfl.ch", &["128.178.50.12".parse().unwrap()]),
        )
    }

    #[test]
    fn test_literal_entries() {
        let resolver = resolver();
        let mut list = IgnoreList::new();
        for ip in ["127.0.0.1", "192.168.0.1", "255.255.255.255", "99.99.99.99"] {
            assert_eq!(list.add(ip, &resolver), 1);
            assert!(list.contains_text(ip));
        }
        assert!(!list.contains_text("192.168.0.2"));
    }

    #[test]
    fn test_malformed_entries() {
        let resolver = resolver();
        let mut list = IgnoreList::new();
        for ip in ["", "999.999.999.999", "abcdef", "192.168.0."] {
            assert_eq!(list.add(ip, &resolver), 0);
            assert!(!list.contains_text(ip));
        }
        assert!(list.is_empty());
    }

    #[test]
    fn test_hostname_entry() {
        let resolver = resolver();
        let mut list = IgnoreList::new();
        assert_eq!(list.add("www.epfl.ch", &resolver), 1);
        assert!(list.contains_text("128.178.50.12"));
        assert!(!list.contains_text("127.177.50.10"));
    }

    #[test]
    fn test_network_entries() {
        let resolver = resolver();
        let mut list = IgnoreList::new();
        assert_eq!(list.add("10.0.0.0/8", &resolver), 1);
        assert_eq!(list.add("2001:db8::/32", &resolver), 1);
        assert_eq!(list.add("10.0.0.0/99", &resolver), 0);

        assert!(list.contains(&"10.1.2.3".parse().unwrap()));
        assert!(list.contains(&"2001:db8::1".parse().unwrap()));
        assert!(!list.contains(&"11.0.0.1".parse().unwrap()));
    }
}
