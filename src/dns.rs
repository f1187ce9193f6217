//! Identity resolution
//!
//! Turns the text captured by a `<HOST>` placeholder into IP addresses.
//! Literal addresses are validated strictly; hostnames are only looked up
//! when the DNS policy allows it. Failures never reach the caller, they
//! simply produce no addresses.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::Resolver;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// How far hostnames found in log lines are trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsPolicy {
    /// Resolve hostnames
    Yes,
    /// Only accept literal addresses
    No,
    /// Resolve hostnames, but warn that DNS is being trusted
    #[default]
    Warn,
}

impl DnsPolicy {
    pub fn allows_lookup(self) -> bool {
        !matches!(self, DnsPolicy::No)
    }
}

impl std::fmt::Display for DnsPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DnsPolicy::Yes => "yes",
            DnsPolicy::No => "no",
            DnsPolicy::Warn => "warn",
        };
        f.write_str(name)
    }
}

impl FromStr for DnsPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yes" => Ok(DnsPolicy::Yes),
            "no" => Ok(DnsPolicy::No),
            "warn" => Ok(DnsPolicy::Warn),
            other => Err(ConfigError::InvalidDnsPolicy(other.to_string())),
        }
    }
}

/// Forward lookup backend
pub trait HostLookup: Send + Sync {
    fn lookup(&self, host: &str) -> Option<Vec<IpAddr>>;
}

/// Lookup through the system resolver configuration
pub struct SystemLookup {
    resolver: Resolver,
}

impl SystemLookup {
    /// Build from `/etc/resolv.conf`, falling back to the default upstreams
    pub fn new() -> std::io::Result<Self> {
        let resolver = match Resolver::from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("Unable to read system resolver config ({}), using defaults", e);
                Resolver::new(ResolverConfig::default(), ResolverOpts::default())?
            }
        };
        Ok(Self { resolver })
    }
}

impl HostLookup for SystemLookup {
    fn lookup(&self, host: &str) -> Option<Vec<IpAddr>> {
        match self.resolver.lookup_ip(host) {
            Ok(response) => Some(response.iter().collect()),
            Err(e) => {
                debug!("Unable to resolve {}: {}", host, e);
                None
            }
        }
    }
}

/// Fixed hostname table
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.hosts.insert(host.to_lowercase(), addrs.to_vec());
        self
    }
}

impl HostLookup for StaticLookup {
    fn lookup(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.hosts
            .get(host.trim_end_matches('.').to_lowercase().as_str())
            .cloned()
    }
}

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z0-9_](?:[A-Za-z0-9_-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9_](?:[A-Za-z0-9_-]{0,61}[A-Za-z0-9])?)*\.?$",
        )
        .expect("valid hostname regex")
    })
}

/// Resolves placeholder text to addresses under a [`DnsPolicy`]
pub struct IdentityResolver {
    lookup: Box<dyn HostLookup>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver").finish_non_exhaustive()
    }
}

impl IdentityResolver {
    pub fn new(lookup: impl HostLookup + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    /// Resolver backed by the system DNS configuration
    pub fn system() -> std::io::Result<Self> {
        Ok(Self::new(SystemLookup::new()?))
    }

    /// Strictly parse `text` as an IPv4 or IPv6 literal
    pub fn parse_literal(text: &str) -> Option<IpAddr> {
        text.trim().parse::<IpAddr>().ok()
    }

    /// Forward-resolve `host`. Empty on any failure.
    pub fn dns_to_ip(&self, host: &str) -> Vec<IpAddr> {
        let host = host.trim();
        if host.is_empty() || !hostname_regex().is_match(host) {
            debug!("Not a resolvable hostname: {:?}", host);
            return Vec::new();
        }
        // Digits and dots only means a broken address, not a name
        if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
            debug!("Malformed address: {}", host);
            return Vec::new();
        }
        self.lookup.lookup(host).unwrap_or_default()
    }

    /// Resolve captured text to addresses according to `policy`.
    ///
    /// Only the whole text counts as a literal. A name that merely starts
    /// with a dotted quad is a hostname and goes through DNS.
    pub fn resolve(&self, text: &str, policy: DnsPolicy) -> Vec<IpAddr> {
        if let Some(ip) = Self::parse_literal(text) {
            return vec![ip];
        }
        if policy.allows_lookup() {
            return self.dns_to_ip(text);
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(
            StaticLookup::new()
                .with_host("example.com", &["192.0.43.10".parse().unwrap()])
                .with_host("1.2.3.4.evil.example", &["203.0.113.66".parse().unwrap()])
                .with_host(
                    "dual.example.org",
                    &["198.51.100.4".parse().unwrap(), "2001:db8::4".parse().unwrap()],
                ),
        )
    }

    #[test]
    fn test_literal_with_policy_no() {
        let r = resolver();
        assert_eq!(r.resolve("127.0.0.1", DnsPolicy::No), vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert!(r.resolve("999.999.999.999", DnsPolicy::No).is_empty());
        assert!(r.resolve("example.com", DnsPolicy::No).is_empty());
    }

    #[test]
    fn test_hostname_with_policy_yes() {
        let r = resolver();
        assert_eq!(
            r.resolve("example.com", DnsPolicy::Yes),
            vec!["192.0.43.10".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(r.resolve("dual.example.org", DnsPolicy::Warn).len(), 2);
        assert!(r.resolve("unknown.example.net", DnsPolicy::Yes).is_empty());
    }

    #[test]
    fn test_malformed_input() {
        let r = resolver();
        for text in ["", "999.999.999.999", "192.168.0.", "..", "-bad-.com", "a b"] {
            assert!(r.resolve(text, DnsPolicy::Yes).is_empty(), "{:?}", text);
        }
    }

    #[test]
    fn test_ipv6_literal() {
        assert_eq!(
            IdentityResolver::parse_literal("2001:db8::1"),
            Some("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn test_leading_dotted_quad_is_not_a_literal() {
        let r = resolver();
        assert!(r.resolve("1.2.3.4.evil.example", DnsPolicy::No).is_empty());
        assert!(r.resolve("1.2.3.4.5", DnsPolicy::No).is_empty());
        assert!(r.resolve("10.1.2.3:22", DnsPolicy::No).is_empty());

        assert_eq!(
            r.resolve("1.2.3.4.evil.example", DnsPolicy::Yes),
            vec!["203.0.113.66".parse::<IpAddr>().unwrap()]
        );
        assert!(r.resolve("1.2.3.4.5", DnsPolicy::Yes).is_empty());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("YES".parse::<DnsPolicy>().unwrap(), DnsPolicy::Yes);
        assert_eq!("warn".parse::<DnsPolicy>().unwrap(), DnsPolicy::Warn);
        assert!("maybe".parse::<DnsPolicy>().is_err());
        assert_eq!(DnsPolicy::No.to_string(), "no");
        assert_eq!(DnsPolicy::default(), DnsPolicy::Warn);
    }
}
