//! Turning log lines into failure events
//!
//! The [`EventExtractor`] applies ordered fail patterns to each new line,
//! drops lines that also match an ignore pattern, resolves the text bound
//! to `<HOST>` and records one failure per resolved identity in its
//! [`FailRegistry`]. Resolution always happens before the registry is
//! touched, so the registry lock is never held across DNS.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Local, TimeZone, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::datedetector::DateDetector;
use crate::dns::{DnsPolicy, IdentityResolver};
use crate::error::ConfigError;
use crate::ignore_list::IgnoreList;
use crate::logsource::LogSource;
use crate::models::UnixTime;
use crate::registry::FailRegistry;

/// Marker replaced by the host capture group
pub const HOST_PLACEHOLDER: &str = "<HOST>";

/// Capture group `<HOST>` expands to. An IPv4-mapped IPv6 prefix is
/// skipped so the capture holds the bare address or name.
pub const HOST_PATTERN: &str = r"(?:::f{4,6}:)?(?P<host>[\w\-.^_]*\w)";

/// Fail pattern with its `<HOST>` placeholder expanded
#[derive(Debug, Clone)]
pub struct FailPattern {
    source: String,
    regex: Regex,
}

impl FailPattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        match pattern.matches(HOST_PLACEHOLDER).count() {
            0 => return Err(ConfigError::MissingHost(pattern.to_string())),
            1 => {}
            _ => return Err(ConfigError::MultipleHosts(pattern.to_string())),
        }

        let expanded = pattern.replace(HOST_PLACEHOLDER, HOST_PATTERN);
        let regex = Regex::new(&expanded).map_err(|source| ConfigError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Pattern as configured, before expansion
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Text bound to `<HOST>` when the line matches
    pub fn host<'l>(&self, line: &'l str) -> Option<&'l str> {
        self.regex
            .captures(line)
            .and_then(|captures| captures.name("host"))
            .map(|m| m.as_str())
    }
}

fn compile_ignore(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

/// Matching core of a jail
#[derive(Debug)]
pub struct EventExtractor {
    fail_patterns: Vec<FailPattern>,
    ignore_patterns: Vec<Regex>,
    ignore_list: IgnoreList,
    dns_policy: DnsPolicy,
    date_detector: Option<DateDetector>,
    resolver: Arc<IdentityResolver>,
    registry: Arc<FailRegistry>,
    dns_warned: AtomicBool,
}

impl EventExtractor {
    pub fn new(registry: Arc<FailRegistry>, resolver: Arc<IdentityResolver>) -> Self {
        Self {
            fail_patterns: Vec::new(),
            ignore_patterns: Vec::new(),
            ignore_list: IgnoreList::new(),
            dns_policy: DnsPolicy::default(),
            date_detector: None,
            resolver,
            registry,
            dns_warned: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<FailRegistry> {
        &self.registry
    }

    /// Append a fail pattern; it must contain `<HOST>` exactly once
    pub fn add_fail_regex(&mut self, pattern: &str) -> Result<(), ConfigError> {
        self.fail_patterns.push(FailPattern::new(pattern)?);
        Ok(())
    }

    pub fn fail_patterns(&self) -> &[FailPattern] {
        &self.fail_patterns
    }

    pub fn add_ignore_regex(&mut self, pattern: &str) -> Result<(), ConfigError> {
        self.ignore_patterns.push(compile_ignore(pattern)?);
        Ok(())
    }

    pub fn ignore_patterns(&self) -> impl Iterator<Item = &str> {
        self.ignore_patterns.iter().map(|r| r.as_str())
    }

    pub fn set_dns_policy(&mut self, policy: DnsPolicy) {
        self.dns_policy = policy;
    }

    pub fn dns_policy(&self) -> DnsPolicy {
        self.dns_policy
    }

    /// `None` stamps every line with the processing time
    pub fn set_date_detector(&mut self, detector: Option<DateDetector>) {
        self.date_detector = detector;
    }

    /// Exempt an address, network or hostname from failure accounting.
    /// Returns false when the entry contributed nothing.
    pub fn add_ignore_ip(&mut self, entry: &str) -> bool {
        self.ignore_list.add(entry, &self.resolver) > 0
    }

    /// Number of networks and addresses currently exempt
    pub fn ignore_ip_count(&self) -> usize {
        self.ignore_list.len()
    }

    pub fn in_ignore_ip_list(&self, candidate: &str) -> bool {
        self.ignore_list.contains_text(candidate)
    }

    fn is_ignored_line(&self, line: &str) -> bool {
        self.ignore_patterns.iter().any(|regex| regex.is_match(line))
    }

    fn line_time(&self, line: &str, now: UnixTime) -> Option<UnixTime> {
        match &self.date_detector {
            None => Some(now),
            Some(detector) => {
                let local_now = Local.timestamp_opt(now, 0).single().unwrap_or_else(Local::now);
                detector.get_time_at(line, local_now)
            }
        }
    }

    fn resolve(&self, host: &str) -> Vec<IpAddr> {
        let addrs = self.resolver.resolve(host, self.dns_policy);
        if self.dns_policy == DnsPolicy::Warn
            && !addrs.is_empty()
            && IdentityResolver::parse_literal(host).is_none()
            && !self.dns_warned.swap(true, Ordering::Relaxed)
        {
            warn!(
                "Determined IP using DNS lookup: {} = {:?}. Hostnames in logs are trusted; set use_dns = \"no\" to disable",
                host, addrs
            );
        }
        addrs
    }

    /// Identities and timestamp for `line`, without recording anything.
    ///
    /// Empty when no fail pattern matches, an ignore pattern matches, the
    /// date cannot be found, the line is older than the registry window, or
    /// the host does not resolve. Ignore-listed addresses are left out.
    pub fn find_failure(&self, line: &str, now: UnixTime) -> (Vec<IpAddr>, UnixTime) {
        let Some((pattern, host)) = self
            .fail_patterns
            .iter()
            .find_map(|pattern| pattern.host(line).map(|host| (pattern, host)))
        else {
            return (Vec::new(), now);
        };

        if self.is_ignored_line(line) {
            debug!("Ignoring line matching an ignore pattern: {}", line);
            return (Vec::new(), now);
        }

        let Some(time) = self.line_time(line, now) else {
            debug!("Ignoring line since time could not be found: {}", line);
            return (Vec::new(), now);
        };

        if time < now - self.registry.max_time() {
            debug!("Ignoring line older than the window: {}", line);
            return (Vec::new(), time);
        }

        let addrs: Vec<IpAddr> = self
            .resolve(host)
            .into_iter()
            .filter(|ip| {
                let ignored = self.ignore_list.contains(ip);
                if ignored {
                    debug!("Ignoring {} found by '{}' (ignore-ip)", ip, pattern.as_str());
                }
                !ignored
            })
            .collect();

        if addrs.is_empty() {
            debug!("No usable identity in '{}' from line: {}", host, line);
        } else {
            debug!("Pattern '{}' matched {:?}", pattern.as_str(), addrs);
        }
        (addrs, time)
    }

    /// Match one line and record its failures. Returns how many were added.
    pub fn process_line(&self, line: &str, now: UnixTime) -> usize {
        let (addrs, time) = self.find_failure(line, now);
        for ip in &addrs {
            self.registry
                .add_failure(&ip.to_string(), time, vec![line.to_string()]);
        }
        addrs.len()
    }

    /// Consume all new lines of `source`
    pub fn process(&self, source: &mut LogSource) -> std::io::Result<usize> {
        self.process_at(source, Utc::now().timestamp())
    }

    /// Like [`Self::process`] with an explicit current time
    pub fn process_at(&self, source: &mut LogSource, now: UnixTime) -> std::io::Result<usize> {
        let mut added = 0;
        for line in source.read_new_lines()? {
            added += self.process_line(&line?, now);
        }
        Ok(added)
    }
}
