//! A jail: a set of log files feeding one extractor and one registry
//!
//! The jail does not schedule anything itself. An external loop calls
//! [`Jail::poll`] once per tick, and the ban side drains
//! [`Jail::registry`] on its own cadence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::JailConfig;
use crate::datedetector::DateDetector;
use crate::dns::IdentityResolver;
use crate::error::ConfigError;
use crate::filter::EventExtractor;
use crate::logsource::LogSource;
use crate::registry::FailRegistry;

pub struct Jail {
    name: String,
    sources: Vec<LogSource>,
    extractor: EventExtractor,
    registry: Arc<FailRegistry>,
}

impl std::fmt::Debug for Jail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jail")
            .field("name", &self.name)
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl Jail {
    /// Empty jail around an existing extractor
    pub fn new(name: &str, extractor: EventExtractor) -> Self {
        let registry = extractor.registry().clone();
        Self {
            name: name.to_string(),
            sources: Vec::new(),
            extractor,
            registry,
        }
    }

    /// Validate `config` and build a jail with a fresh registry
    pub fn from_config(
        name: &str,
        config: &JailConfig,
        resolver: Arc<IdentityResolver>,
    ) -> Result<Self, ConfigError> {
        Self::with_registry(name, config, resolver, Arc::new(FailRegistry::new()))
    }

    /// Validate `config` and build a jail that records into `registry`
    pub fn with_registry(
        name: &str,
        config: &JailConfig,
        resolver: Arc<IdentityResolver>,
        registry: Arc<FailRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        registry.set_max_retry(config.max_retry);
        registry.set_max_time(config.max_time);

        let mut extractor = EventExtractor::new(registry, resolver);
        for pattern in &config.fail_regex {
            extractor.add_fail_regex(pattern)?;
        }
        for pattern in &config.ignore_regex {
            extractor.add_ignore_regex(pattern)?;
        }
        for entry in &config.ignore_ip {
            extractor.add_ignore_ip(entry);
        }
        extractor.set_dns_policy(config.use_dns);
        extractor.set_date_detector(DateDetector::from_detection(&config.date)?);

        let mut jail = Self::new(name, extractor);
        for path in &config.log_paths {
            jail.add_log_path(path);
        }

        info!(
            "Jail '{}' ready: {} log files, {} fail patterns, {} ignored networks, use_dns={}, max_retry={}, max_time={}s",
            name,
            jail.sources.len(),
            config.fail_regex.len(),
            jail.extractor.ignore_ip_count(),
            config.use_dns,
            config.max_retry,
            config.max_time
        );
        Ok(jail)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<FailRegistry> {
        &self.registry
    }

    pub fn extractor(&self) -> &EventExtractor {
        &self.extractor
    }

    /// Follow another log file. Adding a path twice has no effect.
    pub fn add_log_path<P: AsRef<Path>>(&mut self, path: P) {
        let path = path.as_ref();
        if self.sources.iter().any(|s| s.path() == path) {
            warn!("{} is already monitored by jail '{}'", path.display(), self.name);
            return;
        }
        debug!("Jail '{}' now monitors {}", self.name, path.display());
        self.sources.push(LogSource::new(path));
    }

    /// Stop following `path`. Returns false when it was not monitored.
    pub fn remove_log_path<P: AsRef<Path>>(&mut self, path: P) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.path() != path.as_ref());
        before != self.sources.len()
    }

    pub fn log_paths(&self) -> Vec<PathBuf> {
        self.sources.iter().map(|s| s.path().to_path_buf()).collect()
    }

    /// Process every modified log once. Per-file errors are logged and do
    /// not stop the tick. Returns the number of failures recorded.
    pub fn poll(&mut self) -> usize {
        let mut added = 0;

        for source in &mut self.sources {
            match source.is_modified() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("Unable to stat {}: {}", source.path().display(), e);
                    continue;
                }
            }

            match self.extractor.process(source) {
                Ok(n) => {
                    if n > 0 {
                        debug!(
                            "Jail '{}': {} failures from {}",
                            self.name,
                            n,
                            source.path().display()
                        );
                    }
                    added += n;
                }
                Err(e) => {
                    error!(
                        "Error processing log {} for jail '{}': {}",
                        source.path().display(),
                        self.name,
                        e
                    );
                }
            }
        }

        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticLookup;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn resolver() -> Arc<IdentityResolver> {
        Arc::new(IdentityResolver::new(StaticLookup::new()))
    }

    fn config(path: &Path) -> JailConfig {
        JailConfig {
            log_paths: vec![path.display().to_string()],
            fail_regex: vec!["Failed .* from <HOST>".to_string()],
            ..Default::default()
        }
    }

    fn append(path: &Path, text: &str) {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap()
            .write_all(text.as_bytes())
            .unwrap();
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let bad = JailConfig {
            max_retry: 0,
            ..Default::default()
        };
        assert!(Jail::from_config("bad", &bad, resolver()).is_err());
    }

    #[test]
    fn test_log_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let mut jail = Jail::from_config("ssh", &config(&path), resolver()).unwrap();

        jail.add_log_path(&path);
        assert_eq!(jail.log_paths(), vec![path.clone()]);
        assert!(jail.remove_log_path(&path));
        assert!(!jail.remove_log_path(&path));
        assert!(jail.log_paths().is_empty());
    }

    #[test]
    fn test_poll_only_reads_modified() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "Failed password for root from 10.0.0.1 port 22\n");

        let mut jail = Jail::from_config("ssh", &config(&path), resolver()).unwrap();
        assert_eq!(jail.poll(), 1);
        assert_eq!(jail.poll(), 0);

        append(&path, "Failed password for root from 10.0.0.1 port 22\n");
        append(&path, "Failed password for root from 10.0.0.1 port 22\n");
        assert_eq!(jail.poll(), 2);

        let ticket = jail.registry().to_ban().unwrap();
        assert_eq!(ticket.identity(), "10.0.0.1");
        assert_eq!(ticket.attempt_count(), 3);
    }

    #[test]
    fn test_poll_survives_missing_files() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("auth.log");
        append(&present, "Failed password for root from 10.0.0.2 port 22\n");

        let mut jail = Jail::from_config("ssh", &config(&present), resolver()).unwrap();
        jail.add_log_path(dir.path().join("gone.log"));
        assert_eq!(jail.poll(), 1);
    }

    #[test]
    fn test_shared_registry() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        append(&a, "Failed password for root from 10.0.0.3 port 22\n");
        append(&b, "Failed password for root from 10.0.0.3 port 22\n");

        let registry = Arc::new(FailRegistry::new());
        let mut ja = Jail::with_registry("a", &config(&a), resolver(), registry.clone()).unwrap();
        let mut jb = Jail::with_registry("b", &config(&b), resolver(), registry.clone()).unwrap();
        ja.poll();
        jb.poll();

        assert_eq!(registry.get("10.0.0.3").unwrap().retry_count, 2);
    }
}
