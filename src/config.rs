use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::datedetector::{DateDetection, DateDetector};
use crate::dns::DnsPolicy;
use crate::error::ConfigError;
use crate::filter::FailPattern;
use crate::registry::{DEFAULT_MAX_RETRY, DEFAULT_MAX_TIME};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub jails: HashMap<String, JailConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut jails = HashMap::new();

        // Default SSH monitoring
        jails.insert(
            "ssh".to_string(),
            JailConfig {
                enabled: true,
                log_paths: vec!["/var/log/auth.log".to_string()],
                fail_regex: vec![
                    r"(?:(?:Authentication failure|Failed [-/\w+]+) for(?: [iI](?:llegal|nvalid) user)?|[Ii](?:llegal|nvalid) user|ROOT LOGIN REFUSED) .*(?: from|FROM) <HOST>".to_string(),
                    r"Connection closed by <HOST> port \d+ \[preauth\]".to_string(),
                    r"pam_unix\(sshd:auth\): authentication failure;.*rhost=<HOST>".to_string(),
                ],
                ignore_regex: Vec::new(),
                ignore_ip: vec!["127.0.0.1/8".to_string(), "::1".to_string()],
                max_retry: default_max_retry(),
                max_time: default_max_time(),
                use_dns: DnsPolicy::default(),
                date: DateDetection::Auto,
            },
        );

        Self {
            general: GeneralConfig::default(),
            jails,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/failtrack/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("failtrack/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("failtrack.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Validate every enabled jail
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.jails
            .values()
            .filter(|jail| jail.enabled)
            .try_for_each(JailConfig::validate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailConfig {
    /// Whether this jail is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log files to follow
    #[serde(default)]
    pub log_paths: Vec<String>,

    /// Fail patterns, tried in order; each needs one `<HOST>`
    #[serde(default)]
    pub fail_regex: Vec<String>,

    /// Lines matching any of these are never counted
    #[serde(default)]
    pub ignore_regex: Vec<String>,

    /// Addresses, networks or hostnames never reported
    #[serde(default)]
    pub ignore_ip: Vec<String>,

    /// Number of failures before ban
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Time window to count failures (seconds)
    #[serde(default = "default_max_time")]
    pub max_time: i64,

    /// Whether hostnames in log lines are resolved
    #[serde(default)]
    pub use_dns: DnsPolicy,

    /// Where line timestamps come from
    #[serde(default)]
    pub date: DateDetection,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_paths: Vec::new(),
            fail_regex: Vec::new(),
            ignore_regex: Vec::new(),
            ignore_ip: Vec::new(),
            max_retry: default_max_retry(),
            max_time: default_max_time(),
            use_dns: DnsPolicy::default(),
            date: DateDetection::default(),
        }
    }
}

impl JailConfig {
    /// Reject anything that would fail later during log processing
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_retry == 0 {
            return Err(ConfigError::InvalidMaxRetry(self.max_retry));
        }
        if self.max_time <= 0 {
            return Err(ConfigError::InvalidMaxTime(self.max_time));
        }
        for pattern in &self.fail_regex {
            FailPattern::new(pattern)?;
        }
        for pattern in &self.ignore_regex {
            regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                pattern: pattern.clone(),
                source,
            })?;
        }
        DateDetector::from_detection(&self.date)?;
        Ok(())
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_max_time() -> i64 {
    DEFAULT_MAX_TIME // 10 minutes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.jails.contains_key("ssh"));
        assert_eq!(config.jails["ssh"].max_retry, 3);
        assert_eq!(config.jails["ssh"].max_time, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.jails["ssh"].fail_regex, config.jails["ssh"].fail_regex);
        assert_eq!(parsed.jails["ssh"].date, DateDetection::Auto);
    }

    #[test]
    fn test_minimal_jail_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [jails.web]
            log_paths = ["/var/log/nginx/error.log"]
            fail_regex = ["client: <HOST>"]
            use_dns = "no"
            date = { custom = { regex = '\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}', format = "%Y/%m/%d %H:%M:%S" } }
            "#,
        )
        .unwrap();

        let jail = &parsed.jails["web"];
        assert!(jail.enabled);
        assert_eq!(jail.max_retry, 3);
        assert_eq!(jail.max_time, 600);
        assert_eq!(jail.use_dns, DnsPolicy::No);
        assert!(matches!(jail.date, DateDetection::Custom { .. }));
        assert_eq!(parsed.general.log_level, "info");
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_validation_fails_fast() {
        let base = JailConfig {
            fail_regex: vec!["from <HOST>".to_string()],
            ..Default::default()
        };
        assert!(base.validate().is_ok());

        let zero_retry = JailConfig { max_retry: 0, ..base.clone() };
        assert!(matches!(zero_retry.validate(), Err(ConfigError::InvalidMaxRetry(0))));

        let negative_time = JailConfig { max_time: -5, ..base.clone() };
        assert!(matches!(negative_time.validate(), Err(ConfigError::InvalidMaxTime(-5))));

        let no_host = JailConfig {
            fail_regex: vec!["Failed password".to_string()],
            ..base.clone()
        };
        assert!(matches!(no_host.validate(), Err(ConfigError::MissingHost(_))));

        let bad_ignore = JailConfig {
            ignore_regex: vec!["(".to_string()],
            ..base
        };
        assert!(matches!(bad_ignore.validate(), Err(ConfigError::InvalidRegex { .. })));
    }

    #[test]
    fn test_unknown_dns_policy_rejected() {
        let parsed: std::result::Result<Config, _> = toml::from_str(
            r#"
            [jails.ssh]
            use_dns = "sometimes"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        Config::default().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.jails.len(), 1);
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
