use thiserror::Error;

/// Errors raised while applying configuration to a jail.
///
/// These are always reported before any log processing begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("fail pattern has no <HOST> placeholder: {0}")]
    MissingHost(String),

    #[error("fail pattern has more than one <HOST> placeholder: {0}")]
    MultipleHosts(String),

    #[error("max_retry must be at least 1, got {0}")]
    InvalidMaxRetry(u32),

    #[error("max_time must be positive, got {0}")]
    InvalidMaxTime(i64),

    #[error("invalid date format '{0}'")]
    InvalidDateFormat(String),

    #[error("unknown DNS policy '{0}' (expected yes, no or warn)")]
    InvalidDnsPolicy(String),
}

/// Returned by [`crate::registry::FailRegistry::to_ban`] when no identity
/// currently reaches the ban threshold. This is normal flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no identity currently qualifies for a ban")]
pub struct RegistryEmpty;
