//! Time-windowed failure registry
//!
//! Tracks failure counts per identity and turns identities that reach the
//! retry threshold into [`FailTicket`]s. Every operation runs inside one
//! exclusive critical section, so concurrent log readers and the ban
//! consumer never observe a half-applied update.
//!
//! # Example
//! ```
//! use failtrack::registry::FailRegistry;
//!
//! let registry = FailRegistry::new();
//! registry.set_max_retry(2);
//!
//! registry.add_failure("192.0.2.7", 1_000, vec!["Failed password".to_string()]);
//! registry.add_failure("192.0.2.7", 1_010, vec!["Failed password".to_string()]);
//!
//! let ticket = registry.to_ban().unwrap();
//! assert_eq!(ticket.identity(), "192.0.2.7");
//! assert_eq!(ticket.attempt_count(), 2);
//! assert!(registry.to_ban().is_err());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::RegistryEmpty;
use crate::models::{FailRecord, FailTicket, UnixTime};

pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_MAX_TIME: i64 = 600;

/// What the registry reports to an observer after each `add_failure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSample {
    pub identity: String,
    /// Retry count before this failure, `None` when the record is new
    pub previous_retry: Option<u32>,
    pub retry: u32,
    pub time: UnixTime,
    /// Window length in effect when the failure was recorded
    pub max_time: i64,
}

/// Informational hook into registry activity.
///
/// Observers are called after the registry lock has been released and can
/// never influence ban decisions.
pub trait FailObserver: Send + Sync {
    fn on_failure(&self, sample: &FailureSample);

    fn on_cleanup(&self, _evicted: usize) {}

    fn on_ban(&self, _ticket: &FailTicket) {}
}

#[derive(Debug)]
struct RegistryState {
    records: HashMap<String, FailRecord>,
    max_retry: u32,
    max_time: i64,
    fail_total: u64,
}

/// Thread-safe collection of failure records keyed by identity
pub struct FailRegistry {
    state: Mutex<RegistryState>,
    observer: Option<Arc<dyn FailObserver>>,
}

impl Default for FailRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FailRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailRegistry")
            .field("state", &*self.state.lock())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl FailRegistry {
    /// Create an empty registry with default threshold and window
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                records: HashMap::new(),
                max_retry: DEFAULT_MAX_RETRY,
                max_time: DEFAULT_MAX_TIME,
                fail_total: 0,
            }),
            observer: None,
        }
    }

    /// Attach an observer that is notified of every add, cleanup and ban
    pub fn with_observer(mut self, observer: Arc<dyn FailObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn set_max_retry(&self, value: u32) {
        self.state.lock().max_retry = value;
    }

    pub fn max_retry(&self) -> u32 {
        self.state.lock().max_retry
    }

    /// Set the window length in seconds
    pub fn set_max_time(&self, value: i64) {
        self.state.lock().max_time = value;
    }

    pub fn max_time(&self) -> i64 {
        self.state.lock().max_time
    }

    pub fn set_fail_total(&self, value: u64) {
        self.state.lock().fail_total = value;
    }

    pub fn fail_total(&self) -> u64 {
        self.state.lock().fail_total
    }

    /// Record `lines.len()` failures for `identity` at `timestamp`.
    ///
    /// The window does not slide: once `timestamp` is more than `max_time`
    /// past the record's last reset, the accumulated count is discarded and
    /// a new window starts at `timestamp`.
    pub fn add_failure(&self, identity: &str, timestamp: UnixTime, lines: Vec<String>) {
        let (sample, tracked) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let max_time = state.max_time;

            let sample = match state.records.get_mut(identity) {
                Some(record) => {
                    let previous = record.retry_count;
                    if record.last_reset_time < timestamp - max_time {
                        record.reset(timestamp);
                    }
                    record.inc(lines);
                    // Out-of-order lines never move the last failure backwards
                    record.last_failure_time = record.last_failure_time.max(timestamp);
                    FailureSample {
                        identity: identity.to_string(),
                        previous_retry: Some(previous),
                        retry: record.retry_count,
                        time: timestamp,
                        max_time,
                    }
                }
                None => {
                    let record = FailRecord::new(identity.to_string(), timestamp, lines);
                    let retry = record.retry_count;
                    state.records.insert(identity.to_string(), record);
                    FailureSample {
                        identity: identity.to_string(),
                        previous_retry: None,
                        retry,
                        time: timestamp,
                        max_time,
                    }
                }
            };

            state.fail_total += 1;
            (sample, state.records.len())
        };

        debug!(
            "Currently have failures from {} identities, {} has {}",
            tracked, identity, sample.retry
        );

        if let Some(observer) = &self.observer {
            observer.on_failure(&sample);
        }
    }

    /// Number of tracked identities
    pub fn size(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Copy of the current record for `identity`, if tracked
    pub fn get(&self, identity: &str) -> Option<FailRecord> {
        self.state.lock().records.get(identity).cloned()
    }

    /// Evict every record whose last failure is older than `now - max_time`.
    /// Returns the number of evicted identities.
    pub fn cleanup(&self, now: UnixTime) -> usize {
        let evicted = {
            let mut state = self.state.lock();
            let cutoff = now - state.max_time;
            let before = state.records.len();
            state.records.retain(|_, record| record.last_failure_time >= cutoff);
            before - state.records.len()
        };

        if evicted > 0 {
            debug!("Cleanup evicted {} stale identities", evicted);
        }
        if let Some(observer) = &self.observer {
            observer.on_cleanup(evicted);
        }
        evicted
    }

    /// Remove and return one identity that reached `max_retry`.
    ///
    /// Among qualifying records the one with the earliest last failure is
    /// chosen, ties broken by identity. Returns [`RegistryEmpty`] when
    /// nothing qualifies.
    pub fn to_ban(&self) -> Result<FailTicket, RegistryEmpty> {
        let ticket = {
            let mut state = self.state.lock();
            let max_retry = state.max_retry;

            let identity = state
                .records
                .values()
                .filter(|record| record.retry_count >= max_retry)
                .min_by(|a, b| {
                    a.last_failure_time
                        .cmp(&b.last_failure_time)
                        .then_with(|| a.identity.cmp(&b.identity))
                })
                .map(|record| record.identity.clone())
                .ok_or(RegistryEmpty)?;

            state
                .records
                .remove(&identity)
                .ok_or(RegistryEmpty)?
                .into_ticket()
        };

        if let Some(observer) = &self.observer {
            observer.on_ban(&ticket);
        }
        Ok(ticket)
    }

    /// Iterate tickets until the registry reports [`RegistryEmpty`]
    pub fn drain(&self) -> impl Iterator<Item = FailTicket> + '_ {
        std::iter::from_fn(move || self.to_ban().ok())
    }
}
