//! Retry sampling
//!
//! Keeps track of the most persistent identity and the running average of
//! retry counts, and reports them through `info!` whenever a new leader
//! stands out or the current leader's window expires. Purely informational.

use parking_lot::Mutex;
use tracing::info;

use crate::models::UnixTime;
use crate::registry::{FailObserver, FailureSample};

/// Sample counter is reset past this many samples
const SAMPLE_CEILING: u64 = 1_000_000;

#[derive(Debug, Default)]
struct SamplerState {
    most_identity: Option<String>,
    most_retry: u32,
    most_time: UnixTime,
    sum_retry: u64,
    samples: u64,
}

impl SamplerState {
    fn average(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.sum_retry as f64 / self.samples as f64)
    }

    fn report(&self) {
        info!(
            "mostIP: {}",
            self.most_identity.as_deref().unwrap_or("none")
        );
        info!("mostRetry: {}", self.most_retry);
        if let Some(avg) = self.average() {
            info!("AverageRetry: {:.2}", avg);
        }
    }
}

/// Snapshot of the sampler's accumulators
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerStats {
    pub most_identity: Option<String>,
    pub most_retry: u32,
    pub average_retry: Option<f64>,
    pub samples: u64,
}

/// [`FailObserver`] that samples retry counts of re-offending identities
#[derive(Debug, Default)]
pub struct RetrySampler {
    state: Mutex<SamplerState>,
}

impl RetrySampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> SamplerStats {
        let state = self.state.lock();
        SamplerStats {
            most_identity: state.most_identity.clone(),
            most_retry: state.most_retry,
            average_retry: state.average(),
            samples: state.samples,
        }
    }
}

impl FailObserver for RetrySampler {
    fn on_failure(&self, sample: &FailureSample) {
        // First sighting of an identity carries no history to sample
        let Some(previous) = sample.previous_retry else {
            return;
        };

        let mut state = self.state.lock();
        if state.samples > SAMPLE_CEILING {
            state.sum_retry = 0;
            state.samples = 0;
        }
        state.sum_retry += u64::from(previous);
        state.samples += 1;

        if sample.retry > state.most_retry {
            if state.most_identity.as_deref() == Some(sample.identity.as_str()) {
                state.most_retry = sample.retry;
            } else {
                if state
                    .average()
                    .is_some_and(|avg| f64::from(state.most_retry) > avg)
                {
                    state.report();
                }
                state.most_retry = sample.retry;
                state.most_identity = Some(sample.identity.clone());
                state.most_time = sample.time;
            }
        }

        if state.most_time < sample.time - sample.max_time {
            state.report();
            state.most_retry = 0;
            state.most_identity = None;
            state.most_time = sample.time;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FailRegistry;
    use std::sync::Arc;

    fn sample(identity: &str, previous: Option<u32>, retry: u32, time: UnixTime) -> FailureSample {
        FailureSample {
            identity: identity.to_string(),
            previous_retry: previous,
            retry,
            time,
            max_time: 600,
        }
    }

    #[test]
    fn test_new_identities_not_sampled() {
        let sampler = RetrySampler::new();
        sampler.on_failure(&sample("10.0.0.1", None, 1, 100));
        assert_eq!(sampler.stats().samples, 0);
        assert_eq!(sampler.stats().most_identity, None);
    }

    #[test]
    fn test_tracks_most_retried() {
        let sampler = RetrySampler::new();
        sampler.on_failure(&sample("10.0.0.1", Some(1), 2, 100));
        sampler.on_failure(&sample("10.0.0.1", Some(2), 3, 110));
        sampler.on_failure(&sample("10.0.0.2", Some(1), 2, 120));

        let stats = sampler.stats();
        assert_eq!(stats.most_identity.as_deref(), Some("10.0.0.1"));
        assert_eq!(stats.most_retry, 3);
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.average_retry, Some(4.0 / 3.0));

        sampler.on_failure(&sample("10.0.0.2", Some(2), 5, 130));
        assert_eq!(sampler.stats().most_identity.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_leader_expires_after_window() {
        let sampler = RetrySampler::new();
        sampler.on_failure(&sample("10.0.0.1", Some(1), 2, 100));
        sampler.on_failure(&sample("10.0.0.2", Some(0), 1, 800));

        let stats = sampler.stats();
        assert_eq!(stats.most_identity, None);
        assert_eq!(stats.most_retry, 0);
    }

    #[test]
    fn test_sampler_does_not_change_bans() {
        let plain = FailRegistry::new();
        let sampled = FailRegistry::new().with_observer(Arc::new(RetrySampler::new()));

        for registry in [&plain, &sampled] {
            for t in 0..5 {
                registry.add_failure("10.0.0.1", 1_000 + t, vec!["x".to_string()]);
                registry.add_failure("10.0.0.2", 1_000 + t * 200, vec!["y".to_string()]);
            }
        }

        let a: Vec<_> = plain.drain().collect();
        let b: Vec<_> = sampled.drain().collect();
        assert_eq!(a, b);
    }
}
