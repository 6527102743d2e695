// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Retry policies for a [`SessionClient`](crate::session::SessionClient).

use std::time::Duration;

use rand::Rng;

use crate::error::TransportError;

/// Trait defining interface for connection retry policies.
pub trait RetryPolicy: Send + Sync {
    /// Get the delay before the next connection attempt.
    /// Returns [`None`] if no further attempt should be made.
    fn next_delay(&self, prev_attempts: u32, error: &TransportError) -> Option<Duration>;
}

/// A retry policy that exponentially backs off the delay between connection
/// attempts.
///
/// Delays range from 128ms to the specified max wait time, before applying
/// jitter. Jitter can subtract up to 10% of the delay.
#[derive(Clone)]
pub struct ExponentialBackoffWithJitter {
    /// The longest possible time to wait between connection attempts.
    pub max_wait: Duration,
    /// The max number of attempts before giving up.
    pub max_attempts: Option<u32>,
}

impl ExponentialBackoffWithJitter {
    const MIN_EXPONENT: u32 = 7;
    const BASE_DELAY_MS: u64 = 2;

    fn should_retry(&self, prev_attempts: u32) -> bool {
        self.max_attempts
            .is_none_or(|max_attempts| prev_attempts < max_attempts)
    }

    fn calculate_delay(&self, prev_attempts: u32) -> Duration {
        // Exponent starts at 7 to keep the shortest delay at 128ms
        let exponent = prev_attempts.saturating_add(Self::MIN_EXPONENT);
        let interval =
            Duration::from_millis(Self::BASE_DELAY_MS.saturating_pow(exponent)).min(self.max_wait);

        // Jitter prevents a fleet of clients from reconnecting in lockstep
        let jitter_multiplier = rand::thread_rng().gen_range(0.90..=1.0);
        interval.mul_f64(jitter_multiplier)
    }
}

impl Default for ExponentialBackoffWithJitter {
    /// Indefinite retries, with a max wait time of 60 seconds.
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryPolicy for ExponentialBackoffWithJitter {
    fn next_delay(&self, prev_attempts: u32, _error: &TransportError) -> Option<Duration> {
        if self.should_retry(prev_attempts) {
            Some(self.calculate_delay(prev_attempts))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_error() -> TransportError {
        TransportError::LinkClosed
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = ExponentialBackoffWithJitter {
            max_wait: Duration::from_secs(10),
            max_attempts: None,
        };
        let first = policy.next_delay(0, &sample_error()).unwrap();
        // 2^7 = 128ms, minus at most 10% jitter
        assert!(first >= Duration::from_millis(115));
        assert!(first <= Duration::from_millis(128));

        let capped = policy.next_delay(30, &sample_error()).unwrap();
        assert!(capped <= Duration::from_secs(10));
        assert!(capped >= Duration::from_secs(9));
    }

    #[test]
    fn attempt_cap_halts_retries() {
        let policy = ExponentialBackoffWithJitter {
            max_wait: Duration::from_secs(10),
            max_attempts: Some(3),
        };
        assert!(policy.next_delay(0, &sample_error()).is_some());
        assert!(policy.next_delay(2, &sample_error()).is_some());
        assert!(policy.next_delay(3, &sample_error()).is_none());
    }
}
