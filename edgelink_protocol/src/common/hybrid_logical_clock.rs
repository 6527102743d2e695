// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hybrid Logical Clock: monotonic causal timestamps with bounded skew
//! detection, attached to every request, response, and telemetry message.

use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use uuid::Uuid;

/// Recommended default value for max clock drift if not specified.
pub const DEFAULT_MAX_CLOCK_DRIFT: Duration = Duration::from_secs(60);

/// Hybrid Logical Clock (HLC) generating unique, causally ordered timestamps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HybridLogicalClock {
    /// Current timestamp, at millisecond precision.
    pub timestamp: SystemTime,
    /// Counter disambiguating events that share a wall-clock millisecond
    /// across nodes with slightly differing system clocks.
    pub counter: u32,
    /// Unique identifier for this node.
    pub node_id: String,
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLogicalClock {
    /// Creates a new [`HybridLogicalClock`] at the current wall time, with a
    /// counter of 0 and a freshly generated node identifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: now_ms_precision(),
            counter: 0,
            node_id: Uuid::new_v4().to_string(),
        }
    }

    /// Merge another [`HybridLogicalClock`] into this one.
    ///
    /// The result compares greater than or equal to both inputs and never runs
    /// behind the local wall clock. An update against a clock with the same
    /// node id is a no-op.
    ///
    /// # Errors
    /// [`HlcError`] of kind [`HlcErrorKind::OverflowWarning`] if the counter
    /// would overflow, or of kind [`HlcErrorKind::ClockDrift`] if the winning
    /// timestamp is more than `max_clock_drift` ahead of the local wall clock.
    pub fn update(
        &mut self,
        other: &HybridLogicalClock,
        max_clock_drift: Duration,
    ) -> Result<(), HlcError> {
        if self.node_id == other.node_id {
            return Ok(());
        }
        let now = now_ms_precision();

        if now > self.timestamp && now > other.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else if self.timestamp == other.timestamp {
            if self.counter >= other.counter {
                self.validate(now, max_clock_drift)?;
                self.counter += 1;
            } else {
                // Same timestamp, so validating other covers self as well
                other.validate(now, max_clock_drift)?;
                self.counter = other.counter + 1;
            }
        } else if self.timestamp > other.timestamp {
            self.validate(now, max_clock_drift)?;
            self.counter += 1;
        } else {
            other.validate(now, max_clock_drift)?;
            self.timestamp = other.timestamp;
            self.counter = other.counter + 1;
        }
        Ok(())
    }

    /// Advance this [`HybridLogicalClock`] against the current wall time, as
    /// if updating against a fresh clock reading taken now.
    ///
    /// # Errors
    /// [`HlcError`] of kind [`HlcErrorKind::OverflowWarning`] if the counter
    /// would overflow, or of kind [`HlcErrorKind::ClockDrift`] if this clock
    /// is more than `max_clock_drift` ahead of the local wall clock.
    pub fn update_now(&mut self, max_clock_drift: Duration) -> Result<(), HlcError> {
        let now = now_ms_precision();
        if now > self.timestamp {
            self.timestamp = now;
            self.counter = 0;
        } else {
            self.validate(now, max_clock_drift)?;
            self.counter += 1;
        }
        Ok(())
    }

    /// Validates that the clock is not too far ahead of the wall clock and
    /// that the counter can be incremented.
    fn validate(&self, now: SystemTime, max_clock_drift: Duration) -> Result<(), HlcError> {
        if self.counter == u32::MAX {
            return Err(HlcErrorKind::OverflowWarning)?;
        }
        if let Ok(ahead) = self.timestamp.duration_since(now) {
            if ahead > max_clock_drift {
                return Err(HlcErrorKind::ClockDrift)?;
            }
        } // a clock behind the wall clock is fine; only the future is bounded
        Ok(())
    }
}

impl PartialOrd for HybridLogicalClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridLogicalClock {
    /// Lexicographic comparison on (timestamp, counter, node id).
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl Display for HybridLogicalClock {
    /// Encodes as `NNNNNNNNNNNNNNN:CCCCC:node`: milliseconds since the Unix
    /// epoch zero-padded to 15 characters, then the counter zero-padded to 5.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms_since_epoch = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        write!(
            f,
            "{:0>15}:{:0>5}:{}",
            ms_since_epoch, self.counter, self.node_id
        )
    }
}

impl FromStr for HybridLogicalClock {
    type Err = ParseHlcError;

    fn from_str(s: &str) -> Result<Self, ParseHlcError> {
        let mut parts = s.splitn(3, ':');
        let (Some(timestamp_part), Some(counter_part), Some(node_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseHlcError {
                message: "Malformed HLC. Expected three colon-separated segments".to_string(),
                input: s.to_string(),
            });
        };

        let ms_since_epoch = timestamp_part.parse::<u64>().map_err(|e| ParseHlcError {
            message: format!("Malformed HLC. Could not parse first segment as an integer: {e}"),
            input: s.to_string(),
        })?;
        let Some(timestamp) = UNIX_EPOCH.checked_add(Duration::from_millis(ms_since_epoch)) else {
            return Err(ParseHlcError {
                message: "Malformed HLC. Timestamp is out of range".to_string(),
                input: s.to_string(),
            });
        };

        let counter = counter_part.parse::<u32>().map_err(|e| ParseHlcError {
            message: format!("Malformed HLC. Could not parse second segment as an integer: {e}"),
            input: s.to_string(),
        })?;

        if node_id.is_empty() {
            return Err(ParseHlcError {
                message: "Malformed HLC. Node id is empty".to_string(),
                input: s.to_string(),
            });
        }

        Ok(Self {
            timestamp,
            counter,
            node_id: node_id.to_string(),
        })
    }
}

/// All HLCs are rounded to the nearest millisecond so that the string encoding
/// round-trips; wall clock readings are rounded the same way.
fn now_ms_precision() -> SystemTime {
    #[cfg(not(test))]
    let now = SystemTime::now();

    // allow setting an offset for testing
    #[cfg(test)]
    let now = {
        let offset = TIME_OFFSET.with(std::cell::Cell::get);
        let positive = TIME_OFFSET_POS.with(std::cell::Cell::get);
        if positive {
            SystemTime::now().checked_add(offset).unwrap()
        } else {
            SystemTime::now().checked_sub(offset).unwrap()
        }
    };

    if let Ok(since_epoch) = now.duration_since(UNIX_EPOCH) {
        let rounded = Duration::new(since_epoch.as_secs(), since_epoch.subsec_millis() * 1_000_000);
        if let Some(now) = UNIX_EPOCH.checked_add(rounded) {
            return now;
        }
    }
    log::warn!("Error rounding the current time to millisecond precision. Using unrounded time.");
    now
}

/// Represents errors that occur in the use of an HLC
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HlcError(#[from] HlcErrorKind);

impl HlcError {
    /// Returns the corresponding [`HlcErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &HlcErrorKind {
        &self.0
    }
}

/// A list specifying categories of HLC error
#[derive(Debug, Error)]
pub enum HlcErrorKind {
    /// The counter cannot be incremented without overflowing
    #[error("counter cannot be incremented")]
    OverflowWarning,
    /// The HLC's timestamp is too far in the future compared to the current time
    #[error("exceeds max clock drift")]
    ClockDrift,
}

/// Represents errors that occur when parsing an HLC from a string
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ParseHlcError {
    /// The error message
    pub(crate) message: String,
    /// The input string that failed to parse
    pub(crate) input: String,
}

// Functions to allow manipulation of the system time for testing purposes
#[cfg(test)]
use std::cell::Cell;

#[cfg(test)]
thread_local! {
    static TIME_OFFSET: Cell<Duration> = const { Cell::new(Duration::from_secs(0)) };
    static TIME_OFFSET_POS: Cell<bool> = const { Cell::new(false) };
}

#[cfg(test)]
fn set_time_offset(offset: Duration, positive: bool) {
    TIME_OFFSET.with(|time_offset| time_offset.set(offset));
    TIME_OFFSET_POS.with(|time_offset_pos| time_offset_pos.set(positive));
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    fn fixed_hlc(ms: u64, counter: u32, node_id: &str) -> HybridLogicalClock {
        HybridLogicalClock {
            timestamp: UNIX_EPOCH + Duration::from_millis(ms),
            counter,
            node_id: node_id.to_string(),
        }
    }

    #[test]
    fn display_format_is_fixed_width() {
        let hlc = fixed_hlc(0, 0, "00000000-0000-0000-0000-000000000000");
        assert_eq!(
            hlc.to_string(),
            "000000000000000:00000:00000000-0000-0000-0000-000000000000"
        );

        let hlc = fixed_hlc(1_700_000_000_123, 42, "node-a");
        assert_eq!(hlc.to_string(), "001700000000123:00042:node-a");
    }

    #[test]
    fn encode_decode_round_trip() {
        let hlc = HybridLogicalClock::new();
        let parsed: HybridLogicalClock = hlc.to_string().parse().unwrap();
        assert_eq!(parsed, hlc);
    }

    #[test]
    fn decode_preserves_node_id_with_colons() {
        // Only the first two segments are positional; the node id may itself
        // contain colons
        let parsed: HybridLogicalClock = "000000000000005:00001:node:with:colons".parse().unwrap();
        assert_eq!(parsed.node_id, "node:with:colons");
    }

    #[test_case("foo:bar:node"; "non numeric segments")]
    #[test_case(""; "empty")]
    #[test_case("123:45"; "two segments")]
    #[test_case("123:99999999999:node"; "counter overflows u32")]
    #[test_case("000000000000005:00001:"; "empty node id")]
    fn decode_malformed(input: &str) {
        let err = input.parse::<HybridLogicalClock>().unwrap_err();
        assert_eq!(err.input, input);
    }

    #[test]
    fn comparison_is_lexicographic() {
        let a = fixed_hlc(100, 0, "a");
        let b = fixed_hlc(100, 1, "a");
        let c = fixed_hlc(101, 0, "a");
        let d = fixed_hlc(100, 0, "b");
        assert!(a < b);
        assert!(b < c);
        assert!(a < d);
        assert!(d < b);
    }

    #[test]
    fn update_monotonicity() {
        let mut local = HybridLogicalClock::new();
        // A remote clock slightly in the future, to force the merge path
        let mut remote = HybridLogicalClock::new();
        remote.timestamp += Duration::from_secs(5);
        remote.counter = 3;

        let prior = local.clone();
        local.update(&remote, DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert!(local > prior);
        assert!(local > remote);
    }

    #[test]
    fn update_now_monotonicity() {
        let mut hlc = HybridLogicalClock::new();
        let prior = hlc.clone();
        hlc.update_now(DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert!(hlc > prior);
        // Either the wall clock advanced (counter reset) or it did not
        // (counter incremented once)
        assert!(hlc.counter <= 1);
    }

    #[test]
    fn update_from_same_node_is_noop() {
        let mut hlc = HybridLogicalClock::new();
        let mut other = hlc.clone();
        other.timestamp += Duration::from_secs(30);
        other.counter = 17;

        let prior = hlc.clone();
        hlc.update(&other, DEFAULT_MAX_CLOCK_DRIFT).unwrap();
        assert_eq!(hlc, prior);
    }

    #[test_case(120, false; "remote beyond max drift fails")]
    #[test_case(30, true; "remote within max drift succeeds")]
    fn update_drift_bound(offset_sec: u64, should_succeed: bool) {
        let mut local = HybridLogicalClock::new();
        let mut remote = HybridLogicalClock::new();
        remote.timestamp += Duration::from_secs(offset_sec);

        match local.update(&remote, DEFAULT_MAX_CLOCK_DRIFT) {
            Ok(()) => assert!(should_succeed),
            Err(e) => {
                assert!(!should_succeed);
                assert!(matches!(e.kind(), HlcErrorKind::ClockDrift));
                // local must be untouched on failure
                assert_eq!(local.counter, 0);
            }
        }
    }

    #[test]
    fn update_now_drift_bound() {
        set_time_offset(Duration::from_secs(120), false);
        let mut hlc = HybridLogicalClock::new();
        set_time_offset(Duration::from_secs(0), true);
        // The HLC is now 2 minutes in the past relative to the wall clock,
        // which is fine
        assert!(hlc.update_now(DEFAULT_MAX_CLOCK_DRIFT).is_ok());

        set_time_offset(Duration::from_secs(120), true);
        let mut hlc = HybridLogicalClock::new();
        set_time_offset(Duration::from_secs(0), true);
        // The HLC is 2 minutes in the future, beyond the drift bound
        let err = hlc.update_now(DEFAULT_MAX_CLOCK_DRIFT).unwrap_err();
        assert!(matches!(err.kind(), HlcErrorKind::ClockDrift));
    }

    #[test]
    fn counter_overflow_rejected() {
        // A future timestamp forces the increment path rather than a reset
        set_time_offset(Duration::from_secs(30), true);
        let mut hlc = HybridLogicalClock::new();
        set_time_offset(Duration::from_secs(0), true);
        hlc.counter = u32::MAX;

        let err = hlc.update_now(DEFAULT_MAX_CLOCK_DRIFT).unwrap_err();
        assert!(matches!(err.kind(), HlcErrorKind::OverflowWarning));
        assert_eq!(hlc.counter, u32::MAX);
    }

    #[test]
    fn timestamps_round_to_milliseconds() {
        let hlc = HybridLogicalClock::new();
        assert_eq!(
            hlc.timestamp.duration_since(UNIX_EPOCH).unwrap().as_nanos() % 1_000_000,
            0
        );
    }
}
