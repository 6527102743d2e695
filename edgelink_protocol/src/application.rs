// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Application-wide shared state for the protocol envoys.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::hybrid_logical_clock::{HybridLogicalClock, DEFAULT_MAX_CLOCK_DRIFT};
use crate::common::protocol_error::ProtocolError;
use crate::rpc::dispatcher::DispatcherRegistry;

/// The application-level [`HybridLogicalClock`].
///
/// There is one per [`ApplicationContext`]; updates from concurrent envoys are
/// serialized through a single critical section.
pub struct ApplicationHybridLogicalClock {
    hlc: Mutex<HybridLogicalClock>,
    max_clock_drift: Duration,
}

impl ApplicationHybridLogicalClock {
    /// Creates a new [`ApplicationHybridLogicalClock`] with the provided
    /// maximum clock drift.
    #[must_use]
    pub fn new(max_clock_drift: Duration) -> Self {
        Self {
            hlc: Mutex::new(HybridLogicalClock::new()),
            max_clock_drift,
        }
    }

    /// Returns a snapshot of the current clock value.
    #[must_use]
    pub fn read(&self) -> HybridLogicalClock {
        self.hlc.lock().unwrap().clone()
    }

    /// Advances the clock against the current wall time and returns the
    /// updated value's string encoding, for stamping onto an outgoing message.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`InternalLogicError`](crate::common::protocol_error::ProtocolErrorKind::InternalLogicError)
    /// on counter overflow, or of kind
    /// [`StateInvalid`](crate::common::protocol_error::ProtocolErrorKind::StateInvalid)
    /// if the clock has drifted too far ahead of the wall clock.
    pub fn update_now(&self) -> Result<String, ProtocolError> {
        let mut hlc = self.hlc.lock().unwrap();
        hlc.update_now(self.max_clock_drift)?;
        Ok(hlc.to_string())
    }

    /// Merges a clock received on an incoming message into the application
    /// clock.
    ///
    /// # Errors
    /// As for [`update_now`](Self::update_now).
    pub fn update(&self, other: &HybridLogicalClock) -> Result<(), ProtocolError> {
        let mut hlc = self.hlc.lock().unwrap();
        hlc.update(other, self.max_clock_drift)?;
        Ok(())
    }
}

/// Options for creating an [`ApplicationContext`].
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into))]
pub struct ApplicationContextOptions {
    /// The maximum clock drift allowed for the [`ApplicationHybridLogicalClock`].
    #[builder(default = "DEFAULT_MAX_CLOCK_DRIFT")]
    pub max_clock_drift: Duration,
}

/// Shared state for all envoys in an application.
///
/// <div class="warning"> There should be only one per application. </div>
#[derive(Clone)]
pub struct ApplicationContext {
    /// The [`ApplicationHybridLogicalClock`] used by the application.
    pub application_hlc: Arc<ApplicationHybridLogicalClock>,
    /// Registry of per-client-id dispatchers shared by executors.
    pub(crate) dispatchers: Arc<DispatcherRegistry>,
}

impl ApplicationContext {
    /// Creates a new [`ApplicationContext`] with the provided options.
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(options: ApplicationContextOptions) -> Self {
        Self {
            application_hlc: Arc::new(ApplicationHybridLogicalClock::new(options.max_clock_drift)),
            dispatchers: Arc::new(DispatcherRegistry::default()),
        }
    }
}

impl Default for ApplicationContext {
    fn default() -> Self {
        Self::new(ApplicationContextOptionsBuilder::default().build().expect(
            "ApplicationContextOptions has defaults for every field",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_now_is_monotonic() {
        let app_hlc = ApplicationHybridLogicalClock::new(DEFAULT_MAX_CLOCK_DRIFT);
        let first = app_hlc.update_now().unwrap();
        let second = app_hlc.update_now().unwrap();
        // Fixed-width encoding makes string comparison match clock comparison
        assert!(second > first);
    }

    #[test]
    fn update_merges_remote_clock() {
        let app_hlc = ApplicationHybridLogicalClock::new(DEFAULT_MAX_CLOCK_DRIFT);
        let mut remote = HybridLogicalClock::new();
        remote.timestamp += Duration::from_secs(5);
        remote.counter = 2;

        app_hlc.update(&remote).unwrap();
        assert!(app_hlc.read() > remote);
    }

    #[test]
    fn excessive_drift_rejected() {
        let app_hlc = ApplicationHybridLogicalClock::new(Duration::from_secs(1));
        let mut remote = HybridLogicalClock::new();
        remote.timestamp += Duration::from_secs(300);
        assert!(app_hlc.update(&remote).is_err());
    }
}
