// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ordered release of acknowledgements for incoming publishes.
//!
//! Received publishes are registered in arrival order and may be marked ready
//! in any order, but are only released to the broker in arrival order: a
//! stalled application callback on an older publish holds back acknowledgement
//! of newer ones, keeping PUBACKs ordered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{AckError, AckErrorKind};

/// Tracking data for one pending incoming publish.
struct PendingAck {
    pkid: u16,
    /// Number of ready-marks remaining before the acknowledgement is released.
    /// A publish dispatched to multiple receivers requires one mark from each.
    remaining: usize,
}

struct Inner {
    pending: VecDeque<PendingAck>,
    /// Incremented when the connection drops. Marks from tokens created under
    /// a previous epoch are rejected as stale rather than silently accepted.
    epoch: u64,
    closed: bool,
}

/// Tracker enforcing broker-order release of incoming publish acknowledgements.
pub(crate) struct AckTracker {
    inner: Mutex<Inner>,
    ready_notify: Notify,
}

impl AckTracker {
    /// Register a received publish as pending acknowledgement.
    ///
    /// Registration order is release order. `marks_required` is the number of
    /// ready-marks (one per dispatched receiver) needed before release; zero
    /// makes the entry immediately releasable, preserving its slot in the
    /// release order.
    ///
    /// Packet identifier 0 (Quality of Service 0) requires no acknowledgement
    /// and is ignored.
    pub fn register(&self, pkid: u16, marks_required: usize) {
        if pkid == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        // A pkid still being tracked means the broker re-delivered before we
        // acknowledged; the duplicate can be discarded by the caller.
        if inner.pending.iter().any(|pending| pending.pkid == pkid) {
            log::warn!("Publish with pkid {pkid} is already pending acknowledgement");
            return;
        }
        inner.pending.push_back(PendingAck {
            pkid,
            remaining: marks_required,
        });
        if marks_required == 0 {
            drop(inner);
            self.ready_notify.notify_one();
        }
    }

    /// Returns true if the pkid is currently tracked.
    pub fn contains(&self, pkid: u16) -> bool {
        self.inner
            .lock()
            .unwrap()
            .pending
            .iter()
            .any(|pending| pending.pkid == pkid)
    }

    /// The current connection epoch, captured into issued [`AckToken`]s.
    pub fn current_epoch(&self) -> u64 {
        self.inner.lock().unwrap().epoch
    }

    /// Record one ready-mark for a pending publish.
    ///
    /// # Errors
    /// [`AckErrorKind::Stale`] if `epoch` predates the current connection.
    /// [`AckErrorKind::AlreadyAcked`] if the publish is not pending (or has
    /// already received all of its marks).
    /// [`AckErrorKind::Detached`] if the tracker has been closed.
    pub fn mark_ready(&self, pkid: u16, epoch: u64) -> Result<(), AckError> {
        if pkid == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(AckError::new(AckErrorKind::Detached));
        }
        if inner.epoch != epoch {
            return Err(AckError::new(AckErrorKind::Stale));
        }
        let Some(pos) = inner.pending.iter().position(|pending| pending.pkid == pkid) else {
            return Err(AckError::new(AckErrorKind::AlreadyAcked));
        };
        let entry = &mut inner.pending[pos];
        if entry.remaining == 0 {
            return Err(AckError::new(AckErrorKind::AlreadyAcked));
        }
        entry.remaining -= 1;
        if entry.remaining == 0 && pos == 0 {
            drop(inner);
            self.ready_notify.notify_one();
        }
        Ok(())
    }

    /// Get the next pkid ready to acknowledge to the broker, in arrival order.
    ///
    /// Waits until the oldest tracked publish has received all of its marks.
    /// This method should not be called in parallel with itself.
    pub async fn next_ready(&self) -> u16 {
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(front) = inner.pending.front() {
                    if front.remaining == 0 {
                        let pending = inner.pending.pop_front();
                        match pending {
                            Some(pending) => {
                                // More entries may already be releasable behind this one
                                if inner.pending.front().is_some_and(|next| next.remaining == 0) {
                                    self.ready_notify.notify_one();
                                }
                                return pending.pkid;
                            }
                            None => unreachable!("front() was Some under the same lock"),
                        }
                    }
                }
            }
            notified.await;
        }
    }

    /// Drop all tracked publishes and advance the epoch.
    ///
    /// Called when the connection drops: the broker will re-deliver anything
    /// unacknowledged, and marks from pre-drop tokens must fail as stale.
    pub fn reset_for_reconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.clear();
        inner.epoch += 1;
    }

    /// Close the tracker. Subsequent marks fail with
    /// [`AckErrorKind::Detached`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.pending.clear();
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        AckTracker {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                epoch: 0,
                closed: false,
            }),
            ready_notify: Notify::new(),
        }
    }
}

/// Token used to acknowledge a received publish from application code.
///
/// The acknowledgement is not transmitted immediately: it is released to the
/// broker once all older received publishes have also been acknowledged.
///
/// Dropping the token unacknowledged records the acknowledgement anyway, so a
/// lost token cannot wedge the ordered release of newer publishes.
pub struct AckToken {
    tracker: Arc<AckTracker>,
    pkid: u16,
    epoch: u64,
    consumed: bool,
}

impl AckToken {
    pub(crate) fn new(tracker: Arc<AckTracker>, pkid: u16, epoch: u64) -> Self {
        Self {
            tracker,
            pkid,
            epoch,
            consumed: false,
        }
    }

    /// Acknowledge the received publish.
    ///
    /// # Errors
    /// [`AckError`] of kind [`AckErrorKind::Stale`](crate::error::AckErrorKind)
    /// if the publish was received before a connection drop; the broker will
    /// re-deliver it and this delivery must not be acknowledged.
    pub fn ack(mut self) -> Result<(), AckError> {
        self.consumed = true;
        self.tracker.mark_ready(self.pkid, self.epoch)
    }

    /// Packet identifier of the publish this token acknowledges.
    #[must_use]
    pub fn pkid(&self) -> u16 {
        self.pkid
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        if !self.consumed {
            if let Err(e) = self.tracker.mark_ready(self.pkid, self.epoch) {
                log::debug!("Auto-ack of dropped token for pkid {} failed: {e}", self.pkid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use test_case::test_case;

    #[test_case(1, 2, 3; "sequential pkids")]
    #[test_case(9, 10, 1; "wrap-around pkids")]
    #[test_case(7, 3, 12; "random pkids")]
    #[tokio::test]
    async fn release_follows_arrival_order(pkid1: u16, pkid2: u16, pkid3: u16) {
        let tracker = Arc::new(AckTracker::default());
        let epoch = tracker.current_epoch();
        tracker.register(pkid1, 1);
        tracker.register(pkid2, 1);
        tracker.register(pkid3, 1);

        let released = tokio::task::spawn({
            let tracker = tracker.clone();
            async move {
                let mut released = Vec::new();
                for _ in 0..3 {
                    released.push(tracker.next_ready().await);
                }
                released
            }
        });

        // Mark out of order: newest first
        tracker.mark_ready(pkid3, epoch).unwrap();
        tracker.mark_ready(pkid2, epoch).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!released.is_finished());

        // Marking the oldest releases all three, in arrival order
        tracker.mark_ready(pkid1, epoch).unwrap();
        assert_eq!(released.await.unwrap(), vec![pkid1, pkid2, pkid3]);
    }

    #[tokio::test]
    async fn multiple_marks_required() {
        let tracker = AckTracker::default();
        let epoch = tracker.current_epoch();
        tracker.register(1, 2);

        tracker.mark_ready(1, epoch).unwrap();
        // Still waiting on the second receiver
        assert!(tracker.contains(1));

        tracker.mark_ready(1, epoch).unwrap();
        assert_eq!(tracker.next_ready().await, 1);
        assert!(!tracker.contains(1));
    }

    #[tokio::test]
    async fn zero_marks_releases_in_order() {
        let tracker = AckTracker::default();
        let epoch = tracker.current_epoch();
        // An unmatched publish (no receivers) still occupies a release slot
        tracker.register(1, 1);
        tracker.register(2, 0);

        tracker.mark_ready(1, epoch).unwrap();
        assert_eq!(tracker.next_ready().await, 1);
        assert_eq!(tracker.next_ready().await, 2);
    }

    #[test]
    fn mark_overflow_rejected() {
        let tracker = AckTracker::default();
        let epoch = tracker.current_epoch();
        tracker.register(1, 1);
        tracker.mark_ready(1, epoch).unwrap();
        assert!(matches!(
            tracker.mark_ready(1, epoch).unwrap_err().kind(),
            AckErrorKind::AlreadyAcked
        ));
    }

    #[test]
    fn stale_epoch_rejected() {
        let tracker = AckTracker::default();
        let epoch = tracker.current_epoch();
        tracker.register(1, 1);

        tracker.reset_for_reconnect();
        assert!(!tracker.contains(1));
        assert!(matches!(
            tracker.mark_ready(1, epoch).unwrap_err().kind(),
            AckErrorKind::Stale
        ));

        // Re-delivery under the new epoch works
        tracker.register(1, 1);
        tracker.mark_ready(1, tracker.current_epoch()).unwrap();
    }

    #[test]
    fn duplicate_registration_ignored() {
        let tracker = AckTracker::default();
        tracker.register(5, 1);
        tracker.register(5, 3);
        let inner = tracker.inner.lock().unwrap();
        assert_eq!(inner.pending.len(), 1);
        assert_eq!(inner.pending[0].remaining, 1);
    }

    #[test]
    fn pkid_zero_ignored() {
        let tracker = AckTracker::default();
        tracker.register(0, 1);
        assert!(!tracker.contains(0));
        assert!(tracker.mark_ready(0, tracker.current_epoch()).is_ok());
    }

    #[tokio::test]
    async fn token_drop_marks_ready() {
        let tracker = Arc::new(AckTracker::default());
        tracker.register(1, 1);
        tracker.register(2, 1);
        let token1 = AckToken::new(tracker.clone(), 1, tracker.current_epoch());
        let token2 = AckToken::new(tracker.clone(), 2, tracker.current_epoch());

        token2.ack().unwrap();
        drop(token1);
        assert_eq!(tracker.next_ready().await, 1);
        assert_eq!(tracker.next_ready().await, 2);
    }

    #[test]
    fn closed_tracker_rejects_marks() {
        let tracker = AckTracker::default();
        tracker.register(1, 1);
        tracker.close();
        assert!(matches!(
            tracker.mark_ready(1, 0).unwrap_err().kind(),
            AckErrorKind::Detached
        ));
    }
}
