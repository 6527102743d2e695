// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fan-out of incoming publishes to filtered receivers.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::control_packet::Publish;
use crate::interface::MessageReceiver;
use crate::session::ack_tracker::{AckToken, AckTracker};
use crate::topic::{TopicFilter, TopicParseError};

/// A registered receiver's sending half.
struct FilterEntry {
    filter: TopicFilter,
    tx: mpsc::UnboundedSender<(Publish, Option<AckToken>)>,
}

/// Registry of filtered receivers attached to a session client.
#[derive(Default)]
pub(crate) struct ReceiverRegistry {
    entries: Mutex<Vec<FilterEntry>>,
}

impl ReceiverRegistry {
    /// Register a new filtered receiver.
    ///
    /// # Errors
    /// [`TopicParseError`] if the topic filter is invalid.
    pub fn register(
        self: &Arc<Self>,
        topic_filter: &str,
        auto_ack: bool,
    ) -> Result<SessionMessageReceiver, TopicParseError> {
        let filter = TopicFilter::from_str(topic_filter)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.lock().unwrap().push(FilterEntry { filter, tx });
        Ok(SessionMessageReceiver { rx, auto_ack })
    }

    /// Dispatch an incoming publish to every receiver whose filter matches.
    ///
    /// Registers the publish with the ack tracker first (one required mark per
    /// matching receiver, zero when nothing matches so the release slot is not
    /// held), then delivers a token-carrying copy to each receiver.
    pub fn dispatch(&self, publish: &Publish, tracker: &Arc<AckTracker>) {
        let mut entries = self.entries.lock().unwrap();
        // Receivers whose channel has closed no longer participate
        entries.retain(|entry| !entry.tx.is_closed());

        let matching: Vec<&FilterEntry> = entries
            .iter()
            .filter(|entry| entry.filter.matches_topic_name(&publish.topic))
            .collect();

        tracker.register(publish.pkid, matching.len());
        if matching.is_empty() {
            log::warn!(
                "No receiver registered for incoming publish on topic '{}'",
                publish.topic
            );
            return;
        }

        let epoch = tracker.current_epoch();
        for entry in matching {
            let token = if publish.pkid == 0 {
                None
            } else {
                Some(AckToken::new(tracker.clone(), publish.pkid, epoch))
            };
            // A send failure means the receiver closed between the retain
            // above and now; the dropped token marks its share ready.
            if entry.tx.send((publish.clone(), token)).is_err() {
                log::debug!(
                    "Receiver for '{}' closed during dispatch of pkid {}",
                    entry.filter,
                    publish.pkid
                );
            }
        }
    }

    /// Close all receiver channels.
    pub fn close_all(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Receiver for incoming publishes matching one topic filter.
pub struct SessionMessageReceiver {
    rx: mpsc::UnboundedReceiver<(Publish, Option<AckToken>)>,
    auto_ack: bool,
}

#[async_trait]
impl MessageReceiver for SessionMessageReceiver {
    async fn recv(&mut self) -> Option<(Publish, Option<AckToken>)> {
        let (publish, token) = self.rx.recv().await?;
        if self.auto_ack {
            if let Some(token) = token {
                if let Err(e) = token.ack() {
                    log::debug!("Auto-ack failed for pkid {}: {e}", publish.pkid);
                }
            }
            Some((publish, None))
        } else {
            Some((publish, token))
        }
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

impl Drop for SessionMessageReceiver {
    fn drop(&mut self) {
        // Drain undelivered publishes so their tokens mark themselves ready;
        // otherwise the ordered release of newer acknowledgements would be
        // held up forever by messages nobody will ever receive.
        self.rx.close();
        while let Ok((publish, token)) = self.rx.try_recv() {
            if token.is_some() {
                log::warn!(
                    "Dropping receiver with unacked publish (pkid {}); auto-acking",
                    publish.pkid
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::control_packet::QoS;

    fn publish(topic: &str, pkid: u16) -> Publish {
        let mut publish = Publish::new(topic, QoS::AtLeastOnce, "payload", None);
        publish.pkid = pkid;
        publish
    }

    #[tokio::test]
    async fn dispatch_routes_by_filter() {
        let registry = Arc::new(ReceiverRegistry::default());
        let tracker = Arc::new(AckTracker::default());
        let mut sensors = registry.register("sensors/+", false).unwrap();
        let mut actuators = registry.register("actuators/+", false).unwrap();

        registry.dispatch(&publish("sensors/temp", 1), &tracker);
        registry.dispatch(&publish("actuators/valve", 2), &tracker);

        let (received, token) = sensors.recv().await.unwrap();
        assert_eq!(received.topic, "sensors/temp");
        assert_eq!(token.unwrap().pkid(), 1);

        let (received, _token) = actuators.recv().await.unwrap();
        assert_eq!(received.topic, "actuators/valve");
    }

    #[tokio::test]
    async fn multi_receiver_dispatch_requires_all_marks() {
        let registry = Arc::new(ReceiverRegistry::default());
        let tracker = Arc::new(AckTracker::default());
        let mut rx1 = registry.register("shared/topic", false).unwrap();
        let mut rx2 = registry.register("shared/#", false).unwrap();

        registry.dispatch(&publish("shared/topic", 1), &tracker);

        let (_, token1) = rx1.recv().await.unwrap();
        let (_, token2) = rx2.recv().await.unwrap();

        token1.unwrap().ack().unwrap();
        // One of two marks recorded; the publish is still pending
        assert!(tracker.contains(1));
        token2.unwrap().ack().unwrap();
        assert_eq!(tracker.next_ready().await, 1);
    }

    #[tokio::test]
    async fn unmatched_publish_released_immediately() {
        let registry = Arc::new(ReceiverRegistry::default());
        let tracker = Arc::new(AckTracker::default());
        registry.dispatch(&publish("nobody/listening", 3), &tracker);
        assert_eq!(tracker.next_ready().await, 3);
    }

    #[tokio::test]
    async fn auto_ack_receiver_marks_on_recv() {
        let registry = Arc::new(ReceiverRegistry::default());
        let tracker = Arc::new(AckTracker::default());
        let mut rx = registry.register("auto/topic", true).unwrap();

        registry.dispatch(&publish("auto/topic", 4), &tracker);
        // Not yet received, so not yet ready
        assert!(tracker.contains(4));

        let (_, token) = rx.recv().await.unwrap();
        assert!(token.is_none());
        assert_eq!(tracker.next_ready().await, 4);
    }

    #[tokio::test]
    async fn dropped_receiver_releases_pending_publishes() {
        let registry = Arc::new(ReceiverRegistry::default());
        let tracker = Arc::new(AckTracker::default());
        let rx = registry.register("doomed/topic", false).unwrap();

        registry.dispatch(&publish("doomed/topic", 5), &tracker);
        drop(rx);
        assert_eq!(tracker.next_ready().await, 5);
    }

    #[tokio::test]
    async fn qos0_dispatch_has_no_token() {
        let registry = Arc::new(ReceiverRegistry::default());
        let tracker = Arc::new(AckTracker::default());
        let mut rx = registry.register("fire/forget", false).unwrap();

        let mut msg = publish("fire/forget", 0);
        msg.qos = QoS::AtMostOnce;
        registry.dispatch(&msg, &tracker);

        let (_, token) = rx.recv().await.unwrap();
        assert!(token.is_none());
    }
}
