// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory transport for tests: a [`MessageBus`] routes publishes between
//! [`MockTransport`] instances by topic filter, emulating a broker closely
//! enough to exercise session and protocol behavior without a network.
//!
//! Tests script faults on individual transports (failed publishes, dropped
//! connections, custom CONNACKs) to drive the session client's retry and
//! session-loss paths.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection_settings::ConnectionSettings;
use crate::control_packet::{
    AuthProperties, ConnAck, ConnectReasonCode, DisconnectReasonCode, PubAck, PubAckReasonCode,
    Publish, QoS, SubAck, SubAckReasonCode, Subscribe, UnsubAck, UnsubAckReasonCode, Unsubscribe,
};
use crate::error::TransportError;
use crate::interface::{MqttTransport, TransportEvent};
use crate::topic::TopicFilter;

type EventResult = Result<TransportEvent, TransportError>;

struct Subscription {
    /// Filter as subscribed, including any `$share/<group>/` prefix
    raw: String,
    filter: TopicFilter,
    /// Share group parsed from the raw filter, if any
    share_group: Option<String>,
}

struct ClientSlot {
    event_tx: mpsc::UnboundedSender<EventResult>,
    subscriptions: Vec<Subscription>,
    connected: bool,
    previously_connected: bool,
    next_incoming_pkid: u16,
}

#[derive(Default)]
struct BusInner {
    clients: HashMap<usize, ClientSlot>,
    next_client_id: usize,
}

/// An in-memory broker stand-in connecting [`MockTransport`] instances.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MessageBus {
    /// Create a new, empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new transport attached to this bus.
    #[must_use]
    pub fn create_transport(&self) -> MockTransport {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_client_id;
            inner.next_client_id += 1;
            inner.clients.insert(
                id,
                ClientSlot {
                    event_tx,
                    subscriptions: Vec::new(),
                    connected: false,
                    previously_connected: false,
                    next_incoming_pkid: 0,
                },
            );
            id
        };
        MockTransport {
            bus: self.clone(),
            id,
            event_rx: tokio::sync::Mutex::new(event_rx),
            faults: Mutex::new(Faults::default()),
            record: Arc::new(Mutex::new(Record::default())),
        }
    }

    /// Route a publish to every client with a matching subscription.
    ///
    /// Shared subscriptions (`$share/<group>/...`) deliver to one client per
    /// group: the first matching subscriber, emulating broker selection.
    fn route(&self, publish: &Publish) {
        let mut inner = self.inner.lock().unwrap();
        let mut unshared_targets: Vec<usize> = Vec::new();
        let mut share_targets: HashMap<String, usize> = HashMap::new();
        for (id, slot) in &inner.clients {
            for subscription in &slot.subscriptions {
                if !subscription.filter.matches_topic_name(&publish.topic) {
                    continue;
                }
                match &subscription.share_group {
                    Some(group) => {
                        share_targets.entry(group.clone()).or_insert(*id);
                    }
                    None => {
                        unshared_targets.push(*id);
                        break;
                    }
                }
            }
        }
        unshared_targets.extend(share_targets.into_values());
        unshared_targets.sort_unstable();
        unshared_targets.dedup();

        for id in unshared_targets {
            if let Some(slot) = inner.clients.get_mut(&id) {
                let mut delivery = publish.clone();
                delivery.pkid = if publish.qos == QoS::AtMostOnce {
                    0
                } else {
                    // Broker-side pkid assignment for the forwarding direction
                    slot.next_incoming_pkid = slot.next_incoming_pkid.wrapping_add(1).max(1);
                    slot.next_incoming_pkid
                };
                let _ = slot.event_tx.send(Ok(TransportEvent::Publish(delivery)));
            }
        }
    }
}

/// Scripted fault state for one transport.
#[derive(Default)]
struct Faults {
    /// Results returned by upcoming `connect` calls before default behavior resumes
    connect_results: VecDeque<Result<ConnAck, TransportError>>,
    /// Number of upcoming publishes to fail
    fail_publishes: u32,
    /// Whether injected publish failures are retryable
    fail_publishes_retryable: bool,
}

/// Observable side effects recorded by a transport.
#[derive(Default)]
struct Record {
    sent_publishes: Vec<Publish>,
    sent_pubacks: Vec<u16>,
    next_outgoing_pkid: u16,
}

/// A scriptable [`MqttTransport`] attached to a [`MessageBus`].
pub struct MockTransport {
    bus: MessageBus,
    id: usize,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<EventResult>>,
    faults: Mutex<Faults>,
    record: Arc<Mutex<Record>>,
}

impl MockTransport {
    /// Queue a result for an upcoming `connect` call, overriding default
    /// behavior.
    pub fn script_connect_result(&self, result: Result<ConnAck, TransportError>) {
        self.faults
            .lock()
            .unwrap()
            .connect_results
            .push_back(result);
    }

    /// Fail the next `count` publishes with a link failure. When `retryable`
    /// is false the injected failure is a protocol violation instead.
    pub fn fail_next_publishes(&self, count: u32, retryable: bool) {
        let mut faults = self.faults.lock().unwrap();
        faults.fail_publishes = count;
        faults.fail_publishes_retryable = retryable;
    }

    /// Sever the connection, surfacing `reason` through `next_event`.
    pub fn drop_connection(&self, reason: DisconnectReasonCode) {
        let mut inner = self.bus.inner.lock().unwrap();
        if let Some(slot) = inner.clients.get_mut(&self.id) {
            slot.connected = false;
            let _ = slot.event_tx.send(Err(TransportError::Disconnected(reason)));
        }
    }

    /// Inject a publish as if the broker delivered it, bypassing routing.
    /// Assigns an incoming pkid for Quality of Service 1 and above.
    pub fn inject_publish(&self, mut publish: Publish) -> u16 {
        let mut inner = self.bus.inner.lock().unwrap();
        let slot = inner.clients.get_mut(&self.id).expect("client registered");
        if publish.qos != QoS::AtMostOnce && publish.pkid == 0 {
            slot.next_incoming_pkid = slot.next_incoming_pkid.wrapping_add(1).max(1);
            publish.pkid = slot.next_incoming_pkid;
        }
        let pkid = publish.pkid;
        let _ = slot.event_tx.send(Ok(TransportEvent::Publish(publish)));
        pkid
    }

    /// Publishes transmitted by this transport, with their assigned pkids, in
    /// transmission order.
    #[must_use]
    pub fn sent_publishes(&self) -> Vec<Publish> {
        self.record.lock().unwrap().sent_publishes.clone()
    }

    /// PUBACKs transmitted by this transport, in transmission order.
    #[must_use]
    pub fn sent_pubacks(&self) -> Vec<u16> {
        self.record.lock().unwrap().sent_pubacks.clone()
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut ClientSlot) -> R) -> R {
        let mut inner = self.bus.inner.lock().unwrap();
        let slot = inner.clients.get_mut(&self.id).expect("client registered");
        f(slot)
    }
}

#[async_trait]
impl MqttTransport for MockTransport {
    async fn connect(
        &self,
        _settings: &ConnectionSettings,
        clean_start: bool,
    ) -> Result<ConnAck, TransportError> {
        let scripted = self.faults.lock().unwrap().connect_results.pop_front();
        if let Some(result) = scripted {
            if result.is_ok() {
                self.with_slot(|slot| {
                    slot.connected = true;
                    slot.previously_connected = true;
                });
            }
            return result;
        }
        self.with_slot(|slot| {
            let session_present = !clean_start && slot.previously_connected;
            if clean_start {
                slot.subscriptions.clear();
            }
            slot.connected = true;
            slot.previously_connected = true;
            Ok(ConnAck {
                session_present,
                reason_code: ConnectReasonCode::Success,
                assigned_client_identifier: None,
            })
        })
    }

    async fn publish(&self, mut publish: Publish) -> Result<PubAck, TransportError> {
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.fail_publishes > 0 {
                faults.fail_publishes -= 1;
                return Err(if faults.fail_publishes_retryable {
                    TransportError::LinkClosed
                } else {
                    TransportError::Protocol("injected fatal publish failure".to_string())
                });
            }
        }
        if !self.with_slot(|slot| slot.connected) {
            return Err(TransportError::LinkClosed);
        }

        if publish.qos != QoS::AtMostOnce {
            let mut record = self.record.lock().unwrap();
            record.next_outgoing_pkid = record.next_outgoing_pkid.wrapping_add(1).max(1);
            publish.pkid = record.next_outgoing_pkid;
        }
        self.record
            .lock()
            .unwrap()
            .sent_publishes
            .push(publish.clone());

        self.bus.route(&publish);
        Ok(PubAck {
            pkid: publish.pkid,
            reason_code: PubAckReasonCode::Success,
        })
    }

    async fn subscribe(&self, subscribe: Subscribe) -> Result<SubAck, TransportError> {
        if !self.with_slot(|slot| slot.connected) {
            return Err(TransportError::LinkClosed);
        }
        let filter = TopicFilter::from_str(&subscribe.topic_filter)
            .map_err(|e| TransportError::Protocol(format!("invalid topic filter: {e}")))?;
        let share_group = subscribe
            .topic_filter
            .strip_prefix("$share/")
            .and_then(|rest| rest.split_once('/'))
            .map(|(group, _)| group.to_string());
        self.with_slot(|slot| {
            slot.subscriptions.retain(|s| s.raw != subscribe.topic_filter);
            slot.subscriptions.push(Subscription {
                raw: subscribe.topic_filter.clone(),
                filter,
                share_group,
            });
        });
        let reason_code = match subscribe.qos {
            QoS::AtMostOnce => SubAckReasonCode::GrantedQoS0,
            QoS::AtLeastOnce => SubAckReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => SubAckReasonCode::GrantedQoS2,
        };
        Ok(SubAck {
            pkid: 0,
            reason_code,
        })
    }

    async fn unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<UnsubAck, TransportError> {
        if !self.with_slot(|slot| slot.connected) {
            return Err(TransportError::LinkClosed);
        }
        let existed = self.with_slot(|slot| {
            let before = slot.subscriptions.len();
            slot.subscriptions
                .retain(|s| s.raw != unsubscribe.topic_filter);
            before != slot.subscriptions.len()
        });
        Ok(UnsubAck {
            pkid: 0,
            reason_code: if existed {
                UnsubAckReasonCode::Success
            } else {
                UnsubAckReasonCode::NoSubscriptionExisted
            },
        })
    }

    async fn ack(&self, pkid: u16) -> Result<(), TransportError> {
        if !self.with_slot(|slot| slot.connected) {
            return Err(TransportError::LinkClosed);
        }
        self.record.lock().unwrap().sent_pubacks.push(pkid);
        Ok(())
    }

    async fn send_auth(&self, _auth: AuthProperties) -> Result<(), TransportError> {
        if !self.with_slot(|slot| slot.connected) {
            return Err(TransportError::LinkClosed);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.with_slot(|slot| {
            slot.connected = false;
            let _ = slot
                .event_tx
                .send(Err(TransportError::Disconnected(
                    DisconnectReasonCode::NormalDisconnection,
                )));
        });
        Ok(())
    }

    async fn next_event(&self) -> Result<TransportEvent, TransportError> {
        let mut event_rx = self.event_rx.lock().await;
        match event_rx.recv().await {
            Some(event) => event,
            None => Err(TransportError::LinkClosed),
        }
    }
}
