// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end session client tests against the in-memory mock transport.

use std::sync::Arc;
use std::time::Duration;

use edgelink_mqtt::control_packet::{
    ConnAck, ConnectReasonCode, DisconnectReasonCode, Publish, QoS, Subscribe,
};
use edgelink_mqtt::error::{SessionErrorKind, TransportError};
use edgelink_mqtt::interface::{ManagedClient, MessageReceiver};
use edgelink_mqtt::mock::{MessageBus, MockTransport};
use edgelink_mqtt::session::reconnect_policy::ExponentialBackoffWithJitter;
use edgelink_mqtt::session::{SessionClient, SessionEvent, SessionOptionsBuilder};
use edgelink_mqtt::{ConnectionSettings, ConnectionSettingsBuilder};

fn init_logging() {
    let _ = env_logger::builder().format_timestamp(None).is_test(true).try_init();
}

fn settings(client_id: &str) -> ConnectionSettings {
    ConnectionSettingsBuilder::default()
        .client_id(client_id)
        .hostname("localhost")
        .tcp_port(1883u16)
        .build()
        .unwrap()
}

fn session(bus: &MessageBus, client_id: &str) -> (SessionClient<ArcTransport>, Arc<MockTransport>) {
    init_logging();
    // Keep an extra handle to the transport for scripting and assertions
    let transport = Arc::new(bus.create_transport());
    let options = SessionOptionsBuilder::default()
        .connection_settings(settings(client_id))
        .retry_policy(Arc::new(ExponentialBackoffWithJitter {
            max_wait: Duration::from_millis(200),
            max_attempts: None,
        }) as Arc<dyn edgelink_mqtt::session::reconnect_policy::RetryPolicy>)
        .build()
        .unwrap();
    (SessionClient::new(ArcTransport(transport.clone()), options), transport)
}

/// Forwarding wrapper so tests can keep scripting the transport after the
/// session client takes ownership.
struct ArcTransport(Arc<MockTransport>);

#[async_trait::async_trait]
impl edgelink_mqtt::interface::MqttTransport for ArcTransport {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        clean_start: bool,
    ) -> Result<ConnAck, TransportError> {
        self.0.connect(settings, clean_start).await
    }
    async fn publish(
        &self,
        publish: Publish,
    ) -> Result<edgelink_mqtt::control_packet::PubAck, TransportError> {
        self.0.publish(publish).await
    }
    async fn subscribe(
        &self,
        subscribe: Subscribe,
    ) -> Result<edgelink_mqtt::control_packet::SubAck, TransportError> {
        self.0.subscribe(subscribe).await
    }
    async fn unsubscribe(
        &self,
        unsubscribe: edgelink_mqtt::control_packet::Unsubscribe,
    ) -> Result<edgelink_mqtt::control_packet::UnsubAck, TransportError> {
        self.0.unsubscribe(unsubscribe).await
    }
    async fn ack(&self, pkid: u16) -> Result<(), TransportError> {
        self.0.ack(pkid).await
    }
    async fn send_auth(
        &self,
        auth: edgelink_mqtt::control_packet::AuthProperties,
    ) -> Result<(), TransportError> {
        self.0.send_auth(auth).await
    }
    async fn disconnect(&self) -> Result<(), TransportError> {
        self.0.disconnect().await
    }
    async fn next_event(
        &self,
    ) -> Result<edgelink_mqtt::interface::TransportEvent, TransportError> {
        self.0.next_event().await
    }
}

/// Poll `condition` until it holds or the timeout elapses.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn publishes_transmitted_in_submission_order() {
    let bus = MessageBus::new();
    let (client, transport) = session(&bus, "fifo-client");
    client.connect().await.unwrap();

    let p1 = client.publish(Publish::new("order/first", QoS::AtLeastOnce, "1", None));
    let p2 = client.publish(Publish::new("order/second", QoS::AtLeastOnce, "2", None));
    let p3 = client.publish(Publish::new("order/third", QoS::AtLeastOnce, "3", None));
    // join! polls in order, so submission order is first, second, third
    let (r1, r2, r3) = tokio::join!(p1, p2, p3);

    let ack1 = r1.unwrap();
    let ack2 = r2.unwrap();
    let ack3 = r3.unwrap();
    assert!(ack1.pkid < ack2.pkid);
    assert!(ack2.pkid < ack3.pkid);

    let sent = transport.sent_publishes();
    let topics: Vec<&str> = sent.iter().map(|p| p.topic.as_str()).collect();
    assert_eq!(topics, vec!["order/first", "order/second", "order/third"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_retried_after_retryable_transport_failure() {
    let bus = MessageBus::new();
    let (client, transport) = session(&bus, "retry-client");
    client.connect().await.unwrap();

    // First transmission attempt fails; the reconfigured transport then succeeds
    transport.fail_next_publishes(1, true);
    let ack = client
        .publish(Publish::new("retry/topic", QoS::AtLeastOnce, "p", None))
        .await
        .unwrap();

    // No caller-visible error, and exactly one successful transmission
    assert_eq!(ack.pkid, 1);
    assert_eq!(transport.sent_publishes().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn ack_ordering_held_by_earlier_publish() {
    let bus = MessageBus::new();
    let (client, transport) = session(&bus, "ack-client");
    client.connect().await.unwrap();

    let mut receiver = client.create_filtered_receiver("commands/+", false).unwrap();

    let mut m1 = Publish::new("commands/a", QoS::AtLeastOnce, "m1", None);
    m1.properties = Some(edgelink_mqtt::control_packet::PublishProperties {
        correlation_data: Some(bytes::Bytes::from_static(&[1])),
        ..Default::default()
    });
    let mut m2 = Publish::new("commands/b", QoS::AtLeastOnce, "m2", None);
    m2.properties = Some(edgelink_mqtt::control_packet::PublishProperties {
        correlation_data: Some(bytes::Bytes::from_static(&[2])),
        ..Default::default()
    });
    let pkid1 = transport.inject_publish(m1);
    let pkid2 = transport.inject_publish(m2);

    let (received1, token1) = receiver.recv().await.unwrap();
    let (received2, token2) = receiver.recv().await.unwrap();
    assert_eq!(received1.payload.as_ref(), b"m1");
    assert_eq!(received2.payload.as_ref(), b"m2");

    // Application acknowledges the second message first: no PUBACK may be sent
    token2.unwrap().ack().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(transport.sent_pubacks().is_empty());

    // Acknowledging the first releases both, in order
    token1.unwrap().ack().unwrap();
    wait_until(|| transport.sent_pubacks().len() == 2).await;
    assert_eq!(transport.sent_pubacks(), vec![pkid1, pkid2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_exhaustion_fails_pending_and_fires_session_lost() {
    let bus = MessageBus::new();
    let transport = Arc::new(bus.create_transport());
    let options = SessionOptionsBuilder::default()
        .connection_settings(settings("exhaust-client"))
        .retry_policy(Arc::new(ExponentialBackoffWithJitter {
            max_wait: Duration::from_millis(100),
            max_attempts: Some(2),
        }) as Arc<dyn edgelink_mqtt::session::reconnect_policy::RetryPolicy>)
        .build()
        .unwrap();
    let client = SessionClient::new(ArcTransport(transport.clone()), options);
    let mut events = client.events().unwrap();
    client.connect().await.unwrap();
    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::Connected { .. })
    ));

    // Every transmission and reconnect attempt fails
    transport.fail_next_publishes(100, true);
    transport.script_connect_result(Err(TransportError::LinkClosed));
    transport.script_connect_result(Err(TransportError::LinkClosed));

    let result = client
        .publish(Publish::new("doomed/topic", QoS::AtLeastOnce, "p", None))
        .await;
    assert!(matches!(
        result.unwrap_err().kind(),
        SessionErrorKind::RetryExpired
    ));

    assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected)));
    match events.recv().await {
        Some(SessionEvent::SessionLost { error }) => {
            assert!(matches!(error.kind(), SessionErrorKind::RetryExpired));
        }
        other => panic!("expected SessionLost, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn absent_session_state_on_reconnect_expires_session() {
    let bus = MessageBus::new();
    let (client, transport) = session(&bus, "expire-client");
    let mut events = client.events().unwrap();
    client.connect().await.unwrap();
    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::Connected { .. })
    ));

    // Force the in-flight publish to fail, then have the reconnect come back
    // without session state
    transport.fail_next_publishes(100, true);
    transport.script_connect_result(Ok(ConnAck {
        session_present: false,
        reason_code: ConnectReasonCode::Success,
        assigned_client_identifier: None,
    }));

    let result = client
        .publish(Publish::new("lost/topic", QoS::AtLeastOnce, "p", None))
        .await;
    assert!(matches!(
        result.unwrap_err().kind(),
        SessionErrorKind::SessionExpired
    ));

    assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected)));
    match events.recv().await {
        Some(SessionEvent::SessionLost { error }) => {
            assert!(matches!(error.kind(), SessionErrorKind::SessionExpired));
        }
        other => panic!("expected SessionLost, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_disconnect_reason_ends_session() {
    let bus = MessageBus::new();
    let (client, transport) = session(&bus, "fatal-client");
    let mut events = client.events().unwrap();
    client.connect().await.unwrap();
    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::Connected { .. })
    ));

    transport.drop_connection(DisconnectReasonCode::SessionTakenOver);

    assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected)));
    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::SessionLost { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn close_rejects_all_operations() {
    let bus = MessageBus::new();
    let (client, _transport) = session(&bus, "closed-client");
    client.connect().await.unwrap();
    client.close().await;

    assert!(matches!(
        client.connect().await.unwrap_err().kind(),
        SessionErrorKind::Disposed
    ));
    assert!(matches!(
        client.disconnect().await.unwrap_err().kind(),
        SessionErrorKind::Disposed
    ));
    assert!(matches!(
        client.reconnect().await.unwrap_err().kind(),
        SessionErrorKind::Disposed
    ));
    assert!(matches!(
        client
            .publish(Publish::new("t", QoS::AtLeastOnce, "p", None))
            .await
            .unwrap_err()
            .kind(),
        SessionErrorKind::Disposed
    ));
    assert!(matches!(
        client
            .subscribe(Subscribe::new("t", QoS::AtLeastOnce))
            .await
            .unwrap_err()
            .kind(),
        SessionErrorKind::Disposed
    ));
    assert!(matches!(
        client
            .unsubscribe(edgelink_mqtt::control_packet::Unsubscribe::new("t"))
            .await
            .unwrap_err()
            .kind(),
        SessionErrorKind::Disposed
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_then_reconnect_preserves_session() {
    let bus = MessageBus::new();
    let (client, _transport) = session(&bus, "cycle-client");
    let mut events = client.events().unwrap();
    client.connect().await.unwrap();
    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::Connected { .. })
    ));

    client.disconnect().await.unwrap();
    // Wait for the connection task to observe the disconnect before reconnecting
    assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected)));
    let connack = client.reconnect().await.unwrap();
    assert!(connack.session_present);

    // The session remains usable after the cycle
    let ack = client
        .publish(Publish::new("alive/topic", QoS::AtLeastOnce, "p", None))
        .await
        .unwrap();
    assert_ne!(ack.pkid, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_routes_between_sessions() {
    let bus = MessageBus::new();
    let (subscriber, transport) = session(&bus, "sub-client");
    let (publisher, _pub_transport) = session(&bus, "pub-client");
    subscriber.connect().await.unwrap();
    publisher.connect().await.unwrap();

    let mut receiver = subscriber
        .create_filtered_receiver("farm/+/humidity", true)
        .unwrap();
    subscriber
        .subscribe(Subscribe::new("farm/+/humidity", QoS::AtLeastOnce))
        .await
        .unwrap();

    publisher
        .publish(Publish::new(
            "farm/barn/humidity",
            QoS::AtLeastOnce,
            "0.61",
            None,
        ))
        .await
        .unwrap();

    let (publish, token) = receiver.recv().await.unwrap();
    assert_eq!(publish.topic, "farm/barn/humidity");
    assert_eq!(publish.payload.as_ref(), b"0.61");
    // Auto-ack receiver carries no token and releases the PUBACK on its own
    assert!(token.is_none());
    wait_until(|| transport.sent_pubacks().len() == 1).await;
}
