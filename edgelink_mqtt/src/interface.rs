// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits defining the transport the session client consumes and the managed
//! client functionality it exposes.

use async_trait::async_trait;

use crate::connection_settings::ConnectionSettings;
use crate::control_packet::{
    AuthProperties, ConnAck, PubAck, Publish, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use crate::error::{SessionError, TransportError};
use crate::topic::TopicParseError;

pub use crate::session::ack_tracker::AckToken;

/// Event surfaced by an [`MqttTransport`] while a connection is established.
///
/// Connection loss is reported through the error channel of
/// [`MqttTransport::next_event`], not as an event variant.
#[derive(Debug)]
pub enum TransportEvent {
    /// An incoming PUBLISH from the broker
    Publish(Publish),
    /// An incoming AUTH packet (enhanced authentication exchange)
    Auth(AuthProperties),
}

/// A single MQTT v5 network connection, owned exclusively by the session
/// client.
///
/// Implementations encapsulate the wire codec, socket, and TLS concerns. All
/// methods take `&self`; implementations are expected to use interior
/// mutability. The session client serializes its use of `connect`, and of the
/// outbound operations, through its work queue.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Open a network connection and perform the MQTT connect handshake.
    ///
    /// # Errors
    /// [`TransportError::ConnectionRefused`] if the broker rejects the connect,
    /// or another [`TransportError`] for network-level failures.
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        clean_start: bool,
    ) -> Result<ConnAck, TransportError>;

    /// Transmit a PUBLISH and, for Quality of Service 1, await the PUBACK.
    ///
    /// For Quality of Service 0 an implementation returns a synthetic
    /// successful [`PubAck`] with packet identifier 0 once the packet is
    /// written to the wire.
    ///
    /// # Errors
    /// [`TransportError`] if the connection fails before the acknowledgement
    /// arrives.
    async fn publish(&self, publish: Publish) -> Result<PubAck, TransportError>;

    /// Transmit a SUBSCRIBE and await the SUBACK.
    ///
    /// # Errors
    /// [`TransportError`] if the connection fails before the acknowledgement
    /// arrives.
    async fn subscribe(&self, subscribe: Subscribe) -> Result<SubAck, TransportError>;

    /// Transmit an UNSUBSCRIBE and await the UNSUBACK.
    ///
    /// # Errors
    /// [`TransportError`] if the connection fails before the acknowledgement
    /// arrives.
    async fn unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<UnsubAck, TransportError>;

    /// Transmit a PUBACK for a received publish.
    ///
    /// # Errors
    /// [`TransportError`] if the connection is unavailable.
    async fn ack(&self, pkid: u16) -> Result<(), TransportError>;

    /// Transmit an AUTH packet carrying enhanced authentication data.
    ///
    /// # Errors
    /// [`TransportError`] if the connection is unavailable.
    async fn send_auth(&self, auth: AuthProperties) -> Result<(), TransportError>;

    /// Transmit a DISCONNECT and close the network connection.
    ///
    /// # Errors
    /// [`TransportError`] if the connection is unavailable.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Await the next incoming [`TransportEvent`].
    ///
    /// # Errors
    /// [`TransportError::Disconnected`] when the broker ends the connection
    /// with a DISCONNECT packet, or another [`TransportError`] when the link
    /// drops.
    async fn next_event(&self) -> Result<TransportEvent, TransportError>;
}

/// An MQTT client whose connection state is externally managed.
/// Can be used to send messages and create receivers for incoming messages.
#[async_trait]
pub trait ManagedClient: Send + Sync {
    /// The type of receiver used by this client
    type Receiver: MessageReceiver + Send;

    /// Get the client id for the MQTT connection
    fn client_id(&self) -> &str;

    /// Enqueue a publish and await the broker's acknowledgement.
    ///
    /// # Errors
    /// [`SessionError`] if the item fails terminally (see the session client's
    /// queue discipline).
    async fn publish(&self, publish: Publish) -> Result<PubAck, SessionError>;

    /// Enqueue a subscribe and await the broker's acknowledgement.
    ///
    /// # Errors
    /// [`SessionError`] if the item fails terminally.
    async fn subscribe(&self, subscribe: Subscribe) -> Result<SubAck, SessionError>;

    /// Enqueue an unsubscribe and await the broker's acknowledgement.
    ///
    /// # Errors
    /// [`SessionError`] if the item fails terminally.
    async fn unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<UnsubAck, SessionError>;

    /// Create a new [`MessageReceiver`] for incoming publishes matching a topic
    /// filter.
    ///
    /// When `auto_ack` is false, received Quality of Service 1 publishes carry
    /// an [`AckToken`] and are only acknowledged once application code uses it.
    ///
    /// # Errors
    /// Returns a [`TopicParseError`] if the topic filter is invalid.
    fn create_filtered_receiver(
        &self,
        topic_filter: &str,
        auto_ack: bool,
    ) -> Result<Self::Receiver, TopicParseError>;
}

/// Receiver for incoming MQTT messages.
#[async_trait]
pub trait MessageReceiver: Send {
    /// Receive the next incoming publish, along with a token for manual
    /// acknowledgement when one is required.
    ///
    /// Returns [`None`] if there will be no more incoming publishes.
    async fn recv(&mut self) -> Option<(Publish, Option<AckToken>)>;

    /// Close the receiver, preventing further incoming publishes.
    ///
    /// To guarantee no publish loss, `recv()` must be called until [`None`] is
    /// returned.
    fn close(&mut self);
}
