// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT v5 control packet data model consumed and produced by the session client.
//!
//! The wire encoding of these types is the responsibility of the injected
//! [`MqttTransport`](crate::interface::MqttTransport) implementation.

use bytes::Bytes;

/// Quality of Service level for a publish or subscription.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// At most once delivery
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

/// PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of Service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name the message is published to
    pub topic: String,
    /// Packet identifier. 0 for Quality of Service 0 messages, or for outgoing
    /// messages that have not yet been assigned an identifier by the transport.
    pub pkid: u16,
    /// Message payload
    pub payload: Bytes,
    /// MQTT v5 properties
    pub properties: Option<PublishProperties>,
}

impl Publish {
    /// Create a new [`Publish`] with the given topic, QoS, and payload.
    pub fn new(
        topic: impl Into<String>,
        qos: QoS,
        payload: impl Into<Bytes>,
        properties: Option<PublishProperties>,
    ) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            pkid: 0,
            payload: payload.into(),
            properties,
        }
    }
}

/// Properties for a PUBLISH packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// Payload format indicator (0 = unspecified bytes, 1 = UTF-8 character data)
    pub payload_format_indicator: Option<u8>,
    /// Lifetime of the message in seconds
    pub message_expiry_interval: Option<u32>,
    /// Topic alias
    pub topic_alias: Option<u16>,
    /// Topic for the receiver to respond on
    pub response_topic: Option<String>,
    /// Correlation data used to match responses with requests
    pub correlation_data: Option<Bytes>,
    /// User properties, in submission order
    pub user_properties: Vec<(String, String)>,
    /// Identifiers of the subscriptions this publish matched
    pub subscription_identifiers: Vec<usize>,
    /// Content type of the payload
    pub content_type: Option<String>,
}

/// A single subscription request for one topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Topic filter to subscribe to
    pub topic_filter: String,
    /// Maximum Quality of Service for the subscription
    pub qos: QoS,
    /// MQTT v5 properties
    pub properties: Option<SubscribeProperties>,
}

impl Subscribe {
    /// Create a new [`Subscribe`] for the given topic filter and QoS.
    pub fn new(topic_filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
            properties: None,
        }
    }
}

/// Properties for a SUBSCRIBE packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeProperties {
    /// Subscription identifier
    pub subscription_identifier: Option<usize>,
    /// User properties
    pub user_properties: Vec<(String, String)>,
}

/// An unsubscribe request for one topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Topic filter to unsubscribe from
    pub topic_filter: String,
    /// MQTT v5 properties
    pub properties: Option<UnsubscribeProperties>,
}

impl Unsubscribe {
    /// Create a new [`Unsubscribe`] for the given topic filter.
    pub fn new(topic_filter: impl Into<String>) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            properties: None,
        }
    }
}

/// Properties for an UNSUBSCRIBE packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeProperties {
    /// User properties
    pub user_properties: Vec<(String, String)>,
}

/// Properties for an AUTH packet (enhanced authentication)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthProperties {
    /// Authentication method
    pub method: Option<String>,
    /// Authentication data
    pub data: Option<Bytes>,
    /// Reason for the auth exchange
    pub reason: Option<String>,
    /// User properties
    pub user_properties: Vec<(String, String)>,
}

/// CONNACK packet returned by the broker in response to a connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    /// True if the broker retained state from a previous connection under the
    /// same client identifier.
    pub session_present: bool,
    /// Result of the connection attempt
    pub reason_code: ConnectReasonCode,
    /// Client identifier assigned by the broker, if the client did not provide one
    pub assigned_client_identifier: Option<String>,
}

/// PUBACK packet acknowledging a Quality of Service 1 publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    /// Packet identifier of the acknowledged publish
    pub pkid: u16,
    /// Acknowledgement result
    pub reason_code: PubAckReasonCode,
}

/// Reason code for a PUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubAckReasonCode {
    /// The message was accepted
    Success,
    /// The message was accepted but there were no matching subscribers
    NoMatchingSubscribers,
    /// Unspecified failure
    UnspecifiedError,
    /// The publish was valid but not accepted
    ImplementationSpecificError,
    /// The client is not authorized to publish to the topic
    NotAuthorized,
    /// The topic name is malformed
    TopicNameInvalid,
    /// The packet identifier is already in use
    PacketIdentifierInUse,
    /// A quota has been exceeded
    QuotaExceeded,
    /// The payload format does not match the payload format indicator
    PayloadFormatInvalid,
}

impl PubAckReasonCode {
    /// True if the reason code indicates the publish was accepted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PubAckReasonCode::Success | PubAckReasonCode::NoMatchingSubscribers
        )
    }
}

/// SUBACK packet acknowledging a subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier of the acknowledged subscribe
    pub pkid: u16,
    /// Acknowledgement result
    pub reason_code: SubAckReasonCode,
}

/// Reason code for a SUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckReasonCode {
    /// The subscription was accepted at Quality of Service 0
    GrantedQoS0,
    /// The subscription was accepted at Quality of Service 1
    GrantedQoS1,
    /// The subscription was accepted at Quality of Service 2
    GrantedQoS2,
    /// Unspecified failure
    UnspecifiedError,
    /// The subscribe was valid but not accepted
    ImplementationSpecificError,
    /// The client is not authorized to make the subscription
    NotAuthorized,
    /// The topic filter is malformed
    TopicFilterInvalid,
    /// The packet identifier is already in use
    PacketIdentifierInUse,
    /// A quota has been exceeded
    QuotaExceeded,
    /// Shared subscriptions are not supported by the broker
    SharedSubscriptionsNotSupported,
    /// Subscription identifiers are not supported by the broker
    SubscriptionIdentifiersNotSupported,
    /// Wildcard subscriptions are not supported by the broker
    WildcardSubscriptionsNotSupported,
}

impl SubAckReasonCode {
    /// True if the reason code indicates the subscription was granted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SubAckReasonCode::GrantedQoS0
                | SubAckReasonCode::GrantedQoS1
                | SubAckReasonCode::GrantedQoS2
        )
    }
}

/// UNSUBACK packet acknowledging an unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    /// Packet identifier of the acknowledged unsubscribe
    pub pkid: u16,
    /// Acknowledgement result
    pub reason_code: UnsubAckReasonCode,
}

/// Reason code for an UNSUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubAckReasonCode {
    /// The unsubscribe was accepted
    Success,
    /// No subscription existed for the topic filter
    NoSubscriptionExisted,
    /// Unspecified failure
    UnspecifiedError,
    /// The unsubscribe was valid but not accepted
    ImplementationSpecificError,
    /// The client is not authorized to unsubscribe
    NotAuthorized,
    /// The topic filter is malformed
    TopicFilterInvalid,
    /// The packet identifier is already in use
    PacketIdentifierInUse,
}

impl UnsubAckReasonCode {
    /// True if the reason code indicates the unsubscribe was accepted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            UnsubAckReasonCode::Success | UnsubAckReasonCode::NoSubscriptionExisted
        )
    }
}

/// Reason code in a CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReasonCode {
    /// The connection was accepted
    Success,
    /// Unspecified failure
    UnspecifiedError,
    /// The CONNECT packet could not be parsed
    MalformedPacket,
    /// A protocol violation occurred
    ProtocolError,
    /// The connect was valid but not accepted
    ImplementationSpecificError,
    /// The requested MQTT protocol version is not supported
    UnsupportedProtocolVersion,
    /// The client identifier is not valid
    ClientIdentifierNotValid,
    /// The username or password is malformed or incorrect
    BadUserNamePassword,
    /// The client is not authorized to connect
    NotAuthorized,
    /// The broker is not available
    ServerUnavailable,
    /// The broker is busy
    ServerBusy,
    /// The client is banned
    Banned,
    /// The authentication method is not supported
    BadAuthenticationMethod,
    /// The topic name in the will message is invalid
    TopicNameInvalid,
    /// The CONNECT packet exceeded the maximum permissible size
    PacketTooLarge,
    /// A quota has been exceeded
    QuotaExceeded,
    /// The will payload format does not match the payload format indicator
    PayloadFormatInvalid,
    /// Retained messages are not supported
    RetainNotSupported,
    /// The requested Quality of Service is not supported
    QoSNotSupported,
    /// The client should temporarily use another server
    UseAnotherServer,
    /// The client should permanently use another server
    ServerMoved,
    /// The connection rate limit has been exceeded
    ConnectionRateExceeded,
}

impl ConnectReasonCode {
    /// True if a connection attempt rejected with this reason code may be retried.
    ///
    /// Fatal reason codes indicate a structural problem (bad credentials,
    /// protocol violation, unsupported feature) that retrying cannot fix.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectReasonCode::Success
            | ConnectReasonCode::UnspecifiedError
            | ConnectReasonCode::ImplementationSpecificError
            | ConnectReasonCode::ServerUnavailable
            | ConnectReasonCode::ServerBusy
            | ConnectReasonCode::QuotaExceeded
            | ConnectReasonCode::UseAnotherServer
            | ConnectReasonCode::ConnectionRateExceeded => true,
            ConnectReasonCode::MalformedPacket
            | ConnectReasonCode::ProtocolError
            | ConnectReasonCode::UnsupportedProtocolVersion
            | ConnectReasonCode::ClientIdentifierNotValid
            | ConnectReasonCode::BadUserNamePassword
            | ConnectReasonCode::NotAuthorized
            | ConnectReasonCode::Banned
            | ConnectReasonCode::BadAuthenticationMethod
            | ConnectReasonCode::TopicNameInvalid
            | ConnectReasonCode::PacketTooLarge
            | ConnectReasonCode::PayloadFormatInvalid
            | ConnectReasonCode::RetainNotSupported
            | ConnectReasonCode::QoSNotSupported
            | ConnectReasonCode::ServerMoved => false,
        }
    }
}

/// Reason code in a server-initiated DISCONNECT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReasonCode {
    /// Graceful disconnection, the will message is not published
    NormalDisconnection,
    /// Unspecified failure
    UnspecifiedError,
    /// A packet could not be parsed
    MalformedPacket,
    /// A protocol violation occurred
    ProtocolError,
    /// The disconnect was valid but unexplained
    ImplementationSpecificError,
    /// The client is not authorized
    NotAuthorized,
    /// The broker is busy
    ServerBusy,
    /// The broker is shutting down
    ServerShuttingDown,
    /// No packet was received within 1.5x the keep alive interval
    KeepAliveTimeout,
    /// Another connection using the same client identifier has connected
    SessionTakenOver,
    /// A topic filter is malformed
    TopicFilterInvalid,
    /// A topic name is malformed
    TopicNameInvalid,
    /// The broker received more publishes than its Receive Maximum allows
    ReceiveMaximumExceeded,
    /// A topic alias is out of range
    TopicAliasInvalid,
    /// A packet exceeded the maximum permissible size
    PacketTooLarge,
    /// The message publication rate is too high
    MessageRateTooHigh,
    /// A quota has been exceeded
    QuotaExceeded,
    /// The connection was closed due to administrative action
    AdministrativeAction,
    /// The payload format does not match the payload format indicator
    PayloadFormatInvalid,
    /// Retained messages are not supported
    RetainNotSupported,
    /// The requested Quality of Service is not supported
    QoSNotSupported,
    /// The client should temporarily use another server
    UseAnotherServer,
    /// The client should permanently use another server
    ServerMoved,
    /// Shared subscriptions are not supported
    SharedSubscriptionsNotSupported,
    /// The connection rate limit has been exceeded
    ConnectionRateExceeded,
    /// The maximum connect time has been exceeded
    MaximumConnectTime,
    /// Subscription identifiers are not supported
    SubscriptionIdentifiersNotSupported,
    /// Wildcard subscriptions are not supported
    WildcardSubscriptionsNotSupported,
}

impl DisconnectReasonCode {
    /// True if a session may attempt reconnection after a server-initiated
    /// disconnect with this reason code.
    ///
    /// Fatal reason codes end the session; the queue is failed and a
    /// session-lost notification is emitted.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            DisconnectReasonCode::NormalDisconnection
            | DisconnectReasonCode::UnspecifiedError
            | DisconnectReasonCode::ImplementationSpecificError
            | DisconnectReasonCode::ServerBusy
            | DisconnectReasonCode::ServerShuttingDown
            | DisconnectReasonCode::KeepAliveTimeout
            | DisconnectReasonCode::ReceiveMaximumExceeded
            | DisconnectReasonCode::MessageRateTooHigh
            | DisconnectReasonCode::QuotaExceeded
            | DisconnectReasonCode::AdministrativeAction
            | DisconnectReasonCode::UseAnotherServer
            | DisconnectReasonCode::ConnectionRateExceeded
            | DisconnectReasonCode::MaximumConnectTime => true,
            DisconnectReasonCode::MalformedPacket
            | DisconnectReasonCode::ProtocolError
            | DisconnectReasonCode::NotAuthorized
            | DisconnectReasonCode::SessionTakenOver
            | DisconnectReasonCode::TopicFilterInvalid
            | DisconnectReasonCode::TopicNameInvalid
            | DisconnectReasonCode::TopicAliasInvalid
            | DisconnectReasonCode::PacketTooLarge
            | DisconnectReasonCode::PayloadFormatInvalid
            | DisconnectReasonCode::RetainNotSupported
            | DisconnectReasonCode::QoSNotSupported
            | DisconnectReasonCode::ServerMoved
            | DisconnectReasonCode::SharedSubscriptionsNotSupported
            | DisconnectReasonCode::SubscriptionIdentifiersNotSupported
            | DisconnectReasonCode::WildcardSubscriptionsNotSupported => false,
        }
    }
}
