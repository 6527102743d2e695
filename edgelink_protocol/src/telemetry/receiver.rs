// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Telemetry receiver: receives typed messages, merges their timestamps into
//! the application clock, and exposes manual acknowledgement tokens.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use edgelink_mqtt::control_packet::{Publish, QoS, Subscribe, Unsubscribe};
use edgelink_mqtt::interface::{AckToken, ManagedClient, MessageReceiver};

use crate::application::{ApplicationContext, ApplicationHybridLogicalClock};
use crate::common::hybrid_logical_clock::HybridLogicalClock;
use crate::common::payload_serialize::{
    DeserializationError, FormatIndicator, PayloadSerialize,
};
use crate::common::protocol_error::{ProtocolError, Value, VersionRole};
use crate::common::topic_pattern::TopicPattern;
use crate::common::user_properties::UserProperty;
use crate::telemetry::{DEFAULT_TELEMETRY_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use crate::ProtocolVersion;

/// A received telemetry message.
/// Used by the [`Receiver`].
#[derive(Debug)]
pub struct Message<T>
where
    T: PayloadSerialize,
{
    /// Payload of the telemetry message.
    pub payload: T,
    /// Content type of the telemetry message.
    pub content_type: Option<String>,
    /// Format indicator of the telemetry message.
    pub format_indicator: FormatIndicator,
    /// Custom user data set as MQTT user properties on the message.
    pub custom_user_data: Vec<(String, String)>,
    /// Timestamp of the telemetry message.
    pub timestamp: Option<HybridLogicalClock>,
    /// Client id of the sender of the message, when present.
    pub sender_id: Option<String>,
    /// Topic token values resolved from the incoming message's topic.
    pub topic_tokens: HashMap<String, String>,
}

/// Telemetry Receiver Options.
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct Options {
    /// Topic pattern for the telemetry messages.
    topic_pattern: String,
    /// Optional topic namespace prepended to the topic pattern
    #[builder(default = "None")]
    topic_namespace: Option<String>,
    /// Topic token keys/values resident for the receiver's lifetime
    #[builder(default)]
    topic_token_map: HashMap<String, String>,
    /// Whether received messages are acknowledged as soon as they are
    /// returned from [`recv`](Receiver::recv) rather than via [`AckToken`]
    #[builder(default = "true")]
    auto_ack: bool,
}

/// Describes the lifecycle state of a receiver.
enum State {
    New,
    Subscribed,
    Shutdown,
}

/// Telemetry Receiver.
pub struct Receiver<T, C>
where
    T: PayloadSerialize + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    mqtt_client: C,
    mqtt_receiver: C::Receiver,
    topic_pattern: TopicPattern,
    state: State,
    message_payload_type: PhantomData<T>,
}

impl<T, C> Receiver<T, C>
where
    T: PayloadSerialize + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    /// Creates a new [`Receiver`].
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::protocol_error::ProtocolErrorKind::ConfigurationInvalid)
    /// if the topic pattern, namespace, or resident token replacements are
    /// invalid.
    pub fn new(
        application_context: ApplicationContext,
        client: C,
        receiver_options: Options,
    ) -> Result<Self, ProtocolError> {
        let topic_pattern = TopicPattern::new(
            &receiver_options.topic_pattern,
            None,
            receiver_options.topic_namespace.as_deref(),
            &receiver_options.topic_token_map,
        )
        .map_err(|e| {
            ProtocolError::new_configuration_invalid_error(
                Some(Box::new(e)),
                "topic_pattern",
                Value::String(receiver_options.topic_pattern.clone()),
                None,
                None,
            )
        })?;

        let mqtt_receiver = client
            .create_filtered_receiver(
                &topic_pattern.as_subscribe_topic(),
                receiver_options.auto_ack,
            )
            .map_err(|e| {
                ProtocolError::new_configuration_invalid_error(
                    Some(Box::new(e)),
                    "topic_pattern",
                    Value::String(topic_pattern.as_subscribe_topic()),
                    Some("Could not register telemetry topic receiver".to_string()),
                    None,
                )
            })?;

        Ok(Self {
            application_hlc: application_context.application_hlc,
            mqtt_client: client,
            mqtt_receiver,
            topic_pattern,
            state: State::New,
            message_payload_type: PhantomData,
        })
    }

    /// Receive the next telemetry message, or [`None`] if there will be no
    /// more messages.
    ///
    /// Subscribes to the telemetry topic filter on first use. The returned
    /// [`AckToken`] is present only when the receiver was created with
    /// `auto_ack` disabled and the message requires acknowledgement.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`MqttError`](crate::common::protocol_error::ProtocolErrorKind::MqttError)
    /// if the subscribe fails;
    /// [`UnsupportedVersion`](crate::common::protocol_error::ProtocolErrorKind::UnsupportedVersion),
    /// [`HeaderInvalid`](crate::common::protocol_error::ProtocolErrorKind::HeaderInvalid),
    /// or
    /// [`PayloadInvalid`](crate::common::protocol_error::ProtocolErrorKind::PayloadInvalid)
    /// if a received message is malformed (the message is dropped and
    /// acknowledged; subsequent calls keep receiving).
    pub async fn recv(
        &mut self,
    ) -> Option<Result<(Message<T>, Option<AckToken>), ProtocolError>> {
        if let State::New = self.state {
            if let Err(e) = self.subscribe().await {
                return Some(Err(e));
            }
            self.state = State::Subscribed;
        }

        let (publish, ack_token) = self.mqtt_receiver.recv().await?;
        Some(self.parse_message(publish).map(|message| (message, ack_token)))
    }

    /// Unsubscribe from the telemetry topic and close the receiver.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`MqttError`](crate::common::protocol_error::ProtocolErrorKind::MqttError)
    /// if the unsubscribe fails; the method may be called again to retry.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        if let State::Subscribed = self.state {
            match self
                .mqtt_client
                .unsubscribe(Unsubscribe::new(self.topic_pattern.as_subscribe_topic()))
                .await
            {
                Ok(unsuback) if unsuback.reason_code.is_success() => {}
                Ok(unsuback) => {
                    return Err(ProtocolError::new_mqtt_error(
                        Some(format!(
                            "Telemetry unsubscribe rejected by broker: {:?}",
                            unsuback.reason_code
                        )),
                        Box::new(std::io::Error::other("unsuback failure")),
                        None,
                    ));
                }
                Err(e) => {
                    return Err(ProtocolError::new_mqtt_error(
                        Some("Client error on telemetry receiver unsubscribe".to_string()),
                        Box::new(e),
                        None,
                    ));
                }
            }
        }
        self.mqtt_receiver.close();
        self.state = State::Shutdown;
        log::info!("Telemetry receiver shutdown");
        Ok(())
    }

    async fn subscribe(&self) -> Result<(), ProtocolError> {
        match self
            .mqtt_client
            .subscribe(Subscribe::new(
                self.topic_pattern.as_subscribe_topic(),
                QoS::AtLeastOnce,
            ))
            .await
        {
            Ok(suback) if suback.reason_code.is_success() => Ok(()),
            Ok(suback) => Err(ProtocolError::new_mqtt_error(
                Some(format!(
                    "Telemetry subscribe rejected by broker: {:?}",
                    suback.reason_code
                )),
                Box::new(std::io::Error::other("suback failure")),
                None,
            )),
            Err(e) => Err(ProtocolError::new_mqtt_error(
                Some("Client error on telemetry receiver subscribe".to_string()),
                Box::new(e),
                None,
            )),
        }
    }

    /// Validate and deserialize a received telemetry publish.
    fn parse_message(&self, publish: Publish) -> Result<Message<T>, ProtocolError> {
        let properties = publish.properties.unwrap_or_default();

        let mut custom_user_data = Vec::new();
        let mut timestamp = None;
        let mut sender_id = None;
        let mut protocol_version = None;
        for (key, value) in properties.user_properties {
            match UserProperty::from_str(&key) {
                Ok(UserProperty::Timestamp) => match HybridLogicalClock::from_str(&value) {
                    Ok(hlc) => {
                        self.application_hlc.update(&hlc)?;
                        timestamp = Some(hlc);
                    }
                    Err(e) => {
                        return Err(e.into_header_invalid(
                            &UserProperty::Timestamp.to_string(),
                            false,
                        ));
                    }
                },
                Ok(UserProperty::SenderId) => sender_id = Some(value),
                Ok(UserProperty::ProtocolVersion) => protocol_version = Some(value),
                Ok(_) => {
                    log::warn!("Telemetry message should not contain MQTT user property '{key}'");
                    custom_user_data.push((key, value));
                }
                Err(()) => custom_user_data.push((key, value)),
            }
        }

        let version = match &protocol_version {
            Some(raw) => ProtocolVersion::parse(raw).ok_or_else(|| {
                ProtocolError::new_unsupported_version_error(
                    Some(format!(
                        "Received telemetry with an unparsable protocol version: {raw}"
                    )),
                    raw.clone(),
                    SUPPORTED_PROTOCOL_VERSIONS.to_vec(),
                    VersionRole::Request,
                    false,
                    None,
                )
            })?,
            None => DEFAULT_TELEMETRY_PROTOCOL_VERSION,
        };
        if !version.is_supported(SUPPORTED_PROTOCOL_VERSIONS) {
            return Err(ProtocolError::new_unsupported_version_error(
                None,
                version.to_string(),
                SUPPORTED_PROTOCOL_VERSIONS.to_vec(),
                VersionRole::Request,
                false,
                None,
            ));
        }

        let format_indicator = properties
            .payload_format_indicator
            .try_into()
            .unwrap_or_else(|e| {
                log::error!("Received invalid payload format indicator: {e}. Using default.");
                FormatIndicator::default()
            });
        let payload = match T::deserialize(
            &publish.payload,
            properties.content_type.as_ref(),
            &format_indicator,
        ) {
            Ok(payload) => payload,
            Err(DeserializationError::InvalidPayload(e)) => {
                return Err(ProtocolError::new_payload_invalid_error(
                    false,
                    false,
                    Some(e.into()),
                    None,
                    None,
                ));
            }
            Err(DeserializationError::UnsupportedContentType(message)) => {
                return Err(ProtocolError::new_header_invalid_error(
                    "Content Type",
                    properties.content_type.as_deref().unwrap_or("None"),
                    false,
                    Some(message),
                    None,
                ));
            }
        };

        Ok(Message {
            payload,
            content_type: properties.content_type,
            format_indicator,
            custom_user_data,
            timestamp,
            sender_id,
            topic_tokens: self.topic_pattern.parse_tokens(&publish.topic),
        })
    }
}
