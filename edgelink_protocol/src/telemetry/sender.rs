// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Telemetry sender: publishes typed messages stamped with causal timestamps.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use edgelink_mqtt::control_packet::{Publish, PublishProperties, QoS};
use edgelink_mqtt::interface::ManagedClient;

use crate::application::{ApplicationContext, ApplicationHybridLogicalClock};
use crate::common::payload_serialize::{PayloadSerialize, SerializedPayload};
use crate::common::protocol_error::{ProtocolError, Value};
use crate::common::topic_pattern::TopicPattern;
use crate::common::user_properties::{validate_user_properties, UserProperty};
use crate::telemetry::TELEMETRY_PROTOCOL_VERSION;

/// Telemetry message.
/// Used by the [`Sender`].
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct Message<T>
where
    T: PayloadSerialize,
{
    /// Payload of the telemetry message, serialized at build time.
    #[builder(setter(custom))]
    serialized_payload: SerializedPayload,
    /// Strongly link `Message` with type `T`
    #[builder(private)]
    message_payload_type: PhantomData<T>,
    /// Quality of Service of the telemetry message. Can only be `AtMostOnce`
    /// or `AtLeastOnce`.
    #[builder(default = "QoS::AtLeastOnce")]
    qos: QoS,
    /// User data set as custom MQTT user properties on the message.
    /// Keys must not start with the reserved `__` prefix.
    #[builder(default)]
    custom_user_data: Vec<(String, String)>,
    /// Topic token keys/values substituted into the topic pattern for this
    /// message; override the sender's resident tokens.
    #[builder(default)]
    topic_tokens: HashMap<String, String>,
    /// Lifetime of the message on the broker.
    #[builder(default = "Duration::from_secs(10)")]
    message_expiry: Duration,
}

impl<T: PayloadSerialize> MessageBuilder<T> {
    /// Add a payload to the telemetry message. Validates successful
    /// serialization of the payload.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`PayloadInvalid`](crate::common::protocol_error::ProtocolErrorKind::PayloadInvalid)
    /// if serialization fails, or of kind
    /// [`ConfigurationInvalid`](crate::common::protocol_error::ProtocolErrorKind::ConfigurationInvalid)
    /// if the content type is not valid for transmission.
    pub fn payload(&mut self, payload: T) -> Result<&mut Self, ProtocolError> {
        match payload.serialize() {
            Err(e) => Err(ProtocolError::new_payload_invalid_error(
                true,
                false,
                Some(e.into()),
                Some("Payload serialization error".to_string()),
                None,
            )),
            Ok(serialized_payload) => {
                if crate::common::is_invalid_utf8(&serialized_payload.content_type) {
                    return Err(ProtocolError::new_configuration_invalid_error(
                        None,
                        "content_type",
                        Value::String(serialized_payload.content_type.clone()),
                        Some(format!(
                            "Content type '{}' of telemetry message is not valid",
                            serialized_payload.content_type
                        )),
                        None,
                    ));
                }
                self.serialized_payload = Some(serialized_payload);
                self.message_payload_type = Some(PhantomData);
                Ok(self)
            }
        }
    }

    /// Validate the telemetry message.
    ///
    /// # Errors
    /// Returns a `String` describing the error if
    /// - `qos` is not `AtMostOnce` or `AtLeastOnce`
    /// - any of `custom_user_data`'s keys start with the reserved prefix or
    ///   are not valid for transmission
    /// - `message_expiry`'s seconds exceed `u32::MAX`
    fn validate(&self) -> Result<(), String> {
        if let Some(qos) = &self.qos {
            if !matches!(qos, QoS::AtMostOnce | QoS::AtLeastOnce) {
                return Err("QoS must be AtMostOnce or AtLeastOnce".to_string());
            }
        }
        if let Some(custom_user_data) = &self.custom_user_data {
            validate_user_properties(custom_user_data)?;
        }
        if let Some(message_expiry) = &self.message_expiry {
            if u32::try_from(message_expiry.as_secs()).is_err() {
                return Err(
                    "Message expiry in seconds must fit a u32 to be used as message_expiry_interval"
                        .to_string(),
                );
            }
        }
        Ok(())
    }
}

/// Telemetry Sender Options.
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct Options {
    /// Topic pattern for the telemetry messages.
    topic_pattern: String,
    /// Optional topic namespace prepended to the topic pattern
    #[builder(default = "None")]
    topic_namespace: Option<String>,
    /// Topic token keys/values resident for the sender's lifetime
    #[builder(default)]
    topic_token_map: HashMap<String, String>,
}

/// Telemetry Sender.
pub struct Sender<T, C>
where
    T: PayloadSerialize + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    mqtt_client: C,
    topic_pattern: TopicPattern,
    message_payload_type: PhantomData<T>,
}

impl<T, C> Sender<T, C>
where
    T: PayloadSerialize + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
{
    /// Creates a new [`Sender`].
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::protocol_error::ProtocolErrorKind::ConfigurationInvalid)
    /// if the topic pattern, namespace, or resident token replacements are
    /// invalid.
    pub fn new(
        application_context: ApplicationContext,
        client: C,
        sender_options: Options,
    ) -> Result<Self, ProtocolError> {
        let topic_pattern = TopicPattern::new(
            &sender_options.topic_pattern,
            None,
            sender_options.topic_namespace.as_deref(),
            &sender_options.topic_token_map,
        )
        .map_err(|e| {
            ProtocolError::new_configuration_invalid_error(
                Some(Box::new(e)),
                "topic_pattern",
                Value::String(sender_options.topic_pattern.clone()),
                None,
                None,
            )
        })?;

        Ok(Self {
            application_hlc: application_context.application_hlc,
            mqtt_client: client,
            topic_pattern,
            message_payload_type: PhantomData,
        })
    }

    /// Sends a [`Message`].
    ///
    /// Returns once the broker acknowledges the publish.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::protocol_error::ProtocolErrorKind::ConfigurationInvalid)
    /// if the topic tokens do not fully resolve the topic, or of kind
    /// [`MqttError`](crate::common::protocol_error::ProtocolErrorKind::MqttError)
    /// if the publish fails.
    pub async fn send(&self, mut message: Message<T>) -> Result<(), ProtocolError> {
        let topic = self
            .topic_pattern
            .as_publish_topic(&message.topic_tokens)
            .map_err(|e| {
                ProtocolError::new_configuration_invalid_error(
                    Some(Box::new(e)),
                    "topic_tokens",
                    Value::String(String::new()),
                    Some("Could not resolve telemetry topic".to_string()),
                    None,
                )
            })?;

        let timestamp = self.application_hlc.update_now()?;
        message
            .custom_user_data
            .push((UserProperty::Timestamp.to_string(), timestamp));
        message.custom_user_data.push((
            UserProperty::SenderId.to_string(),
            self.mqtt_client.client_id().to_string(),
        ));
        message.custom_user_data.push((
            UserProperty::ProtocolVersion.to_string(),
            TELEMETRY_PROTOCOL_VERSION.to_string(),
        ));

        let message_expiry_interval =
            u32::try_from(message.message_expiry.as_secs()).unwrap_or(u32::MAX);
        let properties = PublishProperties {
            payload_format_indicator: Some(message.serialized_payload.format_indicator as u8),
            message_expiry_interval: Some(message_expiry_interval),
            topic_alias: None,
            response_topic: None,
            correlation_data: None,
            user_properties: message.custom_user_data,
            subscription_identifiers: Vec::new(),
            content_type: Some(message.serialized_payload.content_type.clone()),
        };

        let publish = Publish::new(
            topic,
            message.qos,
            message.serialized_payload.payload,
            Some(properties),
        );
        match self.mqtt_client.publish(publish).await {
            Ok(puback) if puback.reason_code.is_success() => Ok(()),
            Ok(puback) => Err(ProtocolError::new_mqtt_error(
                Some(format!(
                    "Telemetry publish rejected by broker: {:?}",
                    puback.reason_code
                )),
                Box::new(std::io::Error::other("puback failure")),
                None,
            )),
            Err(e) => {
                log::error!("Client error while sending telemetry: {e}");
                Err(ProtocolError::new_mqtt_error(
                    Some("Client error on telemetry send".to_string()),
                    Box::new(e),
                    None,
                ))
            }
        }
    }
}
