// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command invoker: sends a typed request to an identified executor and awaits
//! the typed, correlated response.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edgelink_mqtt::control_packet::{Publish, PublishProperties, QoS, Subscribe, Unsubscribe};
use edgelink_mqtt::interface::{ManagedClient, MessageReceiver};
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::{ApplicationContext, ApplicationHybridLogicalClock};
use crate::common::hybrid_logical_clock::HybridLogicalClock;
use crate::common::payload_serialize::{
    DeserializationError, FormatIndicator, PayloadSerialize, SerializedPayload,
};
use crate::common::protocol_error::{ProtocolError, ProtocolErrorKind, Value, VersionRole};
use crate::common::topic_pattern::{contains_invalid_char, TopicPattern};
use crate::common::user_properties::{validate_user_properties, UserProperty};
use crate::rpc::{
    StatusCode, StatusCodeParseError, DEFAULT_RPC_PROTOCOL_VERSION, RPC_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::{parse_supported_protocol_major_versions, ProtocolVersion};

/// Command request.
/// Used by the [`Invoker`].
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct Request<TReq>
where
    TReq: PayloadSerialize,
{
    /// Payload of the command request, serialized at build time.
    #[builder(setter(custom))]
    serialized_payload: SerializedPayload,
    /// Strongly link `Request` with type `TReq`
    #[builder(private)]
    request_payload_type: PhantomData<TReq>,
    /// User data set as custom MQTT user properties on the request message.
    /// Keys must not start with the reserved `__` prefix.
    #[builder(default)]
    custom_user_data: Vec<(String, String)>,
    /// Topic token keys/values substituted into the request topic pattern for
    /// this call; override the invoker's resident tokens.
    #[builder(default)]
    topic_tokens: HashMap<String, String>,
    /// Per-invocation timeout. Rounded up to the nearest second; also sent as
    /// the message expiry interval so the executor can see when the request
    /// lapses. Defaults to the invoker's default command timeout.
    #[builder(setter(custom), default = "None")]
    timeout: Option<Duration>,
    /// Fencing token forwarded to the executor for stale-write rejection.
    #[builder(default = "None")]
    fencing_token: Option<HybridLogicalClock>,
    /// Pre-set correlation id. Normally left unset; the invoker generates a
    /// fresh id per invocation. A pre-set id still in flight is rejected.
    #[builder(default = "None")]
    correlation_id: Option<Uuid>,
}

impl<TReq: PayloadSerialize> RequestBuilder<TReq> {
    /// Add a payload to the command request. Validates successful serialization
    /// of the payload.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`PayloadInvalid`](ProtocolErrorKind::PayloadInvalid) if serialization
    /// of the payload fails, or of kind
    /// [`ConfigurationInvalid`](ProtocolErrorKind::ConfigurationInvalid) if the
    /// content type is not valid for transmission.
    pub fn payload(&mut self, payload: TReq) -> Result<&mut Self, ProtocolError> {
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
                            "Content type '{}' of command request is not valid",
                            serialized_payload.content_type
                        )),
                        None,
                    ));
                }
                self.serialized_payload = Some(serialized_payload);
                self.request_payload_type = Some(PhantomData);
                Ok(self)
            }
        }
    }

    /// Set the timeout for the command.
    ///
    /// Note: rounded up to the nearest second.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(Some(if timeout.subsec_nanos() != 0 {
            Duration::from_secs(timeout.as_secs().saturating_add(1))
        } else {
            timeout
        }));
        self
    }

    /// Validate the command request.
    ///
    /// # Errors
    /// Returns a `String` describing the error if
    /// - any of `custom_user_data`'s keys start with the reserved prefix or
    ///   are not valid for transmission
    /// - timeout is zero or its seconds exceed `u32::MAX`
    fn validate(&self) -> Result<(), String> {
        if let Some(custom_user_data) = &self.custom_user_data {
            validate_user_properties(custom_user_data)?;
        }
        if let Some(Some(timeout)) = &self.timeout {
            if timeout.as_secs() == 0 {
                return Err("Timeout must not be 0".to_string());
            }
            if u32::try_from(timeout.as_secs()).is_err() {
                return Err(
                    "Timeout in seconds must fit a u32 to be used as message_expiry_interval"
                        .to_string(),
                );
            }
        }
        Ok(())
    }
}

/// Command response.
/// Used by the [`Invoker`].
#[derive(Debug)]
pub struct Response<TResp>
where
    TResp: PayloadSerialize,
{
    /// Payload of the command response.
    pub payload: TResp,
    /// Content type of the command response.
    pub content_type: Option<String>,
    /// Format indicator of the command response.
    pub format_indicator: FormatIndicator,
    /// Custom user data set as MQTT user properties on the response message.
    pub custom_user_data: Vec<(String, String)>,
    /// Timestamp of the command response.
    pub timestamp: Option<HybridLogicalClock>,
}

/// Command Invoker Options.
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct Options {
    /// Topic pattern for the command request.
    request_topic_pattern: String,
    /// Topic pattern for the command response. When unset, the response topic
    /// is derived from the request topic using the prefix/suffix options, or
    /// defaults to `clients/<client_id>/<request_topic>`.
    #[builder(default = "None")]
    response_topic_pattern: Option<String>,
    /// Command name
    command_name: String,
    /// Optional topic namespace prepended to the topic patterns
    #[builder(default = "None")]
    topic_namespace: Option<String>,
    /// Topic token keys/values resident for the invoker's lifetime
    #[builder(default)]
    topic_token_map: HashMap<String, String>,
    /// Prefix applied to the request topic to derive the response topic
    #[builder(default = "None")]
    response_topic_prefix: Option<String>,
    /// Suffix applied to the request topic to derive the response topic
    #[builder(default = "None")]
    response_topic_suffix: Option<String>,
    /// Timeout applied when a request does not carry its own
    #[builder(default = "Duration::from_secs(10)")]
    default_command_timeout: Duration,
}

/// Describes the lifecycle state of an invoker.
enum State {
    New,
    Subscribed,
    Shutdown,
}

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Publish>>>>;

/// Removes the pending entry for an invocation that ends without a response
/// (timeout, cancellation, error), so late arrivals are discarded.
struct PendingGuard {
    pending: PendingMap,
    correlation_id: Uuid,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pending.lock().unwrap().remove(&self.correlation_id);
        }
    }
}

/// Command Invoker.
///
/// Sends typed requests and awaits typed responses matched by correlation id.
/// Response order is unrelated to request order; the correlation id is the
/// sole matching mechanism.
pub struct Invoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + 'static,
    TResp: PayloadSerialize + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::Receiver: Send + Sync + 'static,
{
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    mqtt_client: C,
    command_name: String,
    request_topic_pattern: TopicPattern,
    response_topic_pattern: TopicPattern,
    default_command_timeout: Duration,
    pending: PendingMap,
    state: Arc<tokio::sync::Mutex<State>>,
    shutdown: CancellationToken,
    request_payload_type: PhantomData<TReq>,
    response_payload_type: PhantomData<TResp>,
}

impl<TReq, TResp, C> Invoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + 'static,
    TResp: PayloadSerialize + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::Receiver: Send + Sync + 'static,
{
    /// Creates a new [`Invoker`].
    ///
    /// # Arguments
    /// * `application_context` - [`ApplicationContext`] the invoker is part of
    /// * `client` - The MQTT client to use for communication
    /// * `invoker_options` - Configuration options
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`ConfigurationInvalid`](ProtocolErrorKind::ConfigurationInvalid) if the
    /// command name, topic patterns, namespace, or resident token replacements
    /// are invalid.
    pub fn new(
        application_context: ApplicationContext,
        client: C,
        invoker_options: Options,
    ) -> Result<Self, ProtocolError> {
        if invoker_options.command_name.is_empty()
            || contains_invalid_char(&invoker_options.command_name)
        {
            return Err(ProtocolError::new_configuration_invalid_error(
                None,
                "command_name",
                Value::String(invoker_options.command_name.clone()),
                None,
                Some(invoker_options.command_name),
            ));
        }

        // Derive the response topic pattern when one is not given outright
        let response_topic_pattern = match invoker_options.response_topic_pattern {
            Some(pattern) => pattern,
            None => {
                if invoker_options.response_topic_prefix.is_none()
                    && invoker_options.response_topic_suffix.is_none()
                {
                    // Well-known default keeps the response topic distinct from
                    // the request topic and documentable for authorization
                    format!(
                        "clients/{}/{}",
                        client.client_id(),
                        invoker_options.request_topic_pattern
                    )
                } else {
                    let mut pattern = invoker_options.request_topic_pattern.clone();
                    if let Some(prefix) = invoker_options.response_topic_prefix {
                        pattern = format!("{prefix}/{pattern}");
                    }
                    if let Some(suffix) = invoker_options.response_topic_suffix {
                        pattern = format!("{pattern}/{suffix}");
                    }
                    pattern
                }
            }
        };

        let request_topic_pattern = TopicPattern::new(
            &invoker_options.request_topic_pattern,
            None,
            invoker_options.topic_namespace.as_deref(),
            &invoker_options.topic_token_map,
        )
        .map_err(|e| {
            ProtocolError::new_configuration_invalid_error(
                Some(Box::new(e)),
                "request_topic_pattern",
                Value::String(invoker_options.request_topic_pattern.clone()),
                None,
                Some(invoker_options.command_name.clone()),
            )
        })?;

        let response_topic_pattern = TopicPattern::new(
            &response_topic_pattern,
            None,
            invoker_options.topic_namespace.as_deref(),
            &invoker_options.topic_token_map,
        )
        .map_err(|e| {
            ProtocolError::new_configuration_invalid_error(
                Some(Box::new(e)),
                "response_topic_pattern",
                Value::String(response_topic_pattern.clone()),
                None,
                Some(invoker_options.command_name.clone()),
            )
        })?;

        let receiver = client
            .create_filtered_receiver(&response_topic_pattern.as_subscribe_topic(), true)
            .map_err(|e| {
                ProtocolError::new_configuration_invalid_error(
                    Some(Box::new(e)),
                    "response_topic_pattern",
                    Value::String(response_topic_pattern.as_subscribe_topic()),
                    Some("Could not register response topic receiver".to_string()),
                    Some(invoker_options.command_name.clone()),
                )
            })?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::receive_response_loop(
            receiver,
            pending.clone(),
            shutdown.clone(),
            invoker_options.command_name.clone(),
        ));

        Ok(Self {
            application_hlc: application_context.application_hlc,
            mqtt_client: client,
            command_name: invoker_options.command_name,
            request_topic_pattern,
            response_topic_pattern,
            default_command_timeout: invoker_options.default_command_timeout,
            pending,
            state: Arc::new(tokio::sync::Mutex::new(State::New)),
            shutdown,
            request_payload_type: PhantomData,
            response_payload_type: PhantomData,
        })
    }

    /// Invokes a command and awaits its response.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`Timeout`](ProtocolErrorKind::Timeout) if the invocation times out or
    /// the executor reports 408;
    /// [`InvocationException`](ProtocolErrorKind::InvocationException) if the
    /// request reuses a correlation id that is still in flight;
    /// [`UnsupportedVersion`](ProtocolErrorKind::UnsupportedVersion) if either
    /// side's protocol version is not supported;
    /// [`MqttError`](ProtocolErrorKind::MqttError) if the subscribe or publish
    /// fails; or the kind derived from the executor's non-200 status.
    pub async fn invoke(&self, request: Request<TReq>) -> Result<Response<TResp>, ProtocolError> {
        let command_timeout = request.timeout.unwrap_or(self.default_command_timeout);
        match time::timeout(command_timeout, self.invoke_internal(request, command_timeout)).await {
            Ok(result) => result,
            Err(e) => {
                log::error!(
                    "[{}] Command invoke timed out after {command_timeout:?}",
                    self.command_name
                );
                Err(ProtocolError::new_timeout_error(
                    false,
                    Some(Box::new(e)),
                    &self.command_name,
                    command_timeout,
                    None,
                    Some(self.command_name.clone()),
                ))
            }
        }
    }

    async fn invoke_internal(
        &self,
        mut request: Request<TReq>,
        command_timeout: Duration,
    ) -> Result<Response<TResp>, ProtocolError> {
        // Validated in the RequestBuilder
        let message_expiry_interval =
            u32::try_from(command_timeout.as_secs()).unwrap_or(u32::MAX);

        // Transient tokens override the resident map
        let request_topic = self
            .request_topic_pattern
            .as_publish_topic(&request.topic_tokens)
            .map_err(|e| {
                ProtocolError::new_configuration_invalid_error(
                    Some(Box::new(e)),
                    "topic_tokens",
                    Value::String(String::new()),
                    Some("Could not resolve request topic".to_string()),
                    Some(self.command_name.clone()),
                )
            })?;
        let response_topic = self
            .response_topic_pattern
            .as_publish_topic(&request.topic_tokens)
            .map_err(|e| {
                ProtocolError::new_configuration_invalid_error(
                    Some(Box::new(e)),
                    "topic_tokens",
                    Value::String(String::new()),
                    Some("Could not resolve response topic".to_string()),
                    Some(self.command_name.clone()),
                )
            })?;

        // A fresh correlation id per invocation unless the caller pre-set one
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);
        let correlation_data = bytes::Bytes::copy_from_slice(correlation_id.as_bytes());

        // Register the pending invocation; a duplicate in-flight id is refused
        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&correlation_id) {
                let mut e = ProtocolError::new_local_invocation_error(
                    "duplicate request with same correlationId".to_string(),
                    Some(self.command_name.clone()),
                );
                e.correlation_id = Some(correlation_id);
                return Err(e);
            }
            pending.insert(correlation_id, response_tx);
        }
        let mut pending_guard = PendingGuard {
            pending: self.pending.clone(),
            correlation_id,
            armed: true,
        };

        // Stamp protocol metadata onto the user properties
        let timestamp = self.application_hlc.update_now().map_err(|mut e| {
            e.command_name = Some(self.command_name.clone());
            e
        })?;
        request
            .custom_user_data
            .push((UserProperty::Timestamp.to_string(), timestamp));
        request.custom_user_data.push((
            UserProperty::SourceId.to_string(),
            self.mqtt_client.client_id().to_string(),
        ));
        // Legacy readers look for __invId; emit both until upstream migrates
        request.custom_user_data.push((
            UserProperty::InvokerId.to_string(),
            self.mqtt_client.client_id().to_string(),
        ));
        request.custom_user_data.push((
            UserProperty::ProtocolVersion.to_string(),
            RPC_PROTOCOL_VERSION.to_string(),
        ));
        if let Some(fencing_token) = &request.fencing_token {
            request
                .custom_user_data
                .push((UserProperty::FencingToken.to_string(), fencing_token.to_string()));
        }

        let publish_properties = PublishProperties {
            correlation_data: Some(correlation_data),
            response_topic: Some(response_topic),
            payload_format_indicator: Some(request.serialized_payload.format_indicator as u8),
            content_type: Some(request.serialized_payload.content_type.clone()),
            message_expiry_interval: Some(message_expiry_interval),
            user_properties: request.custom_user_data,
            topic_alias: None,
            subscription_identifiers: Vec::new(),
        };

        // Subscribe to the response filter on first use
        {
            let mut state = self.state.lock().await;
            match *state {
                State::New => {
                    self.subscribe_to_response_filter().await?;
                    *state = State::Subscribed;
                }
                State::Subscribed => { /* No-op, already subscribed */ }
                State::Shutdown => {
                    return Err(ProtocolError::new_cancellation_error(
                        false,
                        None,
                        Some(
                            "Command invoker has been shut down and can no longer invoke commands"
                                .to_string(),
                        ),
                        Some(self.command_name.clone()),
                    ));
                }
            }
        }

        // Publish the request and require a successful puback
        let publish = Publish::new(
            request_topic,
            QoS::AtLeastOnce,
            request.serialized_payload.payload.clone(),
            Some(publish_properties),
        );
        match self.mqtt_client.publish(publish).await {
            Ok(puback) if puback.reason_code.is_success() => {}
            Ok(puback) => {
                return Err(ProtocolError::new_mqtt_error(
                    Some(format!(
                        "Request publish rejected by broker: {:?}",
                        puback.reason_code
                    )),
                    Box::new(std::io::Error::other("puback failure")),
                    Some(self.command_name.clone()),
                ));
            }
            Err(e) => {
                log::error!("[{}] Client error while publishing: {e}", self.command_name);
                return Err(ProtocolError::new_mqtt_error(
                    Some("Client error on command invoker request publish".to_string()),
                    Box::new(e),
                    Some(self.command_name.clone()),
                ));
            }
        }

        // Await the correlated response
        let response_publish = match response_rx.await {
            Ok(publish) => {
                // The receive loop removed the pending entry on match
                pending_guard.armed = false;
                publish
            }
            Err(_) => {
                return Err(ProtocolError::new_cancellation_error(
                    false,
                    None,
                    Some(
                        "Command invoker has been shut down and will no longer receive a response"
                            .to_string(),
                    ),
                    Some(self.command_name.clone()),
                ));
            }
        };

        let mut result = self.parse_response(response_publish);
        if let Err(e) = &mut result {
            e.command_name.get_or_insert_with(|| self.command_name.clone());
            e.correlation_id.get_or_insert(correlation_id);
        }
        result
    }

    /// Validate and deserialize a correlated response publish.
    fn parse_response(&self, publish: Publish) -> Result<Response<TResp>, ProtocolError> {
        let properties = publish
            .properties
            .ok_or_else(|| {
                ProtocolError::new_header_missing_error(
                    "Properties",
                    false,
                    Some("Properties missing from response message".to_string()),
                    None,
                )
            })?;

        // Partition reserved properties from custom user data
        let mut custom_user_data = Vec::new();
        let mut reserved = HashMap::new();
        for (key, value) in properties.user_properties {
            match UserProperty::from_str(&key) {
                Ok(p) => {
                    reserved.insert(p, value);
                }
                Err(()) => custom_user_data.push((key, value)),
            }
        }

        // The protocol version gates the meaning of everything else, so it is
        // checked first
        let protocol_version = match reserved.get(&UserProperty::ProtocolVersion) {
            Some(version) => ProtocolVersion::parse(version).ok_or_else(|| {
                ProtocolError::new_unsupported_version_error(
                    Some(format!(
                        "Received a response with an unparsable protocol version: {version}"
                    )),
                    version.clone(),
                    SUPPORTED_PROTOCOL_VERSIONS.to_vec(),
                    VersionRole::Response,
                    false,
                    None,
                )
            })?,
            None => DEFAULT_RPC_PROTOCOL_VERSION,
        };
        if !protocol_version.is_supported(SUPPORTED_PROTOCOL_VERSIONS) {
            return Err(ProtocolError::new_unsupported_version_error(
                None,
                protocol_version.to_string(),
                SUPPORTED_PROTOCOL_VERSIONS.to_vec(),
                VersionRole::Response,
                false,
                None,
            ));
        }

        let status = match reserved.remove(&UserProperty::Status) {
            Some(status) => match StatusCode::from_str(&status) {
                Ok(status) => status,
                Err(StatusCodeParseError::InvalidStatusCode(s)) => {
                    return Err(ProtocolError::new_header_invalid_error(
                        &UserProperty::Status.to_string(),
                        &s,
                        false,
                        Some(format!("Could not parse status '{s}' as an integer")),
                        None,
                    ));
                }
                Err(StatusCodeParseError::UnknownStatusCode(_)) => {
                    let mut e = ProtocolError::new_unknown_error(
                        true,
                        false,
                        None,
                        reserved.remove(&UserProperty::StatusMessage),
                        None,
                    );
                    e.property_name = reserved.remove(&UserProperty::InvalidPropertyName);
                    e.property_value = reserved
                        .remove(&UserProperty::InvalidPropertyValue)
                        .map(Value::String);
                    return Err(e);
                }
            },
            None => {
                return Err(ProtocolError::new_header_missing_error(
                    &UserProperty::Status.to_string(),
                    false,
                    Some(format!(
                        "Response missing MQTT user property '{}'",
                        UserProperty::Status
                    )),
                    None,
                ));
            }
        };

        // Merge the response timestamp into the application clock
        let timestamp = match reserved.get(&UserProperty::Timestamp) {
            Some(encoded) => {
                let hlc = HybridLogicalClock::from_str(encoded).map_err(|e| {
                    e.into_header_invalid(&UserProperty::Timestamp.to_string(), false)
                })?;
                self.application_hlc.update(&hlc)?;
                Some(hlc)
            }
            None => None,
        };

        match status {
            StatusCode::Ok | StatusCode::NoContent => {
                if status == StatusCode::NoContent && !publish.payload.is_empty() {
                    return Err(ProtocolError::new_payload_invalid_error(
                        false,
                        false,
                        None,
                        Some("Status code 204 (No Content) should not have a payload".to_string()),
                        None,
                    ));
                }
                let format_indicator = properties
                    .payload_format_indicator
                    .try_into()
                    .unwrap_or_else(|e| {
                        log::error!(
                            "Received invalid payload format indicator: {e}. Using default."
                        );
                        FormatIndicator::default()
                    });
                let payload = match TResp::deserialize(
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
                Ok(Response {
                    payload,
                    content_type: properties.content_type,
                    format_indicator,
                    custom_user_data,
                    timestamp,
                })
            }
            _ => Err(Self::remote_status_into_error(status, &mut reserved)),
        }
    }

    /// Translate a non-success status and its accompanying reserved properties
    /// into the corresponding typed error.
    fn remote_status_into_error(
        status: StatusCode,
        reserved: &mut HashMap<UserProperty, String>,
    ) -> ProtocolError {
        let status_message = reserved.remove(&UserProperty::StatusMessage);
        let remote_message_provided = status_message.is_some();
        let is_application_error = reserved
            .get(&UserProperty::IsApplicationError)
            .is_some_and(|v| v == "true");
        let invalid_property_name = reserved.remove(&UserProperty::InvalidPropertyName);
        let invalid_property_value = reserved.remove(&UserProperty::InvalidPropertyValue);

        let mut e = ProtocolError::new_unknown_error(true, false, None, status_message, None);
        e.http_status_code = Some(status as u16);

        match status {
            StatusCode::Ok | StatusCode::NoContent => {
                unreachable!("success statuses are handled by the response path")
            }
            StatusCode::BadRequest => {
                if invalid_property_value.is_some() {
                    e.kind = ProtocolErrorKind::HeaderInvalid;
                    e.header_name = invalid_property_name;
                    e.header_value = invalid_property_value;
                } else if invalid_property_name.is_some() {
                    e.kind = ProtocolErrorKind::HeaderMissing;
                    e.header_name = invalid_property_name;
                } else {
                    e.kind = ProtocolErrorKind::PayloadInvalid;
                }
            }
            StatusCode::RequestTimeout => {
                e.kind = ProtocolErrorKind::Timeout;
                e.timeout_name = invalid_property_name;
                e.timeout_value = invalid_property_value.and_then(|timeout| {
                    timeout
                        .parse::<iso8601_duration::Duration>()
                        .ok()
                        .and_then(|d| d.to_std())
                });
            }
            StatusCode::UnsupportedMediaType => {
                e.kind = ProtocolErrorKind::HeaderInvalid;
                e.header_name = invalid_property_name;
                e.header_value = invalid_property_value;
            }
            StatusCode::UnprocessableContent => {
                e.kind = ProtocolErrorKind::PayloadInvalid;
                e.in_application = is_application_error;
            }
            StatusCode::InternalServerError => {
                if is_application_error {
                    e.kind = ProtocolErrorKind::ExecutionException;
                    e.in_application = true;
                    e.property_name = invalid_property_name;
                    e.property_value = invalid_property_value.map(Value::String);
                } else if invalid_property_name.is_some() {
                    e.kind = ProtocolErrorKind::InternalLogicError;
                    e.property_name = invalid_property_name;
                    e.property_value = invalid_property_value.map(Value::String);
                } else {
                    e.kind = ProtocolErrorKind::UnknownError;
                }
            }
            StatusCode::ServiceUnavailable => {
                e.kind = ProtocolErrorKind::StateInvalid;
                e.header_name = invalid_property_name;
                e.header_value = invalid_property_value;
            }
            StatusCode::VersionNotSupported => {
                e.kind = ProtocolErrorKind::UnsupportedVersion;
                e.version_role = Some(VersionRole::Request);
                e.protocol_version = reserved.remove(&UserProperty::RequestProtocolVersion);
                e.supported_protocol_major_versions = reserved
                    .get(&UserProperty::SupportedMajorVersions)
                    .map(|s| parse_supported_protocol_major_versions(s));
            }
        }
        // Regenerate the default message for the final kind unless the remote
        // peer supplied one
        if !remote_message_provided {
            e.message = None;
            e.ensure_error_message();
        }
        e
    }

    /// Subscribe to the response topic filter.
    async fn subscribe_to_response_filter(&self) -> Result<(), ProtocolError> {
        let response_filter = self.response_topic_pattern.as_subscribe_topic();
        match self
            .mqtt_client
            .subscribe(Subscribe::new(response_filter, QoS::AtLeastOnce))
            .await
        {
            Ok(suback) if suback.reason_code.is_success() => Ok(()),
            Ok(suback) => Err(ProtocolError::new_mqtt_error(
                Some(format!(
                    "Response subscribe rejected by broker: {:?}",
                    suback.reason_code
                )),
                Box::new(std::io::Error::other("suback failure")),
                Some(self.command_name.clone()),
            )),
            Err(e) => {
                log::error!("[{}] Client error while subscribing: {e}", self.command_name);
                Err(ProtocolError::new_mqtt_error(
                    Some("Client error on command invoker subscribe".to_string()),
                    Box::new(e),
                    Some(self.command_name.clone()),
                ))
            }
        }
    }

    /// Matches incoming response publishes to pending invocations by
    /// correlation id. Responses with no pending entry are discarded.
    async fn receive_response_loop(
        mut receiver: C::Receiver,
        pending: PendingMap,
        shutdown: CancellationToken,
        command_name: String,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                message = receiver.recv() => {
                    let Some((publish, _token)) = message else { break };
                    let correlation_id = publish
                        .properties
                        .as_ref()
                        .and_then(|p| p.correlation_data.as_ref())
                        .and_then(|data| Uuid::from_slice(data).ok());
                    let Some(correlation_id) = correlation_id else {
                        log::warn!(
                            "[{command_name}] Discarding response without a valid correlation id"
                        );
                        continue;
                    };
                    let entry = pending.lock().unwrap().remove(&correlation_id);
                    match entry {
                        Some(response_tx) => {
                            let _ = response_tx.send(publish);
                        }
                        None => {
                            log::debug!(
                                "[{command_name}] Discarding response with no pending request ({correlation_id})"
                            );
                        }
                    }
                }
            }
        }
        // Fail any invocations still waiting by dropping their senders
        pending.lock().unwrap().clear();
        log::debug!("[{command_name}] Response receive loop ended");
    }

    /// Shut down the [`Invoker`], unsubscribing from the response topic and
    /// failing outstanding invocations with a cancellation error.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind [`MqttError`](ProtocolErrorKind::MqttError)
    /// if the unsubscribe fails; the method may be called again to retry.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().await;
        if let State::Subscribed = *state {
            match self
                .mqtt_client
                .unsubscribe(Unsubscribe::new(
                    self.response_topic_pattern.as_subscribe_topic(),
                ))
                .await
            {
                Ok(unsuback) if unsuback.reason_code.is_success() => {}
                Ok(unsuback) => {
                    return Err(ProtocolError::new_mqtt_error(
                        Some(format!(
                            "Response unsubscribe rejected by broker: {:?}",
                            unsuback.reason_code
                        )),
                        Box::new(std::io::Error::other("unsuback failure")),
                        Some(self.command_name.clone()),
                    ));
                }
                Err(e) => {
                    return Err(ProtocolError::new_mqtt_error(
                        Some("Client error on command invoker unsubscribe".to_string()),
                        Box::new(e),
                        Some(self.command_name.clone()),
                    ));
                }
            }
        }
        *state = State::Shutdown;
        self.shutdown.cancel();
        log::info!("[{}] Invoker shutdown", self.command_name);
        Ok(())
    }
}

impl<TReq, TResp, C> Drop for Invoker<TReq, TResp, C>
where
    TReq: PayloadSerialize + 'static,
    TResp: PayloadSerialize + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::Receiver: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
