// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command executor: subscribes to a request topic pattern, dispatches
//! received requests to a user handler with bounded concurrency, and publishes
//! correlated responses.

use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgelink_mqtt::control_packet::{
    Publish, PublishProperties, QoS, Subscribe, Unsubscribe,
};
use edgelink_mqtt::interface::{AckToken, ManagedClient, MessageReceiver};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::{ApplicationContext, ApplicationHybridLogicalClock};
use crate::common::hybrid_logical_clock::HybridLogicalClock;
use crate::common::payload_serialize::{
    DeserializationError, FormatIndicator, PayloadSerialize, SerializedPayload,
};
use crate::common::protocol_error::{ProtocolError, Value};
use crate::common::topic_pattern::{contains_invalid_char, is_valid_replacement, TopicPattern};
use crate::common::user_properties::{validate_user_properties, UserProperty};
use crate::rpc::dispatcher::{Dispatcher, DispatcherRegistry, DEFAULT_CONCURRENCY};
use crate::rpc::response_cache::{
    CacheKey, CacheOutcome, CachedResponse, PendingState, ResponseCache,
};
use crate::rpc::{
    StatusCode, DEFAULT_RPC_PROTOCOL_VERSION, RPC_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::{supported_protocol_major_versions_to_string, ProtocolVersion};

/// Interval between eager sweeps of expired response cache entries.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A received command request, handed to the user handler.
pub struct Request<TReq>
where
    TReq: PayloadSerialize,
{
    /// Payload of the command request.
    pub payload: TReq,
    /// Content type of the command request.
    pub content_type: Option<String>,
    /// Format indicator of the command request.
    pub format_indicator: FormatIndicator,
    /// Custom user data set as MQTT user properties on the request message.
    pub custom_user_data: Vec<(String, String)>,
    /// Timestamp of the command request.
    pub timestamp: Option<HybridLogicalClock>,
    /// Fencing token attached to the request, for stale-write rejection
    /// against a reference clock.
    pub fencing_token: Option<HybridLogicalClock>,
    /// Client id of the invoker of the command, when present.
    pub invoker_id: Option<String>,
    /// Correlation id of the request.
    pub correlation_id: Uuid,
    /// Topic token values resolved from the incoming request's topic.
    pub topic_tokens: HashMap<String, String>,
}

/// A command response produced by the user handler.
/// Used by the [`Executor`].
#[derive(Builder, Clone, Debug)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct Response<TResp>
where
    TResp: PayloadSerialize,
{
    /// Payload of the command response, serialized at build time. An empty
    /// payload is transmitted with status 204 (No Content).
    #[builder(setter(custom))]
    serialized_payload: SerializedPayload,
    /// Strongly link `Response` with type `TResp`
    #[builder(private)]
    response_payload_type: PhantomData<TResp>,
    /// Custom user data set as MQTT user properties on the response message.
    /// Keys must not start with the reserved `__` prefix.
    #[builder(default)]
    custom_user_data: Vec<(String, String)>,
}

impl<TResp: PayloadSerialize> ResponseBuilder<TResp> {
    /// Add a payload to the command response. Validates successful
    /// serialization of the payload.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`PayloadInvalid`](crate::common::protocol_error::ProtocolErrorKind::PayloadInvalid)
    /// if serialization fails, or of kind
    /// [`ConfigurationInvalid`](crate::common::protocol_error::ProtocolErrorKind::ConfigurationInvalid)
    /// if the content type is not valid for transmission.
    pub fn payload(&mut self, payload: TResp) -> Result<&mut Self, ProtocolError> {
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
                            "Content type '{}' of command response is not valid",
                            serialized_payload.content_type
                        )),
                        None,
                    ));
                }
                self.serialized_payload = Some(serialized_payload);
                self.response_payload_type = Some(PhantomData);
                Ok(self)
            }
        }
    }

    /// Validate the command response.
    ///
    /// # Errors
    /// Returns a `String` describing the error if any of `custom_user_data`'s
    /// keys starts with the reserved prefix or is not valid for transmission.
    fn validate(&self) -> Result<(), String> {
        if let Some(custom_user_data) = &self.custom_user_data {
            validate_user_properties(custom_user_data)?;
        }
        Ok(())
    }
}

/// The future returned by a request handler.
pub type HandlerFuture<TResp> =
    Pin<Box<dyn Future<Output = Result<Response<TResp>, Box<dyn Error + Send + Sync>>> + Send>>;

/// User code invoked for each received request.
///
/// The [`CancellationToken`] is cancelled when the executor shuts down; long
/// executions should observe it. A returned error is reported to the invoker
/// as status 500 with the error's message and the application-error flag set.
pub type RequestHandler<TReq, TResp> =
    Arc<dyn Fn(Request<TReq>, CancellationToken) -> HandlerFuture<TResp> + Send + Sync>;

/// Command Executor Options.
#[derive(Builder, Clone)]
#[builder(setter(into))]
pub struct Options {
    /// Topic pattern for the command request.
    request_topic_pattern: String,
    /// Command name
    command_name: String,
    /// Optional topic namespace prepended to the topic pattern
    #[builder(default = "None")]
    topic_namespace: Option<String>,
    /// Topic token keys/values resident for the executor's lifetime
    #[builder(default)]
    topic_token_map: HashMap<String, String>,
    /// Denotes if the command is idempotent, enabling response caching
    #[builder(default = "false")]
    is_idempotent: bool,
    /// TTL for cached responses of an idempotent command. Zero disables the
    /// cache.
    #[builder(default = "Duration::ZERO")]
    cacheable_duration: Duration,
    /// Service group for a shared subscription; each request is delivered to
    /// exactly one executor in the group
    #[builder(default = "None")]
    service_group_id: Option<String>,
}

/// Describes the lifecycle state of an executor.
#[derive(PartialEq)]
enum State {
    New,
    Started,
    Shutdown,
}

/// Context shared by the receive loop and its dispatched work items.
struct Shared<TReq, TResp, C>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: ManagedClient,
{
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    mqtt_client: C,
    handler: RequestHandler<TReq, TResp>,
    command_name: String,
    request_topic_pattern: Arc<TopicPattern>,
    cache: Option<Arc<ResponseCache>>,
    dispatcher: Arc<Dispatcher>,
    cancellation: CancellationToken,
}

/// Accumulates the outcome of the request validation ladder for building an
/// error response.
struct ResponseArguments {
    response_topic: String,
    correlation_data: Option<Bytes>,
    status: StatusCode,
    status_message: Option<String>,
    is_application_error: bool,
    invalid_property_name: Option<String>,
    invalid_property_value: Option<String>,
    supported_protocol_major_versions: Option<Vec<u16>>,
    request_protocol_version: Option<String>,
}

impl ResponseArguments {
    fn ok(response_topic: String) -> Self {
        Self {
            response_topic,
            correlation_data: None,
            status: StatusCode::Ok,
            status_message: None,
            is_application_error: false,
            invalid_property_name: None,
            invalid_property_value: None,
            supported_protocol_major_versions: None,
            request_protocol_version: None,
        }
    }
}

/// Command Executor.
///
/// Owns the subscription to the request topic pattern and a background receive
/// loop started by [`start`](Executor::start). Requests are dispatched to the
/// handler with bounded concurrency; responses appear in whatever order
/// executions complete.
pub struct Executor<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + 'static,
    TResp: PayloadSerialize + Send + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::Receiver: Send + Sync + 'static,
{
    application_hlc: Arc<ApplicationHybridLogicalClock>,
    dispatchers: Arc<DispatcherRegistry>,
    mqtt_client: C,
    receiver: Option<C::Receiver>,
    handler: RequestHandler<TReq, TResp>,
    command_name: String,
    request_topic_pattern: Arc<TopicPattern>,
    cache: Option<Arc<ResponseCache>>,
    state: State,
    cancellation: CancellationToken,
}

impl<TReq, TResp, C> Executor<TReq, TResp, C>
where
    TReq: PayloadSerialize + Send + 'static,
    TResp: PayloadSerialize + Send + 'static,
    C: ManagedClient + Clone + Send + Sync + 'static,
    C::Receiver: Send + Sync + 'static,
{
    /// Creates a new [`Executor`] with its request handler.
    ///
    /// # Arguments
    /// * `application_context` - [`ApplicationContext`] the executor is part of
    /// * `client` - The MQTT client to use for communication
    /// * `executor_options` - Configuration options
    /// * `handler` - User code invoked for each received request
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`ConfigurationInvalid`](crate::common::protocol_error::ProtocolErrorKind::ConfigurationInvalid)
    /// if the command name, topic pattern, namespace, service group, or
    /// resident token replacements are invalid.
    pub fn new(
        application_context: ApplicationContext,
        client: C,
        executor_options: Options,
        handler: RequestHandler<TReq, TResp>,
    ) -> Result<Self, ProtocolError> {
        if executor_options.command_name.is_empty()
            || contains_invalid_char(&executor_options.command_name)
        {
            return Err(ProtocolError::new_configuration_invalid_error(
                None,
                "command_name",
                Value::String(executor_options.command_name.clone()),
                None,
                Some(executor_options.command_name),
            ));
        }

        let request_topic_pattern = TopicPattern::new(
            &executor_options.request_topic_pattern,
            executor_options.service_group_id,
            executor_options.topic_namespace.as_deref(),
            &executor_options.topic_token_map,
        )
        .map_err(|e| {
            ProtocolError::new_configuration_invalid_error(
                Some(Box::new(e)),
                "request_topic_pattern",
                Value::String(executor_options.request_topic_pattern.clone()),
                None,
                Some(executor_options.command_name.clone()),
            )
        })?;

        let receiver = client
            .create_filtered_receiver(&request_topic_pattern.as_subscribe_topic(), false)
            .map_err(|e| {
                ProtocolError::new_configuration_invalid_error(
                    Some(Box::new(e)),
                    "request_topic_pattern",
                    Value::String(request_topic_pattern.as_subscribe_topic()),
                    Some("Could not register request topic receiver".to_string()),
                    Some(executor_options.command_name.clone()),
                )
            })?;

        let cache = if executor_options.is_idempotent
            && !executor_options.cacheable_duration.is_zero()
        {
            Some(ResponseCache::new(executor_options.cacheable_duration))
        } else {
            None
        };

        Ok(Self {
            application_hlc: application_context.application_hlc,
            dispatchers: application_context.dispatchers,
            mqtt_client: client,
            receiver: Some(receiver),
            handler,
            command_name: executor_options.command_name,
            request_topic_pattern: Arc::new(request_topic_pattern),
            cache,
            state: State::New,
            cancellation: CancellationToken::new(),
        })
    }

    /// Subscribe to the request topic pattern and begin receiving.
    ///
    /// # Arguments
    /// * `preferred_concurrency` - Number of requests executed in parallel for
    ///   this client id (default 10). The first executor started on a client
    ///   id fixes the shared dispatcher's concurrency.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`StateInvalid`](crate::common::protocol_error::ProtocolErrorKind::StateInvalid)
    /// if the executor was already started, or of kind
    /// [`MqttError`](crate::common::protocol_error::ProtocolErrorKind::MqttError)
    /// if the subscribe fails.
    pub async fn start(
        &mut self,
        preferred_concurrency: Option<usize>,
    ) -> Result<(), ProtocolError> {
        if self.state != State::New {
            return Err(ProtocolError::new_state_invalid_error(
                "executor_state",
                None,
                Some("Executor has already been started".to_string()),
                Some(self.command_name.clone()),
            ));
        }

        let subscribe_topic = self.request_topic_pattern.as_subscribe_topic();
        match self
            .mqtt_client
            .subscribe(Subscribe::new(subscribe_topic, QoS::AtLeastOnce))
            .await
        {
            Ok(suback) if suback.reason_code.is_success() => {}
            Ok(suback) => {
                return Err(ProtocolError::new_mqtt_error(
                    Some(format!(
                        "Request subscribe rejected by broker: {:?}",
                        suback.reason_code
                    )),
                    Box::new(std::io::Error::other("suback failure")),
                    Some(self.command_name.clone()),
                ));
            }
            Err(e) => {
                log::error!(
                    "[{}] Client error while subscribing: {e}",
                    self.command_name
                );
                return Err(ProtocolError::new_mqtt_error(
                    Some("Client error on command executor subscribe".to_string()),
                    Box::new(e),
                    Some(self.command_name.clone()),
                ));
            }
        }

        let dispatcher = self.dispatchers.get_or_create(
            self.mqtt_client.client_id(),
            preferred_concurrency.unwrap_or(DEFAULT_CONCURRENCY),
        );
        let shared = Arc::new(Shared {
            application_hlc: self.application_hlc.clone(),
            mqtt_client: self.mqtt_client.clone(),
            handler: self.handler.clone(),
            command_name: self.command_name.clone(),
            request_topic_pattern: self.request_topic_pattern.clone(),
            cache: self.cache.clone(),
            dispatcher,
            cancellation: self.cancellation.clone(),
        });

        let receiver = self.receiver.take().ok_or_else(|| {
            ProtocolError::new_state_invalid_error(
                "receiver",
                None,
                Some("Executor receiver is no longer available".to_string()),
                Some(self.command_name.clone()),
            )
        })?;
        tokio::spawn(Self::receive_loop(receiver, shared));

        if let Some(cache) = &self.cache {
            tokio::spawn(Self::sweep_cache_loop(
                cache.clone(),
                self.cancellation.clone(),
            ));
        }

        self.state = State::Started;
        log::info!("[{}] Executor started", self.command_name);
        Ok(())
    }

    /// Unsubscribe from the request topic and drain.
    ///
    /// In-flight executions observe the cancellation token passed to the
    /// handler. Already-received requests that have not begun executing are
    /// still acknowledged.
    ///
    /// # Errors
    /// [`ProtocolError`] of kind
    /// [`MqttError`](crate::common::protocol_error::ProtocolErrorKind::MqttError)
    /// if the unsubscribe fails; the method may be called again to retry.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        if self.state == State::Started {
            match self
                .mqtt_client
                .unsubscribe(Unsubscribe::new(
                    self.request_topic_pattern.as_subscribe_topic(),
                ))
                .await
            {
                Ok(unsuback) if unsuback.reason_code.is_success() => {}
                Ok(unsuback) => {
                    return Err(ProtocolError::new_mqtt_error(
                        Some(format!(
                            "Request unsubscribe rejected by broker: {:?}",
                            unsuback.reason_code
                        )),
                        Box::new(std::io::Error::other("unsuback failure")),
                        Some(self.command_name.clone()),
                    ));
                }
                Err(e) => {
                    log::error!(
                        "[{}] Client error while unsubscribing: {e}",
                        self.command_name
                    );
                    return Err(ProtocolError::new_mqtt_error(
                        Some("Client error on command executor unsubscribe".to_string()),
                        Box::new(e),
                        Some(self.command_name.clone()),
                    ));
                }
            }
        }
        self.state = State::Shutdown;
        self.cancellation.cancel();
        log::info!("[{}] Executor shutdown", self.command_name);
        Ok(())
    }

    /// Receive requests until shutdown or receiver closure.
    async fn receive_loop(mut receiver: C::Receiver, shared: Arc<Shared<TReq, TResp, C>>) {
        loop {
            tokio::select! {
                () = shared.cancellation.cancelled() => break,
                message = receiver.recv() => {
                    let Some((publish, ack_token)) = message else { break };
                    log::info!(
                        "[{}][pkid: {}] Received request",
                        shared.command_name,
                        publish.pkid
                    );
                    Self::handle_publish(&shared, publish, ack_token);
                }
            }
        }
        receiver.close();
        log::debug!("[{}] Request receive loop ended", shared.command_name);
    }

    /// Validate one received publish and dispatch it.
    ///
    /// Requests that cannot be responded to (missing or invalid response
    /// topic) are acknowledged and dropped. Everything else produces a
    /// response through the dispatcher, which always acknowledges afterwards.
    fn handle_publish(
        shared: &Arc<Shared<TReq, TResp, C>>,
        publish: Publish,
        ack_token: Option<AckToken>,
    ) {
        let received_at = Instant::now();
        let acknowledge = {
            let command_name = shared.command_name.clone();
            let pkid = publish.pkid;
            move || {
                if let Some(token) = ack_token {
                    if let Err(e) = token.ack() {
                        log::error!("[{command_name}][pkid: {pkid}] Ack failed: {e}");
                    }
                }
            }
        };

        let Some(properties) = publish.properties else {
            log::error!(
                "[{}][pkid: {}] Properties missing; dropping request",
                shared.command_name,
                publish.pkid
            );
            acknowledge();
            return;
        };

        // Without a usable response topic there is nobody to answer
        let response_topic = match &properties.response_topic {
            Some(topic) if is_valid_replacement(topic) => topic.clone(),
            Some(topic) => {
                log::error!(
                    "[{}][pkid: {}] Response topic '{topic}' invalid; dropping request",
                    shared.command_name,
                    publish.pkid
                );
                acknowledge();
                return;
            }
            None => {
                log::error!(
                    "[{}][pkid: {}] Response topic missing; dropping request",
                    shared.command_name,
                    publish.pkid
                );
                acknowledge();
                return;
            }
        };

        let mut args = ResponseArguments::ok(response_topic);

        // Expiration: the message expiry interval doubles as the execution
        // budget
        let mut expiration = None;
        match properties.message_expiry_interval {
            Some(seconds) => {
                expiration = received_at.checked_add(Duration::from_secs(u64::from(seconds)));
                if expiration.is_none() {
                    args.status = StatusCode::InternalServerError;
                    args.status_message =
                        Some("Unable to calculate command expiration time".to_string());
                }
            }
            None => {
                args.status = StatusCode::BadRequest;
                args.status_message = Some("Message expiry interval missing".to_string());
                args.invalid_property_name = Some("Message Expiry".to_string());
            }
        }

        // Correlation data must be a 16-byte UUID
        let mut correlation_id = None;
        match &properties.correlation_data {
            Some(data) => {
                args.correlation_data = Some(data.clone());
                match Uuid::from_slice(data) {
                    Ok(id) => correlation_id = Some(id),
                    Err(_) if args.status == StatusCode::Ok => {
                        args.status = StatusCode::BadRequest;
                        args.status_message =
                            Some("Correlation data bytes do not conform to a GUID.".to_string());
                        args.invalid_property_name = Some("Correlation Data".to_string());
                        if let Ok(correlation_str) = String::from_utf8(data.to_vec()) {
                            args.invalid_property_value = Some(correlation_str);
                        }
                    }
                    Err(_) => {}
                }
            }
            None if args.status == StatusCode::Ok => {
                args.status = StatusCode::BadRequest;
                args.status_message = Some("Correlation data missing".to_string());
                args.invalid_property_name = Some("Correlation Data".to_string());
            }
            None => {}
        }

        // The request is processed only if the ladder has not already failed
        let request = match (args.status, correlation_id) {
            (StatusCode::Ok, Some(correlation_id)) => Self::parse_request(
                shared,
                &publish.payload,
                properties,
                &publish.topic,
                &mut args,
            )
            .map(|mut request| {
                request.correlation_id = correlation_id;
                request
            }),
            _ => None,
        };

        let task_shared = shared.clone();
        let process = async move {
            match request {
                Some(request) => {
                    Self::execute_and_respond(&task_shared, request, args, expiration).await;
                }
                None => {
                    // Validation failed; report the error to the invoker
                    let response =
                        build_response_publish(&task_shared.application_hlc, args, None, &[]);
                    publish_response(&task_shared, response).await;
                }
            }
        };
        shared.dispatcher.submit(process, acknowledge);
    }

    /// Parse headers and payload into a typed [`Request`], or fill `args` with
    /// the error response to send.
    fn parse_request(
        shared: &Arc<Shared<TReq, TResp, C>>,
        payload: &[u8],
        properties: PublishProperties,
        topic: &str,
        args: &mut ResponseArguments,
    ) -> Option<Request<TReq>> {
        // Protocol version gating comes first; nothing else is meaningful on a
        // version mismatch
        let mut request_version = DEFAULT_RPC_PROTOCOL_VERSION;
        if let Some((_, version)) = properties
            .user_properties
            .iter()
            .find(|(key, _)| UserProperty::from_str(key) == Ok(UserProperty::ProtocolVersion))
        {
            match ProtocolVersion::parse(version) {
                Some(parsed) => request_version = parsed,
                None => {
                    args.status = StatusCode::VersionNotSupported;
                    args.status_message =
                        Some(format!("Unparsable protocol version value provided: {version}"));
                    args.supported_protocol_major_versions =
                        Some(SUPPORTED_PROTOCOL_VERSIONS.to_vec());
                    args.request_protocol_version = Some(version.clone());
                    return None;
                }
            }
        }
        if !request_version.is_supported(SUPPORTED_PROTOCOL_VERSIONS) {
            args.status = StatusCode::VersionNotSupported;
            args.status_message = Some(format!(
                "The command executor only supports major protocol versions {SUPPORTED_PROTOCOL_VERSIONS:?}, but the request was sent with version '{request_version}'"
            ));
            args.supported_protocol_major_versions = Some(SUPPORTED_PROTOCOL_VERSIONS.to_vec());
            args.request_protocol_version = Some(request_version.to_string());
            return None;
        }

        let mut custom_user_data = Vec::new();
        let mut timestamp = None;
        let mut fencing_token = None;
        let mut source_id = None;
        let mut legacy_invoker_id = None;
        for (key, value) in properties.user_properties {
            match UserProperty::from_str(&key) {
                Ok(UserProperty::Timestamp) => match HybridLogicalClock::from_str(&value) {
                    Ok(hlc) => {
                        if let Err(e) = shared.application_hlc.update(&hlc) {
                            args.status = match e.kind {
                                crate::common::protocol_error::ProtocolErrorKind::StateInvalid => {
                                    StatusCode::ServiceUnavailable
                                }
                                _ => StatusCode::InternalServerError,
                            };
                            args.status_message = Some(format!(
                                "Failure updating application clock against {value}: {e}"
                            ));
                            args.invalid_property_name =
                                Some(UserProperty::Timestamp.to_string());
                            args.invalid_property_value = Some(value);
                            return None;
                        }
                        timestamp = Some(hlc);
                    }
                    Err(e) => {
                        args.status = StatusCode::BadRequest;
                        args.status_message = Some(format!("Timestamp invalid: {e}"));
                        args.invalid_property_name = Some(UserProperty::Timestamp.to_string());
                        args.invalid_property_value = Some(value);
                        return None;
                    }
                },
                Ok(UserProperty::FencingToken) => match HybridLogicalClock::from_str(&value) {
                    Ok(hlc) => fencing_token = Some(hlc),
                    Err(e) => {
                        args.status = StatusCode::BadRequest;
                        args.status_message = Some(format!("Fencing token invalid: {e}"));
                        args.invalid_property_name =
                            Some(UserProperty::FencingToken.to_string());
                        args.invalid_property_value = Some(value);
                        return None;
                    }
                },
                Ok(UserProperty::SourceId) => source_id = Some(value),
                Ok(UserProperty::InvokerId) => legacy_invoker_id = Some(value),
                Ok(UserProperty::ProtocolVersion) => { /* already processed */ }
                Ok(_) => {
                    // Response-only reserved properties have no business on a
                    // request, but are tolerated
                    log::warn!(
                        "[{}] Request should not contain MQTT user property '{key}'",
                        shared.command_name
                    );
                    custom_user_data.push((key, value));
                }
                Err(()) => custom_user_data.push((key, value)),
            }
        }

        let format_indicator = properties
            .payload_format_indicator
            .try_into()
            .unwrap_or_else(|e| {
                log::error!("Received invalid payload format indicator: {e}. Using default.");
                FormatIndicator::default()
            });
        let payload = match TReq::deserialize(
            payload,
            properties.content_type.as_ref(),
            &format_indicator,
        ) {
            Ok(payload) => payload,
            Err(DeserializationError::InvalidPayload(e)) => {
                args.status = StatusCode::BadRequest;
                args.status_message = Some(format!("Error deserializing payload: {e:?}"));
                return None;
            }
            Err(DeserializationError::UnsupportedContentType(message)) => {
                args.status = StatusCode::UnsupportedMediaType;
                args.status_message = Some(message);
                args.invalid_property_name = Some("Content Type".to_string());
                args.invalid_property_value =
                    Some(properties.content_type.unwrap_or_else(|| "None".to_string()));
                return None;
            }
        };

        Some(Request {
            payload,
            content_type: properties.content_type,
            format_indicator,
            custom_user_data,
            timestamp,
            fencing_token,
            // Prefer __srcId; fall back to the legacy __invId alias
            invoker_id: source_id.or(legacy_invoker_id),
            correlation_id: Uuid::nil(), // overwritten by the caller
            topic_tokens: shared.request_topic_pattern.parse_tokens(topic),
        })
    }

    /// Run the handler (or replay/await a cache entry) and publish the
    /// response.
    async fn execute_and_respond(
        shared: &Arc<Shared<TReq, TResp, C>>,
        request: Request<TReq>,
        args: ResponseArguments,
        expiration: Option<Instant>,
    ) {
        // Consult the response cache for idempotent commands
        let reservation = match &shared.cache {
            Some(cache) => {
                let key = CacheKey {
                    command_name: shared.command_name.clone(),
                    correlation_id: request.correlation_id,
                    invoker_id: request.invoker_id.clone().unwrap_or_default(),
                };
                match cache.lookup_or_reserve(key) {
                    CacheOutcome::Hit(cached) => {
                        log::debug!(
                            "[{}] Replaying cached response for {}",
                            shared.command_name,
                            request.correlation_id
                        );
                        publish_cached(shared, &args.response_topic, &cached).await;
                        return;
                    }
                    CacheOutcome::Coalesced(mut rx) => {
                        // Another arrival of the same request is executing;
                        // deliver its result when it lands
                        let cached = {
                            let result = rx
                                .wait_for(|state| matches!(state, PendingState::Done(_)))
                                .await;
                            match result.as_deref() {
                                Ok(PendingState::Done(Some(cached))) => Some(cached.clone()),
                                _ => None,
                            }
                        };
                        match cached {
                            Some(cached) => {
                                publish_cached(shared, &args.response_topic, &cached).await;
                            }
                            None => {
                                log::warn!(
                                    "[{}] Coalesced execution for {} produced no response",
                                    shared.command_name,
                                    request.correlation_id
                                );
                            }
                        }
                        return;
                    }
                    CacheOutcome::Reserved(reservation) => Some(reservation),
                }
            }
            None => None,
        };

        // Race the handler against the request's remaining lifetime
        let handler_future = (shared.handler)(request, shared.cancellation.child_token());
        let outcome = match expiration {
            Some(expiration) => {
                tokio::select! {
                    biased;
                    result = handler_future => Some(result),
                    () = tokio::time::sleep_until(expiration) => None,
                }
            }
            None => Some(handler_future.await),
        };

        let mut store_in_cache = true;
        let response = match outcome {
            Some(Ok(response)) => {
                let mut args = args;
                if response.serialized_payload.payload.is_empty() {
                    args.status = StatusCode::NoContent;
                }
                build_response_publish(
                    &shared.application_hlc,
                    args,
                    Some(response.serialized_payload),
                    &response.custom_user_data,
                )
            }
            Some(Err(e)) => {
                // Handler failure becomes a 500 with the application-error flag
                log::warn!(
                    "[{}] Handler returned an error: {e}",
                    shared.command_name
                );
                let mut args = args;
                args.status = StatusCode::InternalServerError;
                args.status_message = Some(e.to_string());
                args.is_application_error = true;
                build_response_publish(&shared.application_hlc, args, None, &[])
            }
            None => {
                log::warn!(
                    "[{}] Execution timed out before completion",
                    shared.command_name
                );
                // Delivered to coalesced waiters but never replayed from cache
                store_in_cache = false;
                let mut args = args;
                args.status = StatusCode::RequestTimeout;
                args.status_message = Some("Command execution timed out".to_string());
                args.invalid_property_name = Some("Message Expiry".to_string());
                build_response_publish(&shared.application_hlc, args, None, &[])
            }
        };

        if let Some(reservation) = reservation {
            let cached = Arc::new(CachedResponse {
                payload: response.payload.to_vec(),
                properties: response.properties.clone().unwrap_or_default(),
            });
            reservation.complete(cached, store_in_cache);
        }

        publish_response(shared, response).await;
    }

    /// Periodically evict expired cache entries.
    async fn sweep_cache_loop(cache: Arc<ResponseCache>, cancellation: CancellationToken) {
        loop {
            tokio::select! {
                () = cancellation.cancelled() => break,
                () = tokio::time::sleep(CACHE_SWEEP_INTERVAL) => cache.sweep(),
            }
        }
    }
}

/// Assemble the wire response for both success and error paths.
fn build_response_publish(
    application_hlc: &Arc<ApplicationHybridLogicalClock>,
    args: ResponseArguments,
    payload: Option<SerializedPayload>,
    custom_user_data: &[(String, String)],
) -> Publish {
    let mut user_properties: Vec<(String, String)> = custom_user_data.to_vec();
    user_properties.push((
        UserProperty::Status.to_string(),
        (args.status as u16).to_string(),
    ));
    if let Some(status_message) = args.status_message {
        user_properties.push((UserProperty::StatusMessage.to_string(), status_message));
    }
    if args.is_application_error {
        user_properties.push((
            UserProperty::IsApplicationError.to_string(),
            "true".to_string(),
        ));
    }
    if let Some(name) = args.invalid_property_name {
        user_properties.push((UserProperty::InvalidPropertyName.to_string(), name));
    }
    if let Some(value) = args.invalid_property_value {
        user_properties.push((UserProperty::InvalidPropertyValue.to_string(), value));
    }
    if let Some(versions) = args.supported_protocol_major_versions {
        user_properties.push((
            UserProperty::SupportedMajorVersions.to_string(),
            supported_protocol_major_versions_to_string(&versions),
        ));
    }
    if let Some(version) = args.request_protocol_version {
        user_properties.push((UserProperty::RequestProtocolVersion.to_string(), version));
    }
    user_properties.push((
        UserProperty::ProtocolVersion.to_string(),
        RPC_PROTOCOL_VERSION.to_string(),
    ));
    match application_hlc.update_now() {
        Ok(timestamp) => {
            user_properties.push((UserProperty::Timestamp.to_string(), timestamp));
        }
        Err(e) => log::error!("Could not stamp response timestamp: {e}"),
    }

    let (payload_bytes, content_type, format_indicator) = match payload {
        Some(serialized) if !serialized.payload.is_empty() => (
            serialized.payload,
            Some(serialized.content_type),
            Some(serialized.format_indicator as u8),
        ),
        _ => (Vec::new(), None, None),
    };

    Publish::new(
        args.response_topic,
        QoS::AtLeastOnce,
        payload_bytes,
        Some(PublishProperties {
            payload_format_indicator: format_indicator,
            message_expiry_interval: None,
            topic_alias: None,
            response_topic: None,
            correlation_data: args.correlation_data,
            user_properties,
            subscription_identifiers: Vec::new(),
            content_type,
        }),
    )
}

/// Publish a response, logging failures; there is no one to report them to.
async fn publish_response<TReq, TResp, C>(shared: &Arc<Shared<TReq, TResp, C>>, response: Publish)
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: ManagedClient,
{
    match shared.mqtt_client.publish(response).await {
        Ok(puback) if puback.reason_code.is_success() => {}
        Ok(puback) => log::error!(
            "[{}] Response publish rejected by broker: {:?}",
            shared.command_name,
            puback.reason_code
        ),
        Err(e) => log::error!(
            "[{}] Client error while publishing response: {e}",
            shared.command_name
        ),
    }
}

/// Replay a cached response on the wire.
async fn publish_cached<TReq, TResp, C>(
    shared: &Arc<Shared<TReq, TResp, C>>,
    response_topic: &str,
    cached: &CachedResponse,
) where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
    C: ManagedClient,
{
    let publish = Publish::new(
        response_topic,
        QoS::AtLeastOnce,
        cached.payload.clone(),
        Some(cached.properties.clone()),
    );
    publish_response(shared, publish).await;
}
