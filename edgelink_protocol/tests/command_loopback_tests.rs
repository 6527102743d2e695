// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end command and telemetry tests: invoker and executor sessions
//! connected through the in-memory mock transport bus.

use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use edgelink_mqtt::control_packet::{Publish, PublishProperties, QoS, Subscribe};
use edgelink_mqtt::interface::{ManagedClient, MessageReceiver};
use edgelink_mqtt::mock::{MessageBus, MockTransport};
use edgelink_mqtt::session::{SessionClient, SessionOptionsBuilder};
use edgelink_mqtt::ConnectionSettingsBuilder;
use edgelink_protocol::application::{ApplicationContext, ApplicationContextOptionsBuilder};
use edgelink_protocol::common::protocol_error::ProtocolErrorKind;
use edgelink_protocol::rpc::executor::{self, HandlerFuture, RequestHandler};
use edgelink_protocol::rpc::invoker;
use edgelink_protocol::rpc::{Executor, Invoker};
use edgelink_protocol::telemetry;
use uuid::Uuid;

type RawClient = SessionClient<MockTransport>;

fn app_context() -> ApplicationContext {
    let _ = env_logger::builder().format_timestamp(None).is_test(true).try_init();
    ApplicationContext::new(ApplicationContextOptionsBuilder::default().build().unwrap())
}

async fn connected_session(bus: &MessageBus, client_id: &str) -> RawClient {
    let settings = ConnectionSettingsBuilder::default()
        .client_id(client_id)
        .hostname("localhost")
        .build()
        .unwrap();
    let options = SessionOptionsBuilder::default()
        .connection_settings(settings)
        .build()
        .unwrap();
    let client = SessionClient::new(bus.create_transport(), options);
    client.connect().await.unwrap();
    client
}

/// Wrap a plain async closure as a [`RequestHandler`].
fn handler<F, Fut>(f: F) -> RequestHandler<Vec<u8>, Vec<u8>>
where
    F: Fn(executor::Request<Vec<u8>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<executor::Response<Vec<u8>>, Box<dyn Error + Send + Sync>>>
        + Send
        + 'static,
{
    Arc::new(move |request, _cancel| -> HandlerFuture<Vec<u8>> { Box::pin(f(request)) })
}

fn ok_response(payload: Vec<u8>) -> Result<executor::Response<Vec<u8>>, Box<dyn Error + Send + Sync>>
{
    Ok(executor::ResponseBuilder::default()
        .payload(payload)
        .unwrap()
        .build()
        .unwrap())
}

/// Start an executor for one command of the counter service.
async fn start_counter_executor(
    application_context: &ApplicationContext,
    client: &RawClient,
    command_name: &str,
    request_handler: RequestHandler<Vec<u8>, Vec<u8>>,
) -> Executor<Vec<u8>, Vec<u8>, RawClient> {
    let options = executor::OptionsBuilder::default()
        .request_topic_pattern("svc/counter/{commandName}")
        .command_name(command_name)
        .topic_token_map(HashMap::from([(
            "commandName".to_string(),
            command_name.to_string(),
        )]))
        .build()
        .unwrap();
    let mut exec = Executor::new(
        application_context.clone(),
        client.clone(),
        options,
        request_handler,
    )
    .unwrap();
    exec.start(None).await.unwrap();
    exec
}

fn counter_invoker(
    application_context: &ApplicationContext,
    client: &RawClient,
    command_name: &str,
) -> Invoker<Vec<u8>, Vec<u8>, RawClient> {
    let options = invoker::OptionsBuilder::default()
        .request_topic_pattern("svc/counter/{commandName}")
        .command_name(command_name)
        .topic_token_map(HashMap::from([(
            "commandName".to_string(),
            command_name.to_string(),
        )]))
        .build()
        .unwrap();
    Invoker::new(application_context.clone(), client.clone(), options).unwrap()
}

fn request(payload: Vec<u8>) -> invoker::Request<Vec<u8>> {
    invoker::RequestBuilder::default()
        .payload(payload)
        .unwrap()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// S1: increment-counter RPC round trips through executor and invoker.
#[tokio::test(flavor = "multi_thread")]
async fn counter_rpc_round_trip() {
    let bus = MessageBus::new();
    let application_context = app_context();
    let server = connected_session(&bus, "counter-server").await;
    let client = connected_session(&bus, "counter-client").await;

    let counter = Arc::new(Mutex::new(0i64));

    let _increment = start_counter_executor(&application_context, &server, "increment", {
        let counter = counter.clone();
        handler(move |_req| {
            let counter = counter.clone();
            async move {
                let mut counter = counter.lock().unwrap();
                *counter += 1;
                ok_response(counter.to_string().into_bytes())
            }
        })
    })
    .await;
    let _read = start_counter_executor(&application_context, &server, "readCounter", {
        let counter = counter.clone();
        handler(move |_req| {
            let counter = counter.clone();
            async move { ok_response(counter.lock().unwrap().to_string().into_bytes()) }
        })
    })
    .await;
    let _reset = start_counter_executor(&application_context, &server, "reset", {
        let counter = counter.clone();
        handler(move |_req| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() = 0;
                ok_response(b"0".to_vec())
            }
        })
    })
    .await;

    let increment = counter_invoker(&application_context, &client, "increment");
    let read = counter_invoker(&application_context, &client, "readCounter");
    let reset = counter_invoker(&application_context, &client, "reset");

    let response = read.invoke(request(Vec::new())).await.unwrap();
    assert_eq!(response.payload, b"0");

    let response = increment.invoke(request(b"1".to_vec())).await.unwrap();
    assert_eq!(response.payload, b"1");

    let response = read.invoke(request(Vec::new())).await.unwrap();
    assert_eq!(response.payload, b"1");

    for _ in 0..3 {
        increment.invoke(request(b"1".to_vec())).await.unwrap();
    }
    let response = read.invoke(request(Vec::new())).await.unwrap();
    assert_eq!(response.payload, b"4");

    reset.invoke(request(Vec::new())).await.unwrap();
    let response = read.invoke(request(Vec::new())).await.unwrap();
    assert_eq!(response.payload, b"0");
}

/// S2: an idempotent command invoked twice with the same correlation id is
/// executed once; the second response is a byte-identical cache replay.
#[tokio::test(flavor = "multi_thread")]
async fn idempotent_command_served_from_cache() {
    let bus = MessageBus::new();
    let application_context = app_context();
    let server = connected_session(&bus, "prime-server").await;
    let client = connected_session(&bus, "prime-client").await;

    let executions = Arc::new(AtomicUsize::new(0));
    let options = executor::OptionsBuilder::default()
        .request_topic_pattern("svc/prime/req")
        .command_name("isPrime")
        .is_idempotent(true)
        .cacheable_duration(Duration::from_secs(60))
        .build()
        .unwrap();
    let mut exec = Executor::new(
        application_context.clone(),
        server.clone(),
        options,
        {
            let executions = executions.clone();
            handler(move |req| {
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    // A deliberately slow primality check
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let n: u64 = String::from_utf8(req.payload).unwrap().parse().unwrap();
                    let is_prime = n > 1 && !(2..n).take_while(|d| d * d <= n).any(|d| n % d == 0);
                    ok_response(is_prime.to_string().into_bytes())
                }
            })
        },
    )
    .unwrap();
    exec.start(None).await.unwrap();

    let options = invoker::OptionsBuilder::default()
        .request_topic_pattern("svc/prime/req")
        .command_name("isPrime")
        .build()
        .unwrap();
    let invoker: Invoker<Vec<u8>, Vec<u8>, _> =
        Invoker::new(application_context, client.clone(), options).unwrap();

    let correlation_id = Uuid::new_v4();
    let make_request = || {
        invoker::RequestBuilder::default()
            .payload(b"4567".to_vec())
            .unwrap()
            .timeout(Duration::from_secs(5))
            .correlation_id(Some(correlation_id))
            .build()
            .unwrap()
    };

    let started = Instant::now();
    let first = invoker.invoke(make_request()).await.unwrap();
    let first_elapsed = started.elapsed();

    let started = Instant::now();
    let second = invoker.invoke(make_request()).await.unwrap();
    let second_elapsed = started.elapsed();

    assert_eq!(first.payload, b"true");
    assert_eq!(first.payload, second.payload);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(first_elapsed > second_elapsed);
}

/// Invariant 5: two concurrent invokes sharing a pre-set correlation id fail
/// with a duplicate-correlation error.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_inflight_correlation_id_rejected() {
    let bus = MessageBus::new();
    let application_context = app_context();
    let server = connected_session(&bus, "dup-server").await;
    let client = connected_session(&bus, "dup-client").await;

    let mut exec = Executor::new(
        application_context.clone(),
        server.clone(),
        executor::OptionsBuilder::default()
            .request_topic_pattern("svc/dup/req")
            .command_name("slow")
            .build()
            .unwrap(),
        handler(|_req| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ok_response(b"done".to_vec())
        }),
    )
    .unwrap();
    exec.start(None).await.unwrap();

    let invoker: Invoker<Vec<u8>, Vec<u8>, _> = Invoker::new(
        application_context,
        client.clone(),
        invoker::OptionsBuilder::default()
            .request_topic_pattern("svc/dup/req")
            .command_name("slow")
            .build()
            .unwrap(),
    )
    .unwrap();

    let correlation_id = Uuid::new_v4();
    let make_request = || {
        invoker::RequestBuilder::default()
            .payload(Vec::new())
            .unwrap()
            .timeout(Duration::from_secs(5))
            .correlation_id(Some(correlation_id))
            .build()
            .unwrap()
    };

    let (first, second) =
        tokio::join!(invoker.invoke(make_request()), invoker.invoke(make_request()));

    // Exactly one of the two succeeds; the other is refused as a duplicate
    let (ok, err) = match (first, second) {
        (Ok(ok), Err(err)) => (ok, err),
        (Err(err), Ok(ok)) => (ok, err),
        other => panic!("expected one success and one failure, got {other:?}"),
    };
    assert_eq!(ok.payload, b"done");
    assert_eq!(err.kind, ProtocolErrorKind::InvocationException);
    assert_eq!(
        err.message.as_deref(),
        Some("duplicate request with same correlationId")
    );
}

/// Subscribe a raw session to a response topic and return the receiver.
async fn raw_response_listener(
    client: &RawClient,
    response_topic: &str,
) -> impl MessageReceiver {
    let receiver = client
        .create_filtered_receiver(response_topic, true)
        .unwrap();
    client
        .subscribe(Subscribe::new(response_topic, QoS::AtLeastOnce))
        .await
        .unwrap();
    receiver
}

fn user_property<'a>(properties: &'a PublishProperties, key: &str) -> Option<&'a str> {
    properties
        .user_properties
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// S3: a raw publish with malformed correlation data yields a 400 response
/// naming the offending property.
#[tokio::test(flavor = "multi_thread")]
async fn malformed_correlation_data_yields_bad_request() {
    let bus = MessageBus::new();
    let application_context = app_context();
    let server = connected_session(&bus, "s3-server").await;
    let rogue = connected_session(&bus, "s3-rogue").await;

    let mut exec = Executor::new(
        application_context,
        server.clone(),
        executor::OptionsBuilder::default()
            .request_topic_pattern("svc/prime/req")
            .command_name("isPrime")
            .build()
            .unwrap(),
        handler(|_req| async move { ok_response(b"unreached".to_vec()) }),
    )
    .unwrap();
    exec.start(None).await.unwrap();

    let mut responses = raw_response_listener(&rogue, "rogue/responses").await;

    let mut publish = Publish::new("svc/prime/req", QoS::AtLeastOnce, "4567", None);
    publish.properties = Some(PublishProperties {
        correlation_data: Some(Bytes::from_static(&[0x01, 0xAA])),
        response_topic: Some("rogue/responses".to_string()),
        message_expiry_interval: Some(10),
        ..Default::default()
    });
    rogue.publish(publish).await.unwrap();

    let (response, _token) =
        tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
    let properties = response.properties.unwrap();
    assert_eq!(user_property(&properties, "__stat"), Some("400"));
    assert_eq!(
        user_property(&properties, "__stMsg"),
        Some("Correlation data bytes do not conform to a GUID.")
    );
    assert_eq!(user_property(&properties, "__propName"), Some("Correlation Data"));
}

/// Server-side execution timeout surfaces as a 408 response and is not cached.
#[tokio::test(flavor = "multi_thread")]
async fn expired_execution_yields_request_timeout() {
    let bus = MessageBus::new();
    let application_context = app_context();
    let server = connected_session(&bus, "slow-server").await;
    let rogue = connected_session(&bus, "slow-rogue").await;

    let mut exec = Executor::new(
        application_context,
        server.clone(),
        executor::OptionsBuilder::default()
            .request_topic_pattern("svc/slow/req")
            .command_name("slow")
            .build()
            .unwrap(),
        handler(|_req| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ok_response(b"too late".to_vec())
        }),
    )
    .unwrap();
    exec.start(None).await.unwrap();

    let mut responses = raw_response_listener(&rogue, "slow/responses").await;

    let mut publish = Publish::new("svc/slow/req", QoS::AtLeastOnce, "", None);
    publish.properties = Some(PublishProperties {
        correlation_data: Some(Bytes::copy_from_slice(Uuid::new_v4().as_bytes())),
        response_topic: Some("slow/responses".to_string()),
        message_expiry_interval: Some(1),
        ..Default::default()
    });
    rogue.publish(publish).await.unwrap();

    let (response, _token) =
        tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
    let properties = response.properties.unwrap();
    assert_eq!(user_property(&properties, "__stat"), Some("408"));
}

/// An unsupported request protocol version is refused with 505 and the
/// supported major versions, without invoking user code.
#[tokio::test(flavor = "multi_thread")]
async fn unsupported_request_version_refused() {
    let bus = MessageBus::new();
    let application_context = app_context();
    let server = connected_session(&bus, "ver-server").await;
    let rogue = connected_session(&bus, "ver-rogue").await;

    let executions = Arc::new(AtomicUsize::new(0));
    let mut exec = Executor::new(
        application_context,
        server.clone(),
        executor::OptionsBuilder::default()
            .request_topic_pattern("svc/ver/req")
            .command_name("versioned")
            .build()
            .unwrap(),
        {
            let executions = executions.clone();
            handler(move |_req| {
                let executions = executions.clone();
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    ok_response(Vec::new())
                }
            })
        },
    )
    .unwrap();
    exec.start(None).await.unwrap();

    let mut responses = raw_response_listener(&rogue, "ver/responses").await;

    let mut publish = Publish::new("svc/ver/req", QoS::AtLeastOnce, "", None);
    publish.properties = Some(PublishProperties {
        correlation_data: Some(Bytes::copy_from_slice(Uuid::new_v4().as_bytes())),
        response_topic: Some("ver/responses".to_string()),
        message_expiry_interval: Some(10),
        user_properties: vec![("__protVer".to_string(), "99.0".to_string())],
        ..Default::default()
    });
    rogue.publish(publish).await.unwrap();

    let (response, _token) =
        tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
    let properties = response.properties.unwrap();
    assert_eq!(user_property(&properties, "__stat"), Some("505"));
    assert_eq!(user_property(&properties, "__supProtMajVer"), Some("1"));
    assert_eq!(user_property(&properties, "__requestProtVer"), Some("99.0"));
    assert_eq!(executions.load(Ordering::SeqCst), 0);
}

/// A handler error is reported to the invoker as an application-level
/// execution exception.
#[tokio::test(flavor = "multi_thread")]
async fn handler_error_surfaces_as_execution_exception() {
    let bus = MessageBus::new();
    let application_context = app_context();
    let server = connected_session(&bus, "err-server").await;
    let client = connected_session(&bus, "err-client").await;

    let mut exec = Executor::new(
        application_context.clone(),
        server.clone(),
        executor::OptionsBuilder::default()
            .request_topic_pattern("svc/err/req")
            .command_name("failing")
            .build()
            .unwrap(),
        handler(|_req| async move { Err("counter hardware unavailable".into()) }),
    )
    .unwrap();
    exec.start(None).await.unwrap();

    let invoker: Invoker<Vec<u8>, Vec<u8>, _> = Invoker::new(
        application_context,
        client.clone(),
        invoker::OptionsBuilder::default()
            .request_topic_pattern("svc/err/req")
            .command_name("failing")
            .build()
            .unwrap(),
    )
    .unwrap();

    let err = invoker.invoke(request(Vec::new())).await.unwrap_err();
    assert_eq!(err.kind, ProtocolErrorKind::ExecutionException);
    assert!(err.in_application);
    assert!(err.is_remote);
    assert_eq!(err.http_status_code, Some(500));
    assert_eq!(err.message.as_deref(), Some("counter hardware unavailable"));
}

/// Telemetry messages round trip with sender id and causal timestamp.
#[tokio::test(flavor = "multi_thread")]
async fn telemetry_round_trip() {
    let bus = MessageBus::new();
    let application_context = app_context();
    let sender_session = connected_session(&bus, "telemetry-sender").await;
    let receiver_session = connected_session(&bus, "telemetry-receiver").await;

    let mut receiver: telemetry::Receiver<Vec<u8>, _> = telemetry::Receiver::new(
        application_context.clone(),
        receiver_session.clone(),
        telemetry::receiver::OptionsBuilder::default()
            .topic_pattern("plant/{sensorId}/temperature")
            .build()
            .unwrap(),
    )
    .unwrap();

    let sender: telemetry::Sender<Vec<u8>, _> = telemetry::Sender::new(
        application_context,
        sender_session.clone(),
        telemetry::sender::OptionsBuilder::default()
            .topic_pattern("plant/{sensorId}/temperature")
            .build()
            .unwrap(),
    )
    .unwrap();

    // The receiver subscribes lazily; poll it from a task before sending
    let receive_task = tokio::spawn(async move {
        let received = receiver.recv().await.unwrap().unwrap();
        received
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let message = telemetry::sender::MessageBuilder::default()
        .payload(b"21.5".to_vec())
        .unwrap()
        .topic_tokens(HashMap::from([(
            "sensorId".to_string(),
            "boiler-3".to_string(),
        )]))
        .custom_user_data(vec![("site".to_string(), "plant-9".to_string())])
        .build()
        .unwrap();
    sender.send(message).await.unwrap();

    let (received, _token) = tokio::time::timeout(Duration::from_secs(5), receive_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.payload, b"21.5");
    assert_eq!(received.sender_id.as_deref(), Some("telemetry-sender"));
    assert!(received.timestamp.is_some());
    assert_eq!(
        received.topic_tokens.get("sensorId").map(String::as_str),
        Some("boiler-3")
    );
    assert!(received
        .custom_user_data
        .contains(&("site".to_string(), "plant-9".to_string())));
}
