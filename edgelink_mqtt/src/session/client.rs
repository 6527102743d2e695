// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The session client: connect/disconnect/publish/subscribe/unsubscribe
//! operations that survive transient transport failures while preserving the
//! MQTT session visible to the broker.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::connection_settings::ConnectionSettings;
use crate::control_packet::{
    AuthProperties, ConnAck, ConnectReasonCode, PubAck, Publish, SubAck, Subscribe, UnsubAck,
    Unsubscribe,
};
use crate::error::{SessionError, SessionErrorKind, TransportError};
use crate::interface::{ManagedClient, MqttTransport, TransportEvent};
use crate::session::ack_tracker::AckTracker;
use crate::session::receiver::{ReceiverRegistry, SessionMessageReceiver};
use crate::session::reconnect_policy::{ExponentialBackoffWithJitter, RetryPolicy};
use crate::session::state::{SessionState, SessionStatus};
use crate::session::work_queue::{OverflowPolicy, WorkAck, WorkQueue, WorkRequest};
use crate::topic::{self, TopicFilter, TopicParseError};

/// Notification emitted by a [`SessionClient`] when its connection state
/// changes. Each event occurrence is emitted exactly once.
#[derive(Debug)]
pub enum SessionEvent {
    /// A connection was established.
    Connected {
        /// True if the broker retained session state from a prior connection.
        session_present: bool,
    },
    /// The connection was lost or closed. Reconnection may follow.
    Disconnected,
    /// The MQTT session ended and will not be re-established automatically.
    SessionLost {
        /// Why the session ended.
        error: SessionError,
    },
}

/// Options for configuring a new [`SessionClient`].
#[derive(Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct SessionOptions {
    /// MQTT connection settings for the session
    pub connection_settings: ConnectionSettings,
    /// Retry policy consulted for reconnects, and for the initial connect when
    /// [`retry_on_initial_connect`](Self::retry_on_initial_connect) is set
    #[builder(default = "Arc::new(ExponentialBackoffWithJitter::default())")]
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Maximum number of queued work items before the overflow policy applies
    #[builder(default = "100")]
    pub max_pending_messages: usize,
    /// Policy applied when the work queue is full
    #[builder(default)]
    pub overflow_policy: OverflowPolicy,
    /// Whether a retryable failure on the first connect is retried per the
    /// retry policy rather than surfaced to the caller
    #[builder(default = "false")]
    pub retry_on_initial_connect: bool,
}

/// Client that manages connections over a single MQTT session.
///
/// Outgoing publish/subscribe/unsubscribe operations share one FIFO queue
/// drained by a sender task, so the broker observes them in submission order.
/// Items interrupted by a retryable transport failure are retransmitted after
/// the connection is re-established; callers only observe terminal outcomes.
pub struct SessionClient<T>
where
    T: MqttTransport + 'static,
{
    transport: Arc<T>,
    settings: Arc<ConnectionSettings>,
    assigned_client_id: Arc<OnceLock<String>>,
    queue: Arc<WorkQueue>,
    ack_tracker: Arc<AckTracker>,
    receivers: Arc<ReceiverRegistry>,
    state: Arc<SessionState>,
    retry_policy: Arc<dyn RetryPolicy>,
    retry_on_initial_connect: bool,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>>,
    /// Signalled by the sender task when a transport operation fails,
    /// waking the connection task to begin reconnection.
    drop_signal: Arc<Notify>,
    /// Error that caused the most recent drop signal.
    last_send_error: Arc<Mutex<Option<TransportError>>>,
    disposal: CancellationToken,
    tasks_started: Arc<AtomicBool>,
}

impl<T> Clone for SessionClient<T>
where
    T: MqttTransport + 'static,
{
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            assigned_client_id: self.assigned_client_id.clone(),
            queue: self.queue.clone(),
            ack_tracker: self.ack_tracker.clone(),
            receivers: self.receivers.clone(),
            state: self.state.clone(),
            retry_policy: self.retry_policy.clone(),
            retry_on_initial_connect: self.retry_on_initial_connect,
            event_tx: self.event_tx.clone(),
            event_rx: self.event_rx.clone(),
            drop_signal: self.drop_signal.clone(),
            last_send_error: self.last_send_error.clone(),
            disposal: self.disposal.clone(),
            tasks_started: self.tasks_started.clone(),
        }
    }
}

impl<T> SessionClient<T>
where
    T: MqttTransport + 'static,
{
    /// Create a new [`SessionClient`] over the provided transport.
    #[must_use]
    pub fn new(transport: T, options: SessionOptions) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            transport: Arc::new(transport),
            settings: Arc::new(options.connection_settings),
            assigned_client_id: Arc::new(OnceLock::new()),
            queue: Arc::new(WorkQueue::new(
                options.max_pending_messages,
                options.overflow_policy,
            )),
            ack_tracker: Arc::new(AckTracker::default()),
            receivers: Arc::new(ReceiverRegistry::default()),
            state: Arc::new(SessionState::default()),
            retry_policy: options.retry_policy,
            retry_on_initial_connect: options.retry_on_initial_connect,
            event_tx,
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
            drop_signal: Arc::new(Notify::new()),
            last_send_error: Arc::new(Mutex::new(None)),
            disposal: CancellationToken::new(),
            tasks_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take the receiver for [`SessionEvent`] notifications.
    ///
    /// Returns [`None`] if it has already been taken.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    /// Open the MQTT session.
    ///
    /// Retryable connect failures are retried per the retry policy when
    /// [`SessionOptions::retry_on_initial_connect`] is set. The returned
    /// [`ConnAck`] carries the session-present flag and the broker-assigned
    /// client identifier, if any.
    ///
    /// # Errors
    /// [`SessionErrorKind::ConnectionRejected`] on a fatal CONNACK reason code,
    /// [`SessionErrorKind::RetryExpired`] when the retry policy gives up,
    /// [`SessionErrorKind::Disposed`] if the client was closed (carrying the
    /// last observed transport error when one exists).
    pub async fn connect(&self) -> Result<ConnAck, SessionError> {
        if self.state.is_disposed() {
            return Err(SessionErrorKind::Disposed.into());
        }
        self.state.transition_connecting().map_err(|status| {
            SessionError::from(SessionErrorKind::InvalidState(format!(
                "cannot connect while {status:?}"
            )))
        })?;
        self.state.clear_desire_disconnect();

        let mut attempts: u32 = 0;
        let mut last_error: Option<TransportError> = None;
        loop {
            let connect_result = tokio::select! {
                biased;
                () = self.disposal.cancelled() => {
                    return Err(Self::dispose_error(last_error.take()));
                }
                r = self.transport.connect(&self.settings, self.settings.clean_start()) => r,
            };

            let retry_error = match connect_result {
                Ok(connack) if connack.reason_code == ConnectReasonCode::Success => {
                    if let Some(assigned) = &connack.assigned_client_identifier {
                        let _ = self.assigned_client_id.set(assigned.clone());
                    }
                    self.state.transition_connected();
                    self.start_background_tasks();
                    let _ = self.event_tx.send(SessionEvent::Connected {
                        session_present: connack.session_present,
                    });
                    return Ok(connack);
                }
                Ok(connack) => {
                    let rc = connack.reason_code;
                    if !(rc.is_retryable() && self.retry_on_initial_connect) {
                        self.state.transition_disconnected();
                        return Err(SessionErrorKind::ConnectionRejected(rc).into());
                    }
                    TransportError::ConnectionRefused(rc)
                }
                Err(e) => {
                    if !(e.is_retryable() && self.retry_on_initial_connect) {
                        self.state.transition_disconnected();
                        return Err(SessionErrorKind::Transport(e).into());
                    }
                    e
                }
            };

            let Some(delay) = self.retry_policy.next_delay(attempts, &retry_error) else {
                log::info!("Initial connect attempts halted by retry policy");
                self.state.transition_disconnected();
                return Err(SessionErrorKind::RetryExpired.into());
            };
            log::info!("Connect failed ({retry_error}); retrying in {delay:?}");
            last_error = Some(retry_error);
            attempts = attempts.saturating_add(1);
            tokio::select! {
                biased;
                () = self.disposal.cancelled() => {
                    return Err(Self::dispose_error(last_error.take()));
                }
                () = time::sleep(delay) => {}
            }
        }
    }

    /// Signal user-initiated shutdown of the connection.
    ///
    /// After this returns no further retries occur, and any items pending in
    /// the queue complete with [`SessionErrorKind::SessionLost`].
    ///
    /// # Errors
    /// [`SessionErrorKind::Disposed`] if the client was closed.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        if self.state.is_disposed() {
            return Err(SessionErrorKind::Disposed.into());
        }
        self.state.set_desire_disconnect();
        if let Err(e) = self.transport.disconnect().await {
            log::debug!("Transport error on disconnect: {e}");
        }
        self.queue
            .fail_all(|| SessionErrorKind::SessionLost.into());
        Ok(())
    }

    /// Re-establish the connection using the last-used options without a clean
    /// start.
    ///
    /// # Errors
    /// [`SessionErrorKind::SessionExpired`] if the broker reports no session
    /// state, [`SessionErrorKind::ConnectionRejected`] on a CONNACK failure,
    /// [`SessionErrorKind::Disposed`] if the client was closed.
    pub async fn reconnect(&self) -> Result<ConnAck, SessionError> {
        if self.state.is_disposed() {
            return Err(SessionErrorKind::Disposed.into());
        }
        self.state.transition_connecting().map_err(|status| {
            SessionError::from(SessionErrorKind::InvalidState(format!(
                "cannot reconnect while {status:?}"
            )))
        })?;
        self.state.clear_desire_disconnect();

        match self.transport.connect(&self.settings, false).await {
            Ok(connack) if connack.reason_code == ConnectReasonCode::Success => {
                if !connack.session_present {
                    log::error!("Session state not present on broker after reconnect");
                    self.state.transition_disconnected();
                    self.queue
                        .fail_all(|| SessionErrorKind::SessionExpired.into());
                    let _ = self.event_tx.send(SessionEvent::SessionLost {
                        error: SessionErrorKind::SessionExpired.into(),
                    });
                    return Err(SessionErrorKind::SessionExpired.into());
                }
                self.state.transition_connected();
                self.start_background_tasks();
                let _ = self.event_tx.send(SessionEvent::Connected {
                    session_present: true,
                });
                Ok(connack)
            }
            Ok(connack) => {
                self.state.transition_disconnected();
                Err(SessionErrorKind::ConnectionRejected(connack.reason_code).into())
            }
            Err(e) => {
                self.state.transition_disconnected();
                Err(SessionErrorKind::Transport(e).into())
            }
        }
    }

    /// Enqueue a publish and await the broker's acknowledgement.
    ///
    /// # Errors
    /// [`SessionError`] when the item fails terminally; see the queue
    /// discipline described on [`SessionClient`].
    pub async fn publish(&self, publish: Publish) -> Result<PubAck, SessionError> {
        if self.state.is_disposed() {
            return Err(SessionErrorKind::Disposed.into());
        }
        if !topic::is_valid_topic_name(&publish.topic) {
            return Err(SessionErrorKind::ConfigurationInvalid(format!(
                "invalid topic name '{}'",
                publish.topic
            ))
            .into());
        }
        let pending = self.queue.enqueue(WorkRequest::Publish(publish))?;
        match pending.wait().await? {
            WorkAck::Publish(ack) => Ok(ack),
            _ => Err(SessionErrorKind::InvalidState(
                "mismatched acknowledgement variant".to_string(),
            )
            .into()),
        }
    }

    /// Enqueue a subscribe and await the broker's acknowledgement.
    ///
    /// # Errors
    /// [`SessionError`] when the item fails terminally.
    pub async fn subscribe(&self, subscribe: Subscribe) -> Result<SubAck, SessionError> {
        if self.state.is_disposed() {
            return Err(SessionErrorKind::Disposed.into());
        }
        if let Err(e) = subscribe.topic_filter.parse::<TopicFilter>() {
            return Err(SessionErrorKind::ConfigurationInvalid(format!(
                "invalid topic filter '{}': {e}",
                subscribe.topic_filter
            ))
            .into());
        }
        let pending = self.queue.enqueue(WorkRequest::Subscribe(subscribe))?;
        match pending.wait().await? {
            WorkAck::Subscribe(ack) => Ok(ack),
            _ => Err(SessionErrorKind::InvalidState(
                "mismatched acknowledgement variant".to_string(),
            )
            .into()),
        }
    }

    /// Enqueue an unsubscribe and await the broker's acknowledgement.
    ///
    /// # Errors
    /// [`SessionError`] when the item fails terminally.
    pub async fn unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<UnsubAck, SessionError> {
        if self.state.is_disposed() {
            return Err(SessionErrorKind::Disposed.into());
        }
        if let Err(e) = unsubscribe.topic_filter.parse::<TopicFilter>() {
            return Err(SessionErrorKind::ConfigurationInvalid(format!(
                "invalid topic filter '{}': {e}",
                unsubscribe.topic_filter
            ))
            .into());
        }
        let pending = self.queue.enqueue(WorkRequest::Unsubscribe(unsubscribe))?;
        match pending.wait().await? {
            WorkAck::Unsubscribe(ack) => Ok(ack),
            _ => Err(SessionErrorKind::InvalidState(
                "mismatched acknowledgement variant".to_string(),
            )
            .into()),
        }
    }

    /// Send enhanced authentication data on the established connection.
    ///
    /// # Errors
    /// [`SessionErrorKind::InvalidState`] if no connection is established.
    pub async fn send_auth_data(&self, auth: AuthProperties) -> Result<(), SessionError> {
        if self.state.is_disposed() {
            return Err(SessionErrorKind::Disposed.into());
        }
        if self.state.status() != SessionStatus::Connected {
            return Err(SessionErrorKind::InvalidState(
                "enhanced auth requires an established connection".to_string(),
            )
            .into());
        }
        self.transport
            .send_auth(auth)
            .await
            .map_err(|e| SessionErrorKind::Transport(e).into())
    }

    /// Close the session client, draining in-flight work.
    ///
    /// Pending callers fail with [`SessionErrorKind::Disposed`], and all
    /// subsequent API calls are rejected. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.state.is_disposed() {
            return;
        }
        log::info!("Closing session client");
        self.state.transition_disposed();
        self.disposal.cancel();
        self.queue.close(|| SessionErrorKind::Disposed.into());
        self.ack_tracker.close();
        self.receivers.close_all();
        if let Err(e) = self.transport.disconnect().await {
            log::debug!("Transport error on close: {e}");
        }
    }

    /// Current client identifier: the configured one, or the broker-assigned
    /// one when the configuration left it empty. Empty until a broker
    /// assignment arrives in that case.
    #[must_use]
    pub fn client_id(&self) -> &str {
        if self.settings.client_id().is_empty() {
            self.assigned_client_id.get().map_or("", String::as_str)
        } else {
            self.settings.client_id()
        }
    }

    fn dispose_error(last_error: Option<TransportError>) -> SessionError {
        match last_error {
            Some(e) => SessionErrorKind::Transport(e).into(),
            None => SessionErrorKind::Disposed.into(),
        }
    }

    fn start_background_tasks(&self) {
        if self.tasks_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn({
            let client = self.clone();
            async move { client.run_sender().await }
        });
        tokio::spawn({
            let client = self.clone();
            async move { client.run_connection().await }
        });
        tokio::spawn({
            let client = self.clone();
            async move { client.run_ack_release().await }
        });
    }

    /// Sender task: drains the work queue head-first while connected.
    async fn run_sender(self) {
        loop {
            // Only transmit while a connection is (believed to be) established
            let Some(epoch) = self.state.wait_connected().await else {
                return;
            };

            let item = tokio::select! {
                biased;
                () = self.disposal.cancelled() => return,
                item = self.queue.dequeue() => item,
            };
            let Some(mut item) = item else { return };
            item.sent = true;

            // Build the transport operation from owned copies so completion
            // handling below can use the item mutably.
            let op: Pin<Box<dyn Future<Output = Result<WorkAck, TransportError>> + Send>> =
                match &item.request {
                    WorkRequest::Publish(p) => {
                        let transport = self.transport.clone();
                        let p = p.clone();
                        Box::pin(async move { transport.publish(p).await.map(WorkAck::Publish) })
                    }
                    WorkRequest::Subscribe(s) => {
                        let transport = self.transport.clone();
                        let s = s.clone();
                        Box::pin(
                            async move { transport.subscribe(s).await.map(WorkAck::Subscribe) },
                        )
                    }
                    WorkRequest::Unsubscribe(u) => {
                        let transport = self.transport.clone();
                        let u = u.clone();
                        Box::pin(async move {
                            transport.unsubscribe(u).await.map(WorkAck::Unsubscribe)
                        })
                    }
                };
            let cancel = item.cancel.clone();

            let result = tokio::select! {
                biased;
                () = self.disposal.cancelled() => {
                    item.complete(Err(SessionErrorKind::Disposed.into()));
                    return;
                }
                r = op => r,
                () = cancel.cancelled() => {
                    // The request may have reached the wire; it is not rescinded
                    item.complete(Err(SessionErrorKind::Cancelled.into()));
                    continue;
                }
            };

            match result {
                Ok(ack) => item.complete(Ok(ack)),
                Err(e) if e.is_retryable() => {
                    log::warn!("Retryable transport failure during send: {e}");
                    *self.last_send_error.lock().unwrap() = Some(e);
                    self.queue.requeue_front(item);
                    self.drop_signal.notify_one();
                    // Hold off until a new connection is established so the
                    // head of the queue is not hammered against a dead link
                    if !self.state.wait_epoch_beyond(epoch).await {
                        return;
                    }
                }
                Err(e) => {
                    log::error!("Fatal transport failure during send: {e}");
                    // Keep the message for the connection task; the in-flight
                    // caller receives the error itself
                    *self.last_send_error.lock().unwrap() =
                        Some(TransportError::Protocol(e.to_string()));
                    item.complete(Err(SessionErrorKind::Transport(e).into()));
                    self.drop_signal.notify_one();
                    if !self.state.wait_epoch_beyond(epoch).await {
                        return;
                    }
                }
            }
        }
    }

    /// Connection task: polls transport events while connected and drives
    /// reconnection when the connection drops.
    async fn run_connection(self) {
        loop {
            if self.state.wait_connected().await.is_none() {
                return;
            }

            // Connected phase: poll events until the connection drops
            let drop_error: TransportError = loop {
                tokio::select! {
                    biased;
                    () = self.disposal.cancelled() => return,
                    () = self.drop_signal.notified() => {
                        let stored = self.last_send_error.lock().unwrap().take();
                        break stored.unwrap_or(TransportError::LinkClosed);
                    }
                    event = self.transport.next_event() => {
                        match event {
                            Ok(TransportEvent::Publish(publish)) => {
                                log::debug!(
                                    "Incoming PUBLISH on '{}' (pkid {})",
                                    publish.topic,
                                    publish.pkid
                                );
                                self.receivers.dispatch(&publish, &self.ack_tracker);
                            }
                            Ok(TransportEvent::Auth(auth)) => {
                                log::debug!("Incoming AUTH: {auth:?}");
                            }
                            Err(e) => break e,
                        }
                    }
                }
            };

            // The broker re-delivers whatever we did not acknowledge; acks for
            // pre-drop deliveries must fail as stale rather than release
            self.ack_tracker.reset_for_reconnect();
            let _ = self.event_tx.send(SessionEvent::Disconnected);

            if self.state.desire_disconnect() {
                log::info!("Connection closed by user-initiated disconnect");
                self.state.transition_disconnected();
                continue;
            }

            if !drop_error.is_retryable() {
                log::error!("Fatal connection error: {drop_error}; ending session");
                self.end_session(SessionErrorKind::Transport(drop_error).into(), || {
                    SessionErrorKind::SessionLost.into()
                });
                continue;
            }

            log::warn!("Connection dropped: {drop_error}");
            self.state.transition_reconnecting();
            self.reconnect_until_connected(drop_error).await;
        }
    }

    /// Attempt reconnection per the retry policy until a connection is
    /// established or the session is declared lost.
    async fn reconnect_until_connected(&self, mut last_error: TransportError) {
        let mut attempts: u32 = 0;
        loop {
            let Some(delay) = self.retry_policy.next_delay(attempts, &last_error) else {
                log::info!("Reconnect attempts halted by retry policy");
                self.end_session(SessionErrorKind::RetryExpired.into(), || {
                    SessionErrorKind::RetryExpired.into()
                });
                return;
            };
            log::info!("Attempting reconnect in {delay:?}");
            tokio::select! {
                biased;
                () = self.disposal.cancelled() => return,
                () = time::sleep(delay) => {}
            }
            attempts = attempts.saturating_add(1);

            let connect_result = tokio::select! {
                biased;
                () = self.disposal.cancelled() => return,
                r = self.transport.connect(&self.settings, false) => r,
            };
            match connect_result {
                Ok(connack) if connack.reason_code == ConnectReasonCode::Success => {
                    // The CONNACK session-present flag is authoritative: false
                    // on a non-clean reconnect means the broker discarded the
                    // session while we were away
                    if !connack.session_present {
                        log::error!(
                            "Session state not present on broker after reconnect; ending session"
                        );
                        self.end_session(SessionErrorKind::SessionExpired.into(), || {
                            SessionErrorKind::SessionExpired.into()
                        });
                        return;
                    }
                    self.state.transition_connected();
                    let _ = self.event_tx.send(SessionEvent::Connected {
                        session_present: true,
                    });
                    return;
                }
                Ok(connack) => {
                    let rc = connack.reason_code;
                    if rc.is_retryable() {
                        last_error = TransportError::ConnectionRefused(rc);
                        continue;
                    }
                    log::error!("Reconnect rejected with fatal reason code {rc:?}");
                    self.end_session(SessionErrorKind::ConnectionRejected(rc).into(), || {
                        SessionErrorKind::SessionLost.into()
                    });
                    return;
                }
                Err(e) if e.is_retryable() => {
                    last_error = e;
                }
                Err(e) => {
                    log::error!("Reconnect failed fatally: {e}");
                    self.end_session(SessionErrorKind::Transport(e).into(), || {
                        SessionErrorKind::SessionLost.into()
                    });
                    return;
                }
            }
        }
    }

    /// Declare the session over: fail all queued work, emit a session-lost
    /// notification, and go idle until the user reconnects.
    fn end_session(
        &self,
        notification_error: SessionError,
        queued_item_error: impl Fn() -> SessionError,
    ) {
        self.queue.fail_all(queued_item_error);
        self.state.transition_disconnected();
        let _ = self.event_tx.send(SessionEvent::SessionLost {
            error: notification_error,
        });
    }

    /// Ack-release task: transmits PUBACKs strictly in arrival order.
    async fn run_ack_release(self) {
        loop {
            let pkid = tokio::select! {
                biased;
                () = self.disposal.cancelled() => return,
                pkid = self.ack_tracker.next_ready() => pkid,
            };
            log::debug!("Releasing PUBACK for pkid {pkid}");
            if let Err(e) = self.transport.ack(pkid).await {
                log::warn!("Failed to send PUBACK for pkid {pkid}: {e}");
            }
        }
    }
}

#[async_trait]
impl<T> ManagedClient for SessionClient<T>
where
    T: MqttTransport + 'static,
{
    type Receiver = SessionMessageReceiver;

    fn client_id(&self) -> &str {
        SessionClient::client_id(self)
    }

    async fn publish(&self, publish: Publish) -> Result<PubAck, SessionError> {
        SessionClient::publish(self, publish).await
    }

    async fn subscribe(&self, subscribe: Subscribe) -> Result<SubAck, SessionError> {
        SessionClient::subscribe(self, subscribe).await
    }

    async fn unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<UnsubAck, SessionError> {
        SessionClient::unsubscribe(self, unsubscribe).await
    }

    fn create_filtered_receiver(
        &self,
        topic_filter: &str,
        auto_ack: bool,
    ) -> Result<Self::Receiver, TopicParseError> {
        self.receivers.register(topic_filter, auto_ack)
    }
}
