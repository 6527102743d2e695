// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for the transport interface and the session client.

use thiserror::Error;

use crate::control_packet::{ConnectReasonCode, DisconnectReasonCode};

/// Error produced by an [`MqttTransport`](crate::interface::MqttTransport)
/// implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker rejected the connection attempt with a CONNACK reason code.
    #[error("connection refused by broker: {0:?}")]
    ConnectionRefused(ConnectReasonCode),
    /// The broker closed the connection with a DISCONNECT packet.
    #[error("server-initiated disconnect: {0:?}")]
    Disconnected(DisconnectReasonCode),
    /// An I/O failure occurred on the network link.
    #[error("network I/O failure: {0}")]
    Io(#[from] std::io::Error),
    /// TLS negotiation failed.
    #[error("TLS failure: {0}")]
    Tls(String),
    /// The transport did not complete the operation in time.
    #[error("transport operation timed out")]
    Timeout,
    /// The network link closed without a DISCONNECT packet.
    #[error("network link closed")]
    LinkClosed,
    /// The peer violated the MQTT protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True if the failure is transient and the operation may be retried after
    /// the connection is re-established.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::ConnectionRefused(rc) => rc.is_retryable(),
            TransportError::Disconnected(rc) => rc.is_retryable(),
            TransportError::Io(_) | TransportError::Tls(_) => true,
            TransportError::Timeout | TransportError::LinkClosed => true,
            TransportError::Protocol(_) => false,
        }
    }
}

/// Error type for session client operations. The type of error is specified by
/// the value of [`SessionErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct SessionError(#[from] SessionErrorKind);

impl SessionError {
    /// Return the corresponding [`SessionErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &SessionErrorKind {
        &self.0
    }
}

/// Error kind for [`SessionError`].
#[derive(Debug, Error)]
pub enum SessionErrorKind {
    /// Invalid configuration options provided to the session client.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
    /// The broker rejected the connection with a fatal reason code.
    #[error("connection rejected by broker: {0:?}")]
    ConnectionRejected(ConnectReasonCode),
    /// The MQTT session was ended by a fatal connection error or by retry
    /// exhaustion; see the contained kind for specifics.
    #[error("session state not present on broker after reconnect")]
    SessionLost,
    /// The broker discarded the MQTT session while the client was disconnected.
    #[error("session expired on broker")]
    SessionExpired,
    /// The work item was evicted from the queue by the overflow policy.
    #[error("work item purged from queue")]
    PurgedFromQueue,
    /// Reconnect attempts were halted by the retry policy, ending the session.
    #[error("retries exhausted by retry policy")]
    RetryExpired,
    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,
    /// The session client has been closed; no further operations are accepted.
    #[error("session client is disposed")]
    Disposed,
    /// The session client ended up in an invalid state.
    #[error("{0}")]
    InvalidState(String),
    /// A non-retryable transport failure occurred.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error acknowledging a received publish.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct AckError {
    kind: AckErrorKind,
}

impl AckError {
    /// Create a new [`AckError`]
    #[must_use]
    pub fn new(kind: AckErrorKind) -> Self {
        Self { kind }
    }

    /// Return the corresponding [`AckErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &AckErrorKind {
        &self.kind
    }
}

/// An enumeration of categories of [`AckError`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckErrorKind {
    /// The publish was received before a connection drop; the broker will
    /// re-deliver it, and the stale delivery must not be acknowledged.
    Stale,
    /// The publish has already been sufficiently acknowledged
    AlreadyAcked,
    /// The session client has been closed
    Detached,
}

impl std::fmt::Display for AckErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckErrorKind::Stale => {
                write!(f, "publish predates the current connection; it will be re-delivered")
            }
            AckErrorKind::AlreadyAcked => write!(f, "publish already acknowledged"),
            AckErrorKind::Detached => write!(f, "session client is closed"),
        }
    }
}
