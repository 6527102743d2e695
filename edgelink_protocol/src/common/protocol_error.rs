// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The error model shared by the command and telemetry envoys.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::common::hybrid_logical_clock::{HlcError, HlcErrorKind, ParseHlcError};

/// Represents the kind of error that occurs in the protocol envoys.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProtocolErrorKind {
    /// A struct or enum field, configuration file, or environment variable has an invalid value
    ConfigurationInvalid,
    /// A function was called with an invalid argument value
    ArgumentInvalid,
    /// A required MQTT header property is missing on a received message
    HeaderMissing,
    /// An MQTT header property has an invalid value on a received message
    HeaderInvalid,
    /// MQTT payload cannot be serialized or deserialized
    PayloadInvalid,
    /// The current program state is invalid vis-a-vis the function that was called
    StateInvalid,
    /// The client or service observed a condition that was thought to be impossible
    InternalLogicError,
    /// An operation was aborted due to timeout
    Timeout,
    /// An operation was cancelled
    Cancellation,
    /// The command executor identified an error in the request
    InvocationException,
    /// The command executor encountered an error while executing the command
    ExecutionException,
    /// The MQTT communication encountered an error and failed
    MqttError,
    /// The request or response protocol version is not supported by the peer
    UnsupportedVersion,
    /// The client or service received an unexpected error from a dependent component
    UnknownError,
}

/// Which side of an exchange carried the unsupported protocol version.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VersionRole {
    /// The remote executor did not support the request's protocol version
    Request,
    /// The received response advertised a protocol version this client does
    /// not support
    Response,
}

/// Represents the possible types of the value of a property
#[derive(Debug, PartialEq, Clone)]
pub enum Value {
    /// A 32-bit integer value
    Integer(i32),
    /// A 64-bit floating point value
    Float(f64),
    /// A String value
    String(String),
    /// A bool value
    Boolean(bool),
}

/// Represents an error that occurred in the protocol envoys.
#[derive(Debug)]
pub struct ProtocolError {
    /// The error message
    pub message: Option<String>,
    /// The specific kind of error that occurred
    pub kind: ProtocolErrorKind,
    /// True if the error occurred in user-supplied code rather than the envoys or their dependent components
    pub in_application: bool,
    /// True if the error was identified prior to any attempted network communication
    pub is_shallow: bool,
    /// True if the error was detected by a remote component
    pub is_remote: bool,
    /// Error from a dependent component that caused this error
    pub nested_error: Option<Box<dyn Error + Send + Sync>>,
    /// An HTTP-style status code received from a remote service
    pub http_status_code: Option<u16>,
    /// Correlation id of the request relevant to the error being reported
    pub correlation_id: Option<Uuid>,
    /// The name of an MQTT header that is missing or has an invalid value
    pub header_name: Option<String>,
    /// The value of an MQTT header that is invalid
    pub header_value: Option<String>,
    /// The name of a timeout condition that elapsed
    pub timeout_name: Option<String>,
    /// The duration of a timeout condition that elapsed
    pub timeout_value: Option<Duration>,
    /// The name of a function argument or field that is missing or invalid
    pub property_name: Option<String>,
    /// The value of a function argument or field that is invalid
    pub property_value: Option<Value>,
    /// The name of a command relevant to the error being reported
    pub command_name: Option<String>,
    /// The unsupported protocol version, when the failure is a version mismatch
    pub protocol_version: Option<String>,
    /// The peer's supported major protocol versions, when the failure is a version mismatch
    pub supported_protocol_major_versions: Option<Vec<u16>>,
    /// Which side of the exchange carried the unsupported version
    pub version_role: Option<VersionRole>,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            return write!(f, "{message}");
        }
        match self.kind {
            ProtocolErrorKind::ConfigurationInvalid | ProtocolErrorKind::ArgumentInvalid => {
                write!(
                    f,
                    "The property '{}' has an invalid value: {:?}",
                    self.property_name.as_deref().unwrap_or("Not Specified"),
                    self.property_value
                )
            }
            ProtocolErrorKind::HeaderMissing => write!(
                f,
                "The MQTT header '{}' is missing",
                self.header_name.as_deref().unwrap_or("Not Specified")
            ),
            ProtocolErrorKind::HeaderInvalid => write!(
                f,
                "The MQTT header '{}' has an invalid value: '{}'",
                self.header_name.as_deref().unwrap_or("Not Specified"),
                self.header_value.as_deref().unwrap_or("Not Specified")
            ),
            ProtocolErrorKind::PayloadInvalid => write!(
                f,
                "Serialization or deserialization of the MQTT payload failed"
            ),
            ProtocolErrorKind::StateInvalid => write!(
                f,
                "Invalid state in property '{}'",
                self.property_name.as_deref().unwrap_or("Not Specified")
            ),
            ProtocolErrorKind::InternalLogicError => write!(
                f,
                "Internal logic error in property '{}'",
                self.property_name.as_deref().unwrap_or("Not Specified")
            ),
            ProtocolErrorKind::Timeout => write!(
                f,
                "The timeout '{}' elapsed after {} ms",
                self.timeout_name.as_deref().unwrap_or("Not Specified"),
                self.timeout_value.map_or_else(
                    || "Not Specified".to_string(),
                    |d| d.as_millis().to_string()
                )
            ),
            ProtocolErrorKind::Cancellation => write!(f, "The operation was cancelled"),
            ProtocolErrorKind::InvocationException => {
                write!(f, "The command executor identified an error in the request")
            }
            ProtocolErrorKind::ExecutionException => write!(
                f,
                "The command executor encountered an error while executing the command"
            ),
            ProtocolErrorKind::MqttError => write!(f, "An MQTT communication error occurred"),
            ProtocolErrorKind::UnsupportedVersion => write!(
                f,
                "Protocol version '{}' is not supported; supported major versions are {:?}",
                self.protocol_version.as_deref().unwrap_or("Not Specified"),
                self.supported_protocol_major_versions
                    .as_deref()
                    .unwrap_or(&[])
            ),
            ProtocolErrorKind::UnknownError => write!(f, "An unknown error occurred"),
        }
    }
}

impl Error for ProtocolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.nested_error
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl ProtocolError {
    /// A "blank" error with the given kind; constructors below fill in the
    /// relevant fields.
    fn blank(kind: ProtocolErrorKind) -> ProtocolError {
        ProtocolError {
            message: None,
            kind,
            in_application: false,
            is_shallow: false,
            is_remote: false,
            nested_error: None,
            http_status_code: None,
            correlation_id: None,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name: None,
            protocol_version: None,
            supported_protocol_major_versions: None,
            version_role: None,
        }
    }

    /// Creates a new [`ProtocolError`] for a missing MQTT header
    #[must_use]
    pub fn new_header_missing_error(
        header_name: &str,
        is_remote: bool,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::HeaderMissing);
        e.is_remote = is_remote;
        e.header_name = Some(header_name.to_string());
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid MQTT header value
    #[must_use]
    pub fn new_header_invalid_error(
        header_name: &str,
        header_value: &str,
        is_remote: bool,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::HeaderInvalid);
        e.is_remote = is_remote;
        e.header_name = Some(header_name.to_string());
        e.header_value = Some(header_value.to_string());
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid MQTT payload
    #[must_use]
    pub fn new_payload_invalid_error(
        is_shallow: bool,
        is_remote: bool,
        nested_error: Option<Box<dyn Error + Send + Sync>>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::PayloadInvalid);
        e.is_shallow = is_shallow;
        e.is_remote = is_remote;
        e.nested_error = nested_error;
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for a timeout
    #[must_use]
    pub fn new_timeout_error(
        is_remote: bool,
        nested_error: Option<Box<dyn Error + Send + Sync>>,
        timeout_name: &str,
        timeout_value: Duration,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::Timeout);
        e.is_remote = is_remote;
        e.nested_error = nested_error;
        e.timeout_name = Some(timeout_name.to_string());
        e.timeout_value = Some(timeout_value);
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for a cancellation
    #[must_use]
    pub fn new_cancellation_error(
        is_remote: bool,
        nested_error: Option<Box<dyn Error + Send + Sync>>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::Cancellation);
        e.is_remote = is_remote;
        e.nested_error = nested_error;
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid configuration
    #[must_use]
    pub fn new_configuration_invalid_error(
        nested_error: Option<Box<dyn Error + Send + Sync>>,
        property_name: &str,
        property_value: Value,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::ConfigurationInvalid);
        e.is_shallow = true;
        e.nested_error = nested_error;
        e.property_name = Some(property_name.to_string());
        e.property_value = Some(property_value);
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid argument
    #[must_use]
    pub fn new_argument_invalid_error(
        property_name: &str,
        property_value: Value,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::ArgumentInvalid);
        e.is_shallow = true;
        e.property_name = Some(property_name.to_string());
        e.property_value = Some(property_value);
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invalid state
    #[must_use]
    pub fn new_state_invalid_error(
        property_name: &str,
        property_value: Option<Value>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::StateInvalid);
        e.is_shallow = true;
        e.property_name = Some(property_name.to_string());
        e.property_value = property_value;
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an internal logic error
    #[must_use]
    pub fn new_internal_logic_error(
        is_remote: bool,
        property_name: &str,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::InternalLogicError);
        e.is_remote = is_remote;
        e.property_name = Some(property_name.to_string());
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an unknown error
    #[must_use]
    pub fn new_unknown_error(
        is_remote: bool,
        is_shallow: bool,
        nested_error: Option<Box<dyn Error + Send + Sync>>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::UnknownError);
        e.is_remote = is_remote;
        e.is_shallow = is_shallow;
        e.nested_error = nested_error;
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an invocation exception reported by
    /// a remote executor
    #[must_use]
    pub fn new_invocation_exception_error(
        http_status_code: u16,
        property_name: Option<&str>,
        property_value: Option<Value>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::InvocationException);
        e.in_application = true;
        e.is_remote = true;
        e.http_status_code = Some(http_status_code);
        e.property_name = property_name.map(ToString::to_string);
        e.property_value = property_value;
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new shallow [`ProtocolError`] of kind
    /// [`InvocationException`](ProtocolErrorKind::InvocationException),
    /// detected locally before any network activity.
    #[must_use]
    pub fn new_local_invocation_error(
        message: String,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::InvocationException);
        e.is_shallow = true;
        e.message = Some(message);
        e.command_name = command_name;
        e
    }

    /// Creates a new [`ProtocolError`] for an execution exception reported by
    /// a remote executor
    #[must_use]
    pub fn new_execution_exception_error(
        http_status_code: u16,
        property_name: Option<&str>,
        property_value: Option<Value>,
        message: Option<String>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::ExecutionException);
        e.in_application = true;
        e.is_remote = true;
        e.http_status_code = Some(http_status_code);
        e.property_name = property_name.map(ToString::to_string);
        e.property_value = property_value;
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an MQTT communication error
    #[must_use]
    pub fn new_mqtt_error(
        message: Option<String>,
        nested_error: Box<dyn Error + Send + Sync>,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::MqttError);
        e.nested_error = Some(nested_error);
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Creates a new [`ProtocolError`] for an unsupported protocol version
    #[must_use]
    pub fn new_unsupported_version_error(
        message: Option<String>,
        protocol_version: String,
        supported_protocol_major_versions: Vec<u16>,
        version_role: VersionRole,
        is_remote: bool,
        command_name: Option<String>,
    ) -> ProtocolError {
        let mut e = Self::blank(ProtocolErrorKind::UnsupportedVersion);
        e.is_remote = is_remote;
        e.protocol_version = Some(protocol_version);
        e.supported_protocol_major_versions = Some(supported_protocol_major_versions);
        e.version_role = Some(version_role);
        e.message = message;
        e.command_name = command_name;
        e.ensure_error_message();
        e
    }

    /// Sets the error's message to a default value if a custom message is not already set
    pub fn ensure_error_message(&mut self) {
        if self.message.is_none() {
            self.message = Some(self.to_string());
        }
    }
}

impl From<HlcError> for ProtocolError {
    fn from(error: HlcError) -> Self {
        match error.kind() {
            HlcErrorKind::OverflowWarning => ProtocolError::new_internal_logic_error(
                false,
                "Counter",
                Some("Hybrid logical clock counter can no longer be incremented".to_string()),
                None,
            ),
            HlcErrorKind::ClockDrift => ProtocolError::new_state_invalid_error(
                "MaxClockDrift",
                None,
                Some("Hybrid logical clock drift exceeds the configured maximum".to_string()),
                None,
            ),
        }
    }
}

impl ParseHlcError {
    /// Convert a parse failure into a [`ProtocolError`] of kind
    /// [`HeaderInvalid`](ProtocolErrorKind::HeaderInvalid), attributed to the
    /// MQTT header the encoded clock was carried in.
    #[must_use]
    pub fn into_header_invalid(self, header_name: &str, is_remote: bool) -> ProtocolError {
        ProtocolError::new_header_invalid_error(
            header_name,
            &self.input,
            is_remote,
            Some(self.message),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::str::FromStr;

    use crate::common::hybrid_logical_clock::HybridLogicalClock;

    #[test]
    fn default_messages_generated() {
        let e = ProtocolError::new_header_missing_error("__stat", false, None, None);
        assert_eq!(e.message.as_deref(), Some("The MQTT header '__stat' is missing"));
        assert!(!e.is_remote);
        assert_eq!(e.kind, ProtocolErrorKind::HeaderMissing);
    }

    #[test]
    fn custom_message_preserved() {
        let e = ProtocolError::new_timeout_error(
            false,
            None,
            "commandTimeout",
            Duration::from_secs(3),
            Some("custom".to_string()),
            Some("increment".to_string()),
        );
        assert_eq!(e.message.as_deref(), Some("custom"));
        assert_eq!(e.timeout_value, Some(Duration::from_secs(3)));
        assert_eq!(e.command_name.as_deref(), Some("increment"));
    }

    #[test]
    fn malformed_hlc_becomes_header_invalid() {
        let parse_error = HybridLogicalClock::from_str("foo:bar:node").unwrap_err();
        let e = parse_error.into_header_invalid("__ts", false);
        assert_eq!(e.kind, ProtocolErrorKind::HeaderInvalid);
        assert_eq!(e.header_name.as_deref(), Some("__ts"));
        assert_eq!(e.header_value.as_deref(), Some("foo:bar:node"));
    }

    #[test]
    fn shallow_invocation_error() {
        let e = ProtocolError::new_local_invocation_error(
            "duplicate request with same correlationId".to_string(),
            Some("readCounter".to_string()),
        );
        assert_eq!(e.kind, ProtocolErrorKind::InvocationException);
        assert!(e.is_shallow);
        assert!(!e.is_remote);
    }
}
