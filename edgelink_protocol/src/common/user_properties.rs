// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A reserved prefix for all user properties known to the protocol envoys;
/// custom properties from user code must not start with this prefix.
pub const RESERVED_PREFIX: &str = "__";

/// Enum representing the reserved system user properties.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UserProperty {
    /// A [`HybridLogicalClock`](super::hybrid_logical_clock::HybridLogicalClock)
    /// timestamp associated with the request, response, or message.
    Timestamp,
    /// A fencing token (encoded HLC) attached to a write request.
    FencingToken,
    /// User property indicating an HTTP-style status code.
    Status,
    /// User property indicating a human-readable status message; used when
    /// Status != 200 (OK).
    StatusMessage,
    /// User property indicating whether a non-200 status is an
    /// application-level error.
    IsApplicationError,
    /// User property indicating the id of a telemetry sender.
    SenderId,
    /// User property indicating the source (invoker) id of a request.
    SourceId,
    /// Legacy alias for [`SourceId`](UserProperty::SourceId), emitted for
    /// backward compatibility; readers accept either.
    InvokerId,
    /// The name of an MQTT property in a request header that is missing or
    /// has an invalid value.
    InvalidPropertyName,
    /// The value of an MQTT property in a request header that is invalid.
    InvalidPropertyValue,
    /// User property indicating the protocol version of a request, response,
    /// or message.
    ProtocolVersion,
    /// User property indicating which major protocol versions the executor
    /// supports, as a space-separated list of integers like "1 2 3".
    SupportedMajorVersions,
    /// User property indicating what protocol version an unsupported request
    /// had.
    RequestProtocolVersion,
}

impl Display for UserProperty {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UserProperty::Timestamp => write!(f, "__ts"),
            UserProperty::FencingToken => write!(f, "__ft"),
            UserProperty::Status => write!(f, "__stat"),
            UserProperty::StatusMessage => write!(f, "__stMsg"),
            UserProperty::IsApplicationError => write!(f, "__apErr"),
            UserProperty::SenderId => write!(f, "__sndId"),
            UserProperty::SourceId => write!(f, "__srcId"),
            UserProperty::InvokerId => write!(f, "__invId"),
            UserProperty::InvalidPropertyName => write!(f, "__propName"),
            UserProperty::InvalidPropertyValue => write!(f, "__propVal"),
            UserProperty::ProtocolVersion => write!(f, "__protVer"),
            UserProperty::SupportedMajorVersions => write!(f, "__supProtMajVer"),
            UserProperty::RequestProtocolVersion => write!(f, "__requestProtVer"),
        }
    }
}

impl FromStr for UserProperty {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "__ts" => Ok(UserProperty::Timestamp),
            "__ft" => Ok(UserProperty::FencingToken),
            "__stat" => Ok(UserProperty::Status),
            "__stMsg" => Ok(UserProperty::StatusMessage),
            "__apErr" => Ok(UserProperty::IsApplicationError),
            "__sndId" => Ok(UserProperty::SenderId),
            "__srcId" => Ok(UserProperty::SourceId),
            "__invId" => Ok(UserProperty::InvokerId),
            "__propName" => Ok(UserProperty::InvalidPropertyName),
            "__propVal" => Ok(UserProperty::InvalidPropertyValue),
            "__protVer" => Ok(UserProperty::ProtocolVersion),
            "__supProtMajVer" => Ok(UserProperty::SupportedMajorVersions),
            "__requestProtVer" => Ok(UserProperty::RequestProtocolVersion),
            _ => Err(()),
        }
    }
}

/// Validates custom user properties provided by application code.
///
/// # Errors
/// Returns a `String` describing the error if a key starts with the reserved
/// `__` prefix, or if a key or value is not valid for MQTT transmission.
pub fn validate_user_properties(property_list: &[(String, String)]) -> Result<(), String> {
    for (key, value) in property_list {
        if key.starts_with(RESERVED_PREFIX) {
            return Err(format!(
                "User data property '{key}' starts with reserved prefix '{RESERVED_PREFIX}'"
            ));
        }
        if super::is_invalid_utf8(key) || super::is_invalid_utf8(value) {
            return Err(format!(
                "User data key '{key}' or value '{value}' isn't valid MQTT UTF-8"
            ));
        }
    }
    Ok(())
}
