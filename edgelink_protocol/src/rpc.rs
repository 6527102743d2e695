// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Envoys for Remote Procedure Call (RPC) operations.

use std::str::FromStr;

use crate::ProtocolVersion;

pub mod dispatcher;
pub mod executor;
pub mod invoker;
pub(crate) mod response_cache;

pub use executor::Executor;
pub use invoker::Invoker;

/// Protocol version used by all command envoys in this module
pub(crate) const RPC_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
/// Assumed version if no version is provided on a message.
pub(crate) const DEFAULT_RPC_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };
/// Major protocol versions the command envoys accept.
pub(crate) const SUPPORTED_PROTOCOL_VERSIONS: &[u16] = &[1];

/// Represents the valid status codes for command responses.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StatusCode {
    /// No error.
    Ok = 200,
    /// There is no content to send for this response.
    NoContent = 204,
    /// Header or payload is missing or invalid.
    BadRequest = 400,
    /// The request timed out before execution could complete.
    RequestTimeout = 408,
    /// The content type specified in the request is not supported.
    UnsupportedMediaType = 415,
    /// The request was well-formed but could not be processed.
    UnprocessableContent = 422,
    /// Unknown error, internal logic error, or command processor error.
    InternalServerError = 500,
    /// Invalid service state preventing command from executing properly.
    ServiceUnavailable = 503,
    /// The request failed because the remote party did not support the
    /// requested protocol version.
    VersionNotSupported = 505,
}

impl FromStr for StatusCode {
    type Err = StatusCodeParseError;

    fn from_str(s: &str) -> Result<Self, StatusCodeParseError> {
        match s.parse::<u16>() {
            Ok(status) => match status {
                x if x == StatusCode::Ok as u16 => Ok(StatusCode::Ok),
                x if x == StatusCode::NoContent as u16 => Ok(StatusCode::NoContent),
                x if x == StatusCode::BadRequest as u16 => Ok(StatusCode::BadRequest),
                x if x == StatusCode::RequestTimeout as u16 => Ok(StatusCode::RequestTimeout),
                x if x == StatusCode::UnsupportedMediaType as u16 => {
                    Ok(StatusCode::UnsupportedMediaType)
                }
                x if x == StatusCode::UnprocessableContent as u16 => {
                    Ok(StatusCode::UnprocessableContent)
                }
                x if x == StatusCode::InternalServerError as u16 => {
                    Ok(StatusCode::InternalServerError)
                }
                x if x == StatusCode::ServiceUnavailable as u16 => {
                    Ok(StatusCode::ServiceUnavailable)
                }
                x if x == StatusCode::VersionNotSupported as u16 => {
                    Ok(StatusCode::VersionNotSupported)
                }
                _ => Err(StatusCodeParseError::UnknownStatusCode(status)),
            },
            Err(_) => Err(StatusCodeParseError::InvalidStatusCode(s.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum StatusCodeParseError {
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),
    #[error("Unknown status code: {0}")]
    UnknownStatusCode(u16),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    #[test_case(StatusCode::Ok; "Ok")]
    #[test_case(StatusCode::NoContent; "NoContent")]
    #[test_case(StatusCode::BadRequest; "BadRequest")]
    #[test_case(StatusCode::RequestTimeout; "RequestTimeout")]
    #[test_case(StatusCode::UnsupportedMediaType; "UnsupportedMediaType")]
    #[test_case(StatusCode::UnprocessableContent; "UnprocessableContent")]
    #[test_case(StatusCode::InternalServerError; "InternalServerError")]
    #[test_case(StatusCode::ServiceUnavailable; "ServiceUnavailable")]
    #[test_case(StatusCode::VersionNotSupported; "VersionNotSupported")]
    fn to_from_string(status_code: StatusCode) {
        assert_eq!(
            status_code,
            StatusCode::from_str(&(status_code as u16).to_string()).unwrap()
        );
    }

    #[test]
    fn invalid_status_code() {
        match StatusCode::from_str("not a number") {
            Err(StatusCodeParseError::InvalidStatusCode(s)) => assert_eq!(s, "not a number"),
            other => panic!("expected InvalidStatusCode, got {other:?}"),
        }
    }

    #[test]
    fn unknown_status_code() {
        match StatusCode::from_str("201") {
            Err(StatusCodeParseError::UnknownStatusCode(code)) => assert_eq!(code, 201),
            other => panic!("expected UnknownStatusCode, got {other:?}"),
        }
    }
}
