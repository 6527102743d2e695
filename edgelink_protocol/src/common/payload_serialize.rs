// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error;
use std::fmt::Debug;

/// Format indicator for serialization and deserialization.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FormatIndicator {
    /// Unspecified Bytes
    #[default]
    UnspecifiedBytes = 0,
    /// UTF-8 Encoded Character Data (e.g. JSON)
    Utf8EncodedCharacterData = 1,
}

impl TryFrom<Option<u8>> for FormatIndicator {
    type Error = String;

    fn try_from(value: Option<u8>) -> Result<Self, Self::Error> {
        match value {
            Some(0) | None => Ok(FormatIndicator::UnspecifiedBytes),
            Some(1) => Ok(FormatIndicator::Utf8EncodedCharacterData),
            Some(other) => Err(format!(
                "{other} is not a valid payload format indicator value"
            )),
        }
    }
}

/// A serialized payload together with its wire metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedPayload {
    /// The serialized bytes
    pub payload: Vec<u8>,
    /// The content type describing the binary format of the payload, e.g.
    /// `application/json` or `application/protobuf`
    pub content_type: String,
    /// The payload format indicator transmitted with the payload
    pub format_indicator: FormatIndicator,
}

/// Error from deserializing a received payload.
#[derive(Debug)]
pub enum DeserializationError<E: Debug + Into<Box<dyn Error + Send + Sync + 'static>>> {
    /// The payload could not be deserialized
    InvalidPayload(E),
    /// The content type of the received message is not supported by this
    /// deserializer. Contains a human-readable explanation.
    UnsupportedContentType(String),
}

/// Trait for serializing and deserializing payloads.
///
/// The envoys are payload-agnostic: every payload passes through an
/// implementation of this trait injected via the request/response type
/// parameters.
///
/// # Examples
/// ```
/// use edgelink_protocol::common::payload_serialize::{
///     DeserializationError, FormatIndicator, PayloadSerialize, SerializedPayload,
/// };
/// #[derive(Clone, Debug)]
/// pub struct CarLocation {
///     latitude: f64,
///     longitude: f64,
/// }
/// impl PayloadSerialize for CarLocation {
///     type Error = String;
///     fn serialize(self) -> Result<SerializedPayload, String> {
///         let payload =
///             format!("{{\"latitude\": {}, \"longitude\": {}}}", self.latitude, self.longitude);
///         Ok(SerializedPayload {
///             payload: payload.into_bytes(),
///             content_type: "application/json".to_string(),
///             format_indicator: FormatIndicator::Utf8EncodedCharacterData,
///         })
///     }
///     fn deserialize(
///         payload: &[u8],
///         content_type: Option<&String>,
///         _format_indicator: &FormatIndicator,
///     ) -> Result<Self, DeserializationError<String>> {
///         if content_type.is_some_and(|ct| ct != "application/json") {
///             return Err(DeserializationError::UnsupportedContentType(format!(
///                 "Invalid content type: '{content_type:?}'. Must be 'application/json'"
///             )));
///         }
///         // mock deserialization here for brevity
///         let _payload = String::from_utf8(payload.to_vec())
///             .map_err(|e| DeserializationError::InvalidPayload(e.to_string()))?;
///         Ok(CarLocation { latitude: 12.0, longitude: 35.0 })
///     }
/// }
/// ```
pub trait PayloadSerialize: Clone {
    /// The type returned in the event of a serialization/deserialization error
    type Error: Debug + Into<Box<dyn Error + Send + Sync + 'static>>;

    /// Serializes the payload into bytes plus the content type and format
    /// indicator to transmit alongside them.
    ///
    /// # Errors
    /// Returns a [`PayloadSerialize::Error`] if serialization fails.
    fn serialize(self) -> Result<SerializedPayload, Self::Error>;

    /// Deserializes received bytes, consulting the received content type and
    /// format indicator.
    ///
    /// # Errors
    /// Returns a [`DeserializationError`] if the content type is unsupported
    /// or the payload cannot be deserialized.
    fn deserialize(
        payload: &[u8],
        content_type: Option<&String>,
        format_indicator: &FormatIndicator,
    ) -> Result<Self, DeserializationError<Self::Error>>;
}

/// Raw-bytes passthrough for applications that manage their own encoding.
impl PayloadSerialize for Vec<u8> {
    type Error = std::convert::Infallible;

    fn serialize(self) -> Result<SerializedPayload, Self::Error> {
        Ok(SerializedPayload {
            payload: self,
            content_type: "application/octet-stream".to_string(),
            format_indicator: FormatIndicator::UnspecifiedBytes,
        })
    }

    fn deserialize(
        payload: &[u8],
        _content_type: Option<&String>,
        _format_indicator: &FormatIndicator,
    ) -> Result<Self, DeserializationError<Self::Error>> {
        Ok(payload.to_vec())
    }
}
