// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Envoys for telemetry operations: one-way typed messages with causal
//! timestamps, reusing the session client without response correlation.

use crate::ProtocolVersion;

pub mod receiver;
pub mod sender;

pub use receiver::Receiver;
pub use sender::Sender;

/// Protocol version used by all telemetry envoys in this module
pub(crate) const TELEMETRY_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };
/// Assumed version if no version is provided on a message.
pub(crate) const DEFAULT_TELEMETRY_PROTOCOL_VERSION: ProtocolVersion =
    ProtocolVersion { major: 1, minor: 0 };
/// Major protocol versions the telemetry envoys accept.
pub(crate) const SUPPORTED_PROTOCOL_VERSIONS: &[u16] = &[1];
