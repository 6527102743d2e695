// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

//! Command (RPC) and telemetry envoys with hybrid logical clocks over the
//! edgelink MQTT session client.

pub mod application;
pub mod common;
pub mod rpc;
pub mod telemetry;

#[macro_use]
extern crate derive_builder;

use std::fmt;

/// Protocol version of a request, response, or telemetry message, as carried
/// in the `__protVer` user property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Parse a `<major>.<minor>` version string. A bare major version is
    /// accepted with an implied minor of 0.
    pub fn parse(version: &str) -> Option<Self> {
        match version.split_once('.') {
            Some((major, minor)) => Some(Self {
                major: major.parse().ok()?,
                minor: minor.parse().ok()?,
            }),
            None => Some(Self {
                major: version.parse().ok()?,
                minor: 0,
            }),
        }
    }

    /// True if this version's major is in the supported list.
    pub fn is_supported(&self, supported_major_versions: &[u16]) -> bool {
        supported_major_versions.contains(&self.major)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parse a space-separated list of supported major versions, e.g. `"1 2 3"`.
/// Unparsable entries are dropped.
pub(crate) fn parse_supported_protocol_major_versions(s: &str) -> Vec<u16> {
    s.split_whitespace()
        .filter_map(|v| v.parse::<u16>().ok())
        .collect()
}

/// Format a supported-major-versions list as the space-separated wire form.
pub(crate) fn supported_protocol_major_versions_to_string(versions: &[u16]) -> String {
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
