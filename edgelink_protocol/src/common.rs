// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Utilities shared by the command and telemetry envoys.

pub mod hybrid_logical_clock;
pub mod payload_serialize;
pub mod protocol_error;
pub mod topic_pattern;
pub mod user_properties;

/// Returns true if the string is not valid for transmission as MQTT UTF-8
/// encoded data: control characters are disallowed (MQTT-1.5.4).
#[must_use]
pub(crate) fn is_invalid_utf8(s: &str) -> bool {
    s.chars()
        .any(|c| c.is_control() || ('\u{007F}'..='\u{009F}').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_characters_rejected() {
        assert!(is_invalid_utf8("abc\ndef"));
        assert!(is_invalid_utf8("abc\u{0000}def"));
        assert!(is_invalid_utf8("abc\u{009F}def"));
        assert!(!is_invalid_utf8("plain ascii"));
        assert!(!is_invalid_utf8("ünïcode"));
    }
}
