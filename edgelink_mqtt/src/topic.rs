// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MQTT topic name and topic filter utilities

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// MQTT topic level separator
const LEVEL_SEPARATOR: char = '/';
/// MQTT topic multi-level wildcard
const MULTI_LEVEL_WILDCARD: &str = "#";
/// MQTT topic single-level wildcard
const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Prefix identifying a shared subscription topic filter
const SHARED_SUBSCRIPTION_PREFIX: &str = "$share/";

/// Error when parsing a topic name or topic filter
#[derive(Error, Debug)]
pub enum TopicParseError {
    /// The topic name or topic filter is empty
    #[error("must be at least one character long")]
    Empty,
    /// The topic name contains a wildcard character (# or +)
    #[error("wildcard characters not allowed in topic name: {0}")]
    WildcardInTopicName(String),
    /// A wildcard character (# or +) does not occupy an entire level of the topic filter
    #[error("wildcard characters must occupy an entire level of the topic filter: {0}")]
    WildcardNotAlone(String),
    /// A multi-level wildcard (#) is not the last character of the topic filter
    #[error("multi-level wildcard must be the last character specified: {0}")]
    WildcardNotLast(String),
    /// The share name of a shared subscription topic filter is empty or contains a wildcard
    #[error("share name must not be empty or contain wildcard characters: {0}")]
    InvalidShareName(String),
}

/// Represents an MQTT topic filter
#[derive(Debug, Clone)]
pub struct TopicFilter {
    /// The topic filter as supplied (including any `$share/<group>/` prefix)
    topic_filter: String,
    /// The levels of the filter used for matching (share prefix removed)
    match_levels: Vec<String>,
}

impl TopicFilter {
    /// Create a new [`TopicFilter`] from a [`String`]
    ///
    /// # Errors
    /// [`TopicParseError`] if the string is invalid for an MQTT topic filter
    pub fn from_string(topic_filter: String) -> Result<TopicFilter, TopicParseError> {
        if topic_filter.is_empty() {
            return Err(TopicParseError::Empty);
        }

        // Shared subscription filters match on the portion after $share/<group>/ (MQTTv5 4.8.2)
        let match_portion = if let Some(rest) = topic_filter.strip_prefix(SHARED_SUBSCRIPTION_PREFIX)
        {
            let (share_name, filter) = rest
                .split_once(LEVEL_SEPARATOR)
                .ok_or_else(|| TopicParseError::InvalidShareName(topic_filter.clone()))?;
            if share_name.is_empty()
                || share_name.contains(MULTI_LEVEL_WILDCARD)
                || share_name.contains(SINGLE_LEVEL_WILDCARD)
            {
                return Err(TopicParseError::InvalidShareName(topic_filter.clone()));
            }
            if filter.is_empty() {
                return Err(TopicParseError::Empty);
            }
            filter
        } else {
            &topic_filter
        };

        let levels: Vec<&str> = match_portion.split(LEVEL_SEPARATOR).collect();
        for (i, level) in levels.iter().enumerate() {
            // Wildcards must occupy an entire level (MQTTv5 4.7.1)
            if level.len() > 1
                && (level.contains(MULTI_LEVEL_WILDCARD) || level.contains(SINGLE_LEVEL_WILDCARD))
            {
                return Err(TopicParseError::WildcardNotAlone(topic_filter.clone()));
            }
            // The multi-level wildcard must be the last level (MQTTv5 4.7.1)
            if *level == MULTI_LEVEL_WILDCARD && i != levels.len() - 1 {
                return Err(TopicParseError::WildcardNotLast(topic_filter.clone()));
            }
        }

        let match_levels = levels.into_iter().map(ToString::to_string).collect();
        Ok(TopicFilter {
            topic_filter,
            match_levels,
        })
    }

    /// Get the [`TopicFilter`] formatted as a [`&str`]
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.topic_filter.as_str()
    }

    /// Check if the [`TopicFilter`] matches a given concrete topic name.
    ///
    /// Honors `+` (single level) and terminal `#` (multi-level) semantics.
    #[must_use]
    pub fn matches_topic_name(&self, topic_name: &str) -> bool {
        let mut name_levels = topic_name.split(LEVEL_SEPARATOR);
        let mut filter_levels = self.match_levels.iter();

        loop {
            match (filter_levels.next(), name_levels.next()) {
                (Some(filter_level), _) if filter_level == MULTI_LEVEL_WILDCARD => {
                    // '#' also matches the parent level, e.g. 'a/#' matches 'a' (MQTTv5 4.7.1.2)
                    return true;
                }
                (Some(filter_level), Some(name_level)) => {
                    if filter_level != SINGLE_LEVEL_WILDCARD && filter_level != name_level {
                        return false;
                    }
                }
                (None, None) => return true,
                // Filter has levels remaining ('#' handled above), or name does
                (Some(_), None) | (None, Some(_)) => return false,
            }
        }
    }
}

impl FromStr for TopicFilter {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicFilter::from_string(s.to_string())
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic_filter)
    }
}

/// Returns true if the string is valid for use as an MQTT topic name.
///
/// Topic names must be non-empty and must not contain wildcard characters
/// (MQTTv5 4.7.1, 4.7.3).
#[must_use]
pub fn is_valid_topic_name(topic_name: &str) -> bool {
    !topic_name.is_empty()
        && !topic_name.contains(MULTI_LEVEL_WILDCARD)
        && !topic_name.contains(SINGLE_LEVEL_WILDCARD)
        && !topic_name.starts_with(SHARED_SUBSCRIPTION_PREFIX)
}
