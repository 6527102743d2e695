// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Validation and substitution of tokenized topic patterns.
//!
//! A pattern is a `/`-separated sequence of levels, each either a literal or a
//! token `{name}`. Tokens are substituted from a resident map (fixed at
//! construction) and a transient map (supplied per call, taking precedence);
//! unresolved tokens become the `+` wildcard so the result can serve as a
//! subscription filter.

use std::collections::HashMap;
use std::str::FromStr;

use edgelink_mqtt::topic::TopicFilter;

/// Wildcard substituted for unresolved tokens
pub const WILDCARD: &str = "+";

/// Outcome of validating a topic pattern against its replacement maps.
///
/// [`validate`] is total: it returns exactly one of these for every input and
/// never panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternValidity {
    /// The pattern is valid and every token resolves
    Valid,
    /// The pattern itself is malformed
    InvalidPattern,
    /// A token resolves in neither the resident nor the transient map
    MissingReplacement,
    /// A token's resident replacement value is not a valid topic segment
    InvalidResidentReplacement,
    /// A token's transient replacement value is not a valid topic segment
    InvalidTransientReplacement,
}

/// Represents an error from constructing or resolving a [`TopicPattern`]
#[derive(thiserror::Error, Debug)]
pub struct TopicPatternError {
    msg: Option<String>,
    kind: TopicPatternErrorKind,
}

impl TopicPatternError {
    /// Get the kind of error that occurred
    #[must_use]
    pub fn kind(&self) -> &TopicPatternErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TopicPatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(msg) = &self.msg {
            write!(f, "{} - {}", self.kind, msg)?;
            return Ok(());
        }
        write!(f, "{}", self.kind)
    }
}

/// Represents the kind of error from constructing or resolving a [`TopicPattern`]
#[derive(thiserror::Error, Debug)]
pub enum TopicPatternErrorKind {
    /// The topic pattern is invalid
    #[error("topic pattern '{0}' is invalid")]
    InvalidPattern(String),
    /// The share name is invalid
    #[error("share name '{0}' is invalid")]
    InvalidShareName(String),
    /// The topic namespace is invalid
    #[error("topic namespace '{0}' is invalid")]
    InvalidNamespace(String),
    /// A token's replacement value is invalid
    #[error("token '{0}' replacement value '{1}' is invalid")]
    InvalidTokenReplacement(String, String),
    /// A token has no replacement in any supplied map
    #[error("token '{0}' has no replacement")]
    MissingReplacement(String),
}

/// Check if a string contains characters disallowed in topic levels and
/// replacement values.
///
/// Returns true if the string contains any of the following:
/// - Non-ASCII characters
/// - Characters outside the printable range `!`..=`~`
/// - Characters `+`, `#`, `{`, `}`
#[must_use]
pub(crate) fn contains_invalid_char(s: &str) -> bool {
    s.chars().any(|c| {
        !c.is_ascii() || !('!'..='~').contains(&c) || c == '+' || c == '#' || c == '{' || c == '}'
    })
}

/// Determine whether a string is valid as a token replacement value or topic
/// namespace.
///
/// Returns true if the string is non-empty, contains no invalid characters,
/// does not start or end with `/`, and does not contain `//`.
#[must_use]
pub(crate) fn is_valid_replacement(s: &str) -> bool {
    !(s.is_empty()
        || s.split('/').any(|level| contains_invalid_char(level))
        || s.starts_with('/')
        || s.ends_with('/')
        || s.contains("//"))
}

/// One parsed level of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternLevel {
    Literal(String),
    Token(String),
}

/// Parse a pattern into levels, or [`None`] if the pattern is malformed.
fn parse_levels(pattern: &str) -> Option<Vec<PatternLevel>> {
    if pattern.trim().is_empty() || pattern.starts_with('$') {
        return None;
    }
    let mut levels = Vec::new();
    for level in pattern.split('/') {
        if level.trim().is_empty() {
            return None;
        }
        if let Some(name) = level.strip_prefix('{').and_then(|l| l.strip_suffix('}')) {
            if name.trim().is_empty() || contains_invalid_char(name) {
                return None;
            }
            levels.push(PatternLevel::Token(name.to_string()));
        } else {
            if contains_invalid_char(level) {
                return None;
            }
            levels.push(PatternLevel::Literal(level.to_string()));
        }
    }
    Some(levels)
}

/// Validate a topic pattern against resident and transient replacement maps.
///
/// Total over all inputs; see [`PatternValidity`] for the outcomes. Transient
/// replacements take precedence over resident ones for tokens present in both.
#[must_use]
pub fn validate(
    pattern: &str,
    resident: &HashMap<String, String>,
    transient: &HashMap<String, String>,
) -> PatternValidity {
    let Some(levels) = parse_levels(pattern) else {
        return PatternValidity::InvalidPattern;
    };
    let mut missing = false;
    for level in levels {
        if let PatternLevel::Token(name) = level {
            if let Some(replacement) = transient.get(&name) {
                if !is_valid_replacement(replacement) {
                    return PatternValidity::InvalidTransientReplacement;
                }
            } else if let Some(replacement) = resident.get(&name) {
                if !is_valid_replacement(replacement) {
                    return PatternValidity::InvalidResidentReplacement;
                }
            } else {
                missing = true;
            }
        }
    }
    if missing {
        PatternValidity::MissingReplacement
    } else {
        PatternValidity::Valid
    }
}

/// Substitute tokens in a pattern from up to two maps.
///
/// `map1` is consulted first, then `map2`; substituted output is never
/// re-substituted. Unresolved tokens are replaced with the `+` wildcard, so the
/// result is a subscription filter under partial substitution and a concrete
/// topic under full substitution.
///
/// A malformed pattern is returned unchanged.
#[must_use]
pub fn resolve(
    pattern: &str,
    map1: Option<&HashMap<String, String>>,
    map2: Option<&HashMap<String, String>>,
) -> String {
    let Some(levels) = parse_levels(pattern) else {
        return pattern.to_string();
    };
    levels
        .into_iter()
        .map(|level| match level {
            PatternLevel::Literal(literal) => literal,
            PatternLevel::Token(name) => map1
                .and_then(|m| m.get(&name))
                .or_else(|| map2.and_then(|m| m.get(&name)))
                .cloned()
                .unwrap_or_else(|| WILDCARD.to_string()),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Compare a concrete topic against a filter, honoring `+` (single level) and
/// terminal `#` (multi-level) semantics. Returns false for malformed filters.
#[must_use]
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    match TopicFilter::from_str(filter) {
        Ok(filter) => filter.matches_topic_name(topic),
        Err(_) => false,
    }
}

/// A validated topic pattern with its resident token bindings.
#[derive(Debug)]
pub struct TopicPattern {
    levels: Vec<PatternLevel>,
    resident_tokens: HashMap<String, String>,
    share_name: Option<String>,
}

impl TopicPattern {
    /// Creates a new topic pattern from a pattern string.
    ///
    /// # Arguments
    /// * `pattern` - The topic pattern
    /// * `share_name` - Optional shared-subscription service group
    /// * `topic_namespace` - Optional namespace prepended to the pattern
    /// * `resident_tokens` - Token replacements fixed for the pattern lifetime
    ///
    /// # Errors
    /// [`TopicPatternError`] of the kind matching the invalid argument;
    /// resident replacements for tokens appearing in the pattern are validated
    /// here.
    pub fn new(
        pattern: &str,
        share_name: Option<String>,
        topic_namespace: Option<&str>,
        resident_tokens: &HashMap<String, String>,
    ) -> Result<Self, TopicPatternError> {
        if let Some(share_name) = &share_name {
            if share_name.trim().is_empty()
                || contains_invalid_char(share_name)
                || share_name.contains('/')
            {
                return Err(TopicPatternError {
                    msg: None,
                    kind: TopicPatternErrorKind::InvalidShareName(share_name.to_string()),
                });
            }
        }

        let mut levels = Vec::new();
        if let Some(topic_namespace) = topic_namespace {
            if !is_valid_replacement(topic_namespace) {
                return Err(TopicPatternError {
                    msg: None,
                    kind: TopicPatternErrorKind::InvalidNamespace(topic_namespace.to_string()),
                });
            }
            levels.extend(
                topic_namespace
                    .split('/')
                    .map(|level| PatternLevel::Literal(level.to_string())),
            );
        }

        let pattern_levels = parse_levels(pattern).ok_or_else(|| TopicPatternError {
            msg: None,
            kind: TopicPatternErrorKind::InvalidPattern(pattern.to_string()),
        })?;

        for level in &pattern_levels {
            if let PatternLevel::Token(name) = level {
                if let Some(replacement) = resident_tokens.get(name) {
                    if !is_valid_replacement(replacement) {
                        return Err(TopicPatternError {
                            msg: None,
                            kind: TopicPatternErrorKind::InvalidTokenReplacement(
                                name.clone(),
                                replacement.clone(),
                            ),
                        });
                    }
                }
            }
        }
        levels.extend(pattern_levels);

        Ok(TopicPattern {
            levels,
            resident_tokens: resident_tokens.clone(),
            share_name,
        })
    }

    /// Get the subscribe topic for the pattern.
    ///
    /// Unresolved tokens become the `+` wildcard; a share name prepends
    /// `$share/<name>/`.
    #[must_use]
    pub fn as_subscribe_topic(&self) -> String {
        let topic = self.render(None).unwrap_or_else(|_| {
            // Unresolvable tokens cannot occur: render without a transient map
            // falls back to wildcards
            unreachable!("wildcard fallback covers unresolved tokens")
        });
        if let Some(share_name) = &self.share_name {
            format!("$share/{share_name}/{topic}")
        } else {
            topic
        }
    }

    /// Get a concrete publish topic for the pattern.
    ///
    /// Transient tokens override resident ones; every token must resolve.
    ///
    /// # Errors
    /// [`TopicPatternError`] of kind
    /// [`MissingReplacement`](TopicPatternErrorKind::MissingReplacement) if a
    /// token resolves in neither map, or
    /// [`InvalidTokenReplacement`](TopicPatternErrorKind::InvalidTokenReplacement)
    /// if a transient replacement is invalid.
    pub fn as_publish_topic(
        &self,
        transient_tokens: &HashMap<String, String>,
    ) -> Result<String, TopicPatternError> {
        self.render(Some(transient_tokens))
    }

    /// Render the pattern. With a transient map, every token must resolve;
    /// without one, unresolved tokens become wildcards.
    fn render(
        &self,
        transient_tokens: Option<&HashMap<String, String>>,
    ) -> Result<String, TopicPatternError> {
        let mut rendered = Vec::with_capacity(self.levels.len());
        for level in &self.levels {
            match level {
                PatternLevel::Literal(literal) => rendered.push(literal.as_str()),
                PatternLevel::Token(name) => {
                    if let Some(replacement) =
                        transient_tokens.and_then(|tokens| tokens.get(name))
                    {
                        if !is_valid_replacement(replacement) {
                            return Err(TopicPatternError {
                                msg: None,
                                kind: TopicPatternErrorKind::InvalidTokenReplacement(
                                    name.clone(),
                                    replacement.clone(),
                                ),
                            });
                        }
                        rendered.push(replacement.as_str());
                    } else if let Some(replacement) = self.resident_tokens.get(name) {
                        rendered.push(replacement.as_str());
                    } else if transient_tokens.is_some() {
                        return Err(TopicPatternError {
                            msg: None,
                            kind: TopicPatternErrorKind::MissingReplacement(name.clone()),
                        });
                    } else {
                        rendered.push(WILDCARD);
                    }
                }
            }
        }
        Ok(rendered.join("/"))
    }

    /// Identify token values in a concrete topic by comparing it against the
    /// pattern level-by-level.
    ///
    /// Returns a map of token names to the values found in the topic.
    #[must_use]
    pub fn parse_tokens(&self, topic: &str) -> HashMap<String, String> {
        let mut tokens = HashMap::new();
        for (level, value) in self.levels.iter().zip(topic.split('/')) {
            if let PatternLevel::Token(name) = level {
                tokens.insert(name.clone(), value.to_string());
            }
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    fn resident_tokens() -> HashMap<String, String> {
        HashMap::from([
            ("modelId".to_string(), "thermostat".to_string()),
            ("executorId".to_string(), "exec-1".to_string()),
        ])
    }

    #[test_case("svc/{modelId}/cmd", PatternValidity::Valid; "resolvable")]
    #[test_case("svc/plain/cmd", PatternValidity::Valid; "no tokens")]
    #[test_case("", PatternValidity::InvalidPattern; "empty")]
    #[test_case(" ", PatternValidity::InvalidPattern; "whitespace")]
    #[test_case("$sys/{modelId}", PatternValidity::InvalidPattern; "starts with dollar")]
    #[test_case("svc//cmd", PatternValidity::InvalidPattern; "empty level")]
    #[test_case("/svc/cmd", PatternValidity::InvalidPattern; "leading slash")]
    #[test_case("svc/cmd/", PatternValidity::InvalidPattern; "trailing slash")]
    #[test_case("svc/c md", PatternValidity::InvalidPattern; "space in level")]
    #[test_case("svc/c+md", PatternValidity::InvalidPattern; "plus in level")]
    #[test_case("svc/c#md", PatternValidity::InvalidPattern; "hash in level")]
    #[test_case("svc/{}", PatternValidity::InvalidPattern; "empty token")]
    #[test_case("svc/{mo+delId}", PatternValidity::InvalidPattern; "invalid token name")]
    #[test_case("svc/{modelId}}", PatternValidity::InvalidPattern; "stray brace")]
    #[test_case("svc/{unbound}/cmd", PatternValidity::MissingReplacement; "unbound token")]
    fn validate_outcomes(pattern: &str, expected: PatternValidity) {
        let result = validate(pattern, &resident_tokens(), &HashMap::new());
        assert_eq!(result, expected);
    }

    #[test]
    fn validate_flags_bad_resident_replacement() {
        let resident = HashMap::from([("modelId".to_string(), "bad value".to_string())]);
        assert_eq!(
            validate("svc/{modelId}", &resident, &HashMap::new()),
            PatternValidity::InvalidResidentReplacement
        );
    }

    #[test]
    fn validate_flags_bad_transient_replacement() {
        let transient = HashMap::from([("modelId".to_string(), "bad+value".to_string())]);
        // The transient map takes precedence even though the resident value is fine
        assert_eq!(
            validate("svc/{modelId}", &resident_tokens(), &transient),
            PatternValidity::InvalidTransientReplacement
        );
    }

    /// The validator is total: arbitrary garbage yields an outcome, not a panic
    #[test_case("{{{{"; "brace runs")]
    #[test_case("////"; "slash runs")]
    #[test_case("\u{0}\u{1}"; "control characters")]
    #[test_case("日本語/トピック"; "non-ascii")]
    fn validate_never_panics(pattern: &str) {
        let _ = validate(pattern, &HashMap::new(), &HashMap::new());
    }

    #[test]
    fn resolve_applies_map1_before_map2() {
        let map1 = HashMap::from([("id".to_string(), "from-map1".to_string())]);
        let map2 = HashMap::from([
        ("id".to_string(), "from-map2".to_string()),
            ("other".to_string(), "value".to_string()),
        ]);
        assert_eq!(
            resolve("a/{id}/{other}", Some(&map1), Some(&map2)),
            "a/from-map1/value"
        );
    }

    #[test]
    fn resolve_does_not_resubstitute() {
        // map1's output contains a token-shaped value; map2 must not touch it
        let map1 = HashMap::from([("id".to_string(), "{other}".to_string())]);
        let map2 = HashMap::from([("other".to_string(), "value".to_string())]);
        assert_eq!(resolve("a/{id}", Some(&map1), Some(&map2)), "a/{other}");
    }

    #[test]
    fn resolve_substitutes_wildcards_for_unresolved() {
        assert_eq!(resolve("a/{x}/b/{y}", None, None), "a/+/b/+");
    }

    #[test_case("svc/thermostat/cmd", "svc/+/cmd", true; "single wildcard")]
    #[test_case("svc/thermostat/cmd", "svc/#", true; "multi wildcard")]
    #[test_case("svc/thermostat/cmd", "svc/+/other", false; "mismatch")]
    #[test_case("svc/thermostat/cmd", "svc/th##/cmd", false; "malformed filter")]
    fn filter_matching(topic: &str, filter: &str, matches: bool) {
        assert_eq!(topic_matches_filter(topic, filter), matches);
    }

    #[test]
    fn pattern_subscribe_topic_wildcards_unbound_tokens() {
        let pattern = TopicPattern::new(
            "svc/{modelId}/cmd/{commandName}",
            None,
            None,
            &resident_tokens(),
        )
        .unwrap();
        assert_eq!(pattern.as_subscribe_topic(), "svc/thermostat/cmd/+");
    }

    #[test]
    fn pattern_subscribe_topic_with_share_and_namespace() {
        let pattern = TopicPattern::new(
            "svc/{modelId}/cmd",
            Some("group1".to_string()),
            Some("tenant/blue"),
            &resident_tokens(),
        )
        .unwrap();
        assert_eq!(
            pattern.as_subscribe_topic(),
            "$share/group1/tenant/blue/svc/thermostat/cmd"
        );
    }

    #[test]
    fn pattern_publish_topic_transient_overrides_resident() {
        let pattern =
            TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, None, &resident_tokens())
                .unwrap();
        let transient = HashMap::from([
            ("modelId".to_string(), "override".to_string()),
            ("commandName".to_string(), "increment".to_string()),
        ]);
        assert_eq!(
            pattern.as_publish_topic(&transient).unwrap(),
            "svc/override/cmd/increment"
        );
    }

    #[test]
    fn pattern_publish_topic_requires_full_resolution() {
        let pattern =
            TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, None, &resident_tokens())
                .unwrap();
        let err = pattern.as_publish_topic(&HashMap::new()).unwrap_err();
        assert!(matches!(
            err.kind(),
            TopicPatternErrorKind::MissingReplacement(t) if t == "commandName"
        ));
    }

    #[test_case("bad value"; "space")]
    #[test_case("bad+value"; "plus")]
    #[test_case("/bad"; "leading slash")]
    #[test_case("bad/"; "trailing slash")]
    #[test_case("bad//value"; "double slash")]
    #[test_case(""; "empty")]
    fn pattern_publish_topic_rejects_bad_transient(replacement: &str) {
        let pattern = TopicPattern::new("svc/{id}", None, None, &HashMap::new()).unwrap();
        let transient = HashMap::from([("id".to_string(), replacement.to_string())]);
        let err = pattern.as_publish_topic(&transient).unwrap_err();
        assert!(matches!(
            err.kind(),
            TopicPatternErrorKind::InvalidTokenReplacement(t, r) if t == "id" && r == replacement
        ));
    }

    #[test_case("bad share"; "space in share")]
    #[test_case("bad/share"; "slash in share")]
    #[test_case(""; "empty share")]
    fn pattern_rejects_bad_share_name(share_name: &str) {
        let err = TopicPattern::new("svc/cmd", Some(share_name.to_string()), None, &HashMap::new())
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            TopicPatternErrorKind::InvalidShareName(s) if s == share_name
        ));
    }

    #[test_case("bad namespace"; "space in namespace")]
    #[test_case("/bad"; "leading slash in namespace")]
    fn pattern_rejects_bad_namespace(namespace: &str) {
        let err =
            TopicPattern::new("svc/cmd", None, Some(namespace), &HashMap::new()).unwrap_err();
        assert!(matches!(
            err.kind(),
            TopicPatternErrorKind::InvalidNamespace(n) if n == namespace
        ));
    }

    #[test]
    fn parse_tokens_recovers_values() {
        let pattern = TopicPattern::new(
            "svc/{modelId}/cmd/{commandName}",
            None,
            Some("tenant"),
            &HashMap::new(),
        )
        .unwrap();
        let tokens = pattern.parse_tokens("tenant/svc/thermostat/cmd/increment");
        assert_eq!(
            tokens,
            HashMap::from([
                ("modelId".to_string(), "thermostat".to_string()),
                ("commandName".to_string(), "increment".to_string()),
            ])
        );
    }
}
