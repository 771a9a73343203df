// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolution of the logical stream key (the Log Analytics "log type") a
//! document is delivered under.
//!
//! A configured key is either a constant (`ApacheAccessLog`) or a template
//! that references record fields with `%{field}` placeholders
//! (`App_%{service}`). Templates are resolved per record, so documents from
//! one input can fan out to several stream keys.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::constants::MAX_STREAM_KEY_LEN;
use crate::errors::ConfigError;
use crate::projector::{stringify, Record};

#[allow(clippy::expect_used)]
fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\{([^}]*)\}").expect("placeholder regex is valid"))
}

#[allow(clippy::expect_used)]
fn literal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]*$").expect("literal regex is valid"))
}

/// Returns true when `key` is acceptable to the remote API as a log type.
pub fn is_valid_stream_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_STREAM_KEY_LEN && literal_regex().is_match(key)
}

/// A piece of a parsed stream key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKeyTemplate {
    /// One constant key for the whole output instance.
    Fixed(String),
    /// Key computed per record from field references.
    Templated {
        template: String,
        segments: Vec<Segment>,
    },
}

impl StreamKeyTemplate {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let template = template.trim();
        if template.is_empty() {
            return Err(ConfigError::Missing("log_type"));
        }

        let mut segments = Vec::new();
        let mut last = 0;
        for captures in placeholder_regex().captures_iter(template) {
            let (Some(whole), Some(field)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let literal = &template[last..whole.start()];
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_string()));
            }
            let field = field.as_str().trim();
            if field.is_empty() {
                return Err(ConfigError::InvalidStreamKey(template.to_string()));
            }
            segments.push(Segment::Field(field.to_string()));
            last = whole.end();
        }
        let tail = &template[last..];
        if !tail.is_empty() {
            segments.push(Segment::Literal(tail.to_string()));
        }

        let has_fields = segments.iter().any(|s| matches!(s, Segment::Field(_)));
        if !has_fields {
            if !is_valid_stream_key(template) {
                return Err(ConfigError::InvalidStreamKey(template.to_string()));
            }
            return Ok(StreamKeyTemplate::Fixed(template.to_string()));
        }

        let literal_len: usize = segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => l.len(),
                Segment::Field(_) => 0,
            })
            .sum();
        let literals_valid = segments.iter().all(|s| match s {
            Segment::Literal(l) => literal_regex().is_match(l),
            Segment::Field(_) => true,
        });
        if !literals_valid || literal_len > MAX_STREAM_KEY_LEN {
            return Err(ConfigError::InvalidStreamKey(template.to_string()));
        }

        Ok(StreamKeyTemplate::Templated {
            template: template.to_string(),
            segments,
        })
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, StreamKeyTemplate::Fixed(_))
    }

    /// Resolves the key for `record`. Returns `None` when the substituted key
    /// is not a valid log type, e.g. a referenced field is missing.
    pub fn resolve(&self, record: &Record) -> Option<String> {
        match self {
            StreamKeyTemplate::Fixed(key) => Some(key.clone()),
            StreamKeyTemplate::Templated { template, segments } => {
                let mut key = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(literal) => key.push_str(literal),
                        // missing fields keep their placeholder, like sprintf does
                        Segment::Field(field) => match record.get(field) {
                            Some(value) => key.push_str(&stringify(value)),
                            None => {
                                key.push_str("%{");
                                key.push_str(field);
                                key.push('}');
                            }
                        },
                    }
                }
                if is_valid_stream_key(&key) {
                    Some(key)
                } else {
                    warn!(
                        "Dropping record: log type '{key}' resolved from template '{template}' is invalid"
                    );
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn test_fixed_key() {
        let key = StreamKeyTemplate::parse("ApacheAccessLog").unwrap();
        assert!(key.is_fixed());
        assert_eq!(
            key.resolve(&record(json!({"a": 1}))),
            Some("ApacheAccessLog".to_string())
        );
    }

    #[test]
    fn test_fixed_key_validation() {
        assert!(StreamKeyTemplate::parse("My_Log_1").is_ok());
        assert_eq!(
            StreamKeyTemplate::parse("my-log"),
            Err(ConfigError::InvalidStreamKey("my-log".to_string()))
        );
        assert!(StreamKeyTemplate::parse("has space").is_err());
        assert!(StreamKeyTemplate::parse(&"a".repeat(101)).is_err());
        assert!(StreamKeyTemplate::parse(&"a".repeat(100)).is_ok());
        assert_eq!(
            StreamKeyTemplate::parse("  "),
            Err(ConfigError::Missing("log_type"))
        );
    }

    #[test]
    fn test_templated_key() {
        let key = StreamKeyTemplate::parse("App_%{service}_%{env}").unwrap();
        assert!(!key.is_fixed());
        let resolved = key.resolve(&record(json!({"service": "billing", "env": "prod"})));
        assert_eq!(resolved, Some("App_billing_prod".to_string()));
    }

    #[test]
    fn test_templated_key_number_field() {
        let key = StreamKeyTemplate::parse("%{kind}%{version}").unwrap();
        let resolved = key.resolve(&record(json!({"kind": "Audit", "version": 2})));
        assert_eq!(resolved, Some("Audit2".to_string()));
    }

    #[test]
    fn test_templated_key_missing_field_is_dropped() {
        let key = StreamKeyTemplate::parse("App_%{service}").unwrap();
        assert_eq!(key.resolve(&record(json!({"other": "x"}))), None);
    }

    #[test]
    fn test_templated_key_invalid_value_is_dropped() {
        let key = StreamKeyTemplate::parse("%{service}").unwrap();
        assert_eq!(key.resolve(&record(json!({"service": "bad-name"}))), None);
    }

    #[test]
    fn test_templated_key_invalid_literal() {
        assert!(StreamKeyTemplate::parse("bad-%{service}").is_err());
        assert!(StreamKeyTemplate::parse("App_%{}").is_err());
    }
}
