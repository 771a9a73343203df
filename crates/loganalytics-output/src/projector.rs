// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Field projection and type coercion.
//!
//! A [`Record`] arriving from the host pipeline is reduced to the configured
//! allow-list of keys and each surviving value is coerced to the column type
//! declared for it. The result is the [`Document`] that gets buffered and
//! eventually shipped.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::errors::ConfigError;

/// A structured log event as received from the host pipeline.
pub type Record = Map<String, Value>;

/// The projected, type-coerced subset of a [`Record`] that is delivered.
pub type Document = Map<String, Value>;

/// Column type a field is stored as on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Boolean,
    Double,
}

impl FromStr for FieldType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(FieldType::String),
            "boolean" => Ok(FieldType::Boolean),
            "double" => Ok(FieldType::Double),
            _ => Err(()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Double => write!(f, "double"),
        }
    }
}

/// Coerces a single value to `field_type`. Never fails: anything that cannot
/// be converted is passed through (double) or maps to `false` (boolean).
pub fn convert_value(field_type: FieldType, value: &Value) -> Value {
    match field_type {
        FieldType::String => value.clone(),
        FieldType::Boolean => Value::Bool(stringify(value).eq_ignore_ascii_case("true")),
        FieldType::Double => match value {
            Value::String(s) => parse_number(s).unwrap_or_else(|| value.clone()),
            _ => value.clone(),
        },
    }
}

/// Integer parse first, then floating point. Non-finite floats have no JSON
/// representation and are treated as unparseable.
fn parse_number(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Text form of a value as used for comparisons and template substitution.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Projects `record` onto `key_names`, coercing the fields listed in `key_types`.
///
/// An empty allow-list delivers the record as-is, without coercion.
pub fn project(
    record: &Record,
    key_names: &[String],
    key_types: &HashMap<String, FieldType>,
) -> Document {
    if key_names.is_empty() {
        return record.clone();
    }

    let mut document = Document::new();
    for key in key_names {
        let Some(value) = record.get(key) else {
            continue;
        };
        let value = match key_types.get(key) {
            Some(field_type) => convert_value(*field_type, value),
            None => value.clone(),
        };
        document.insert(key.clone(), value);
    }
    document
}

/// Validated allow-list and type map for one output instance.
#[derive(Debug, Clone, Default)]
pub struct FieldProjector {
    key_names: Vec<String>,
    key_types: HashMap<String, FieldType>,
}

impl FieldProjector {
    pub fn new(
        key_names: Vec<String>,
        key_types: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut parsed = HashMap::with_capacity(key_types.len());
        for (key, value) in key_types {
            let field_type =
                FieldType::from_str(value).map_err(|()| ConfigError::InvalidFieldType {
                    key: key.clone(),
                    value: value.clone(),
                })?;
            if !key_names.is_empty() && !key_names.contains(key) {
                warn!("Key type for '{key}' is ignored: '{key}' is not listed in key_names");
            }
            parsed.insert(key.clone(), field_type);
        }

        Ok(Self {
            key_names,
            key_types: parsed,
        })
    }

    pub fn project(&self, record: &Record) -> Document {
        project(record, &self.key_names, &self.key_types)
    }
}
