// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_ENDPOINT, DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_FLUSH_ITEMS, DEFAULT_MAX_BATCH_ITEMS,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SHUTDOWN_TIMEOUT_SECS,
};
use crate::errors::ConfigError;
use crate::projector::FieldProjector;
use crate::stream_key::StreamKeyTemplate;

/// How the host pipeline hands records to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Records arrive one at a time and are flushed by count or by timer.
    #[default]
    Windowed,
    /// Records arrive in externally delimited groups, each flushed on its own.
    Batch,
}

impl FromStr for DeliveryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "windowed" => Ok(DeliveryMode::Windowed),
            "batch" => Ok(DeliveryMode::Batch),
            _ => Err(ConfigError::InvalidValue {
                option: "delivery_mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration of one Log Analytics output instance.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Workspace id.
    pub customer_id: String,
    /// Primary or secondary workspace key.
    pub shared_key: String,
    /// Log type to submit under. Supports `%{field}` references.
    pub log_type: String,
    /// Ingestion host suffix, e.g. ods.opinsights.azure.com
    pub endpoint: String,
    /// Full base URL replacing `https://{customer_id}.{endpoint}`. Mostly for tests.
    pub endpoint_url: Option<String>,
    /// Field the remote side should use as the record timestamp (ISO 8601).
    pub time_generated_field: String,
    /// Keys to submit. Empty submits every field of the record.
    pub key_names: Vec<String>,
    /// Column type per key: `string`, `boolean` or `double`.
    pub key_types: HashMap<String, String>,
    /// Maximum number of documents per request.
    pub max_batch_items: usize,
    /// Buffered documents per log type that trigger a flush (windowed mode).
    pub flush_items: usize,
    /// Seconds between timer flushes (windowed mode).
    pub flush_interval_secs: u64,
    pub delivery_mode: DeliveryMode,
    pub request_timeout_secs: u64,
    /// Upper bound on the final flush performed by `close`.
    pub shutdown_timeout_secs: u64,
    pub https_proxy: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            customer_id: String::new(),
            shared_key: String::new(),
            log_type: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            endpoint_url: None,
            time_generated_field: String::new(),
            key_names: Vec::new(),
            key_types: HashMap::new(),
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
            flush_items: DEFAULT_FLUSH_ITEMS,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            delivery_mode: DeliveryMode::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            https_proxy: None,
        }
    }
}

impl fmt::Debug for OutputConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputConfig")
            .field("customer_id", &self.customer_id)
            .field("shared_key", &"<redacted>")
            .field("log_type", &self.log_type)
            .field("endpoint", &self.endpoint)
            .field("endpoint_url", &self.endpoint_url)
            .field("time_generated_field", &self.time_generated_field)
            .field("key_names", &self.key_names)
            .field("key_types", &self.key_types)
            .field("max_batch_items", &self.max_batch_items)
            .field("flush_items", &self.flush_items)
            .field("flush_interval_secs", &self.flush_interval_secs)
            .field("delivery_mode", &self.delivery_mode)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .field("https_proxy", &self.https_proxy)
            .finish()
    }
}

impl OutputConfig {
    /// Create configuration from `LA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            customer_id: lookup("LA_CUSTOMER_ID").unwrap_or_default(),
            shared_key: lookup("LA_SHARED_KEY").unwrap_or_default(),
            log_type: lookup("LA_LOG_TYPE").unwrap_or_default(),
            endpoint: lookup("LA_ENDPOINT").unwrap_or(defaults.endpoint),
            endpoint_url: lookup("LA_ENDPOINT_URL").filter(|url| !url.trim().is_empty()),
            time_generated_field: lookup("LA_TIME_GENERATED_FIELD").unwrap_or_default(),
            key_names: lookup("LA_KEY_NAMES")
                .map(|names| parse_list(&names))
                .unwrap_or_default(),
            key_types: match lookup("LA_KEY_TYPES") {
                Some(types) => parse_key_types(&types)?,
                None => HashMap::new(),
            },
            max_batch_items: parse_number(&lookup, "LA_MAX_BATCH_ITEMS", "max_batch_items")?
                .unwrap_or(defaults.max_batch_items),
            flush_items: parse_number(&lookup, "LA_FLUSH_ITEMS", "flush_items")?
                .unwrap_or(defaults.flush_items),
            flush_interval_secs: parse_number(
                &lookup,
                "LA_FLUSH_INTERVAL_SECS",
                "flush_interval_secs",
            )?
            .unwrap_or(defaults.flush_interval_secs),
            delivery_mode: match lookup("LA_DELIVERY_MODE") {
                Some(mode) => mode.parse()?,
                None => defaults.delivery_mode,
            },
            request_timeout_secs: parse_number(
                &lookup,
                "LA_REQUEST_TIMEOUT_SECS",
                "request_timeout_secs",
            )?
            .unwrap_or(defaults.request_timeout_secs),
            shutdown_timeout_secs: parse_number(
                &lookup,
                "LA_SHUTDOWN_TIMEOUT_SECS",
                "shutdown_timeout_secs",
            )?
            .unwrap_or(defaults.shutdown_timeout_secs),
            https_proxy: lookup("LA_PROXY_HTTPS").or_else(|| lookup("HTTPS_PROXY")),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Any error here must stop the output from starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.customer_id.trim().is_empty() {
            return Err(ConfigError::Missing("customer_id"));
        }
        if self.shared_key.trim().is_empty() {
            return Err(ConfigError::Missing("shared_key"));
        }
        if self.endpoint.trim().is_empty() && self.endpoint_url.is_none() {
            return Err(ConfigError::Missing("endpoint"));
        }

        self.stream_key_template()?;
        self.field_projector()?;

        if self.max_batch_items == 0 {
            return Err(ConfigError::NotPositive("max_batch_items"));
        }
        if self.flush_items == 0 {
            return Err(ConfigError::NotPositive("flush_items"));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::NotPositive("flush_interval_secs"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::NotPositive("request_timeout_secs"));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::NotPositive("shutdown_timeout_secs"));
        }

        Ok(())
    }

    pub fn stream_key_template(&self) -> Result<StreamKeyTemplate, ConfigError> {
        StreamKeyTemplate::parse(&self.log_type)
    }

    pub fn field_projector(&self) -> Result<FieldProjector, ConfigError> {
        FieldProjector::new(self.key_names.clone(), &self.key_types)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Splits on commas and whitespace, dropping empty entries.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parses `key:type` pairs separated by commas or whitespace.
fn parse_key_types(value: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut types = HashMap::new();
    for pair in parse_list(value) {
        let parts = pair.split(':').collect::<Vec<&str>>();
        match parts.as_slice() {
            [key, field_type] if !key.is_empty() && !field_type.is_empty() => {
                types.insert((*key).to_string(), (*field_type).to_string());
            }
            _ => {
                return Err(ConfigError::InvalidValue {
                    option: "key_types",
                    value: pair,
                })
            }
        }
    }
    Ok(types)
}

fn parse_number<F, T>(
    lookup: &F,
    var: &str,
    option: &'static str,
) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { option, value: raw }),
    }
}
