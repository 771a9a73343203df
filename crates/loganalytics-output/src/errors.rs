// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while validating the output configuration. These are fatal at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    Missing(&'static str),

    #[error("Invalid log type '{0}': only alphanumerics and underscores are allowed, up to 100 characters")]
    InvalidStreamKey(String),

    #[error("Key type({value}) for key({key}) must be either string, boolean, or double")]
    InvalidFieldType { key: String, value: String },

    #[error("Option {0} must be greater than 0")]
    NotPositive(&'static str),

    #[error("Invalid value '{value}' for {option}")]
    InvalidValue { option: &'static str, value: String },

    #[error("Unable to build HTTP client: {0}")]
    HttpClient(String),
}

/// Errors returned by a delivery client when a chunk could not be handed to the remote API.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The request never produced a response (connect, TLS, timeout, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The chunk could not be turned into a request body.
    #[error("payload error: {0}")]
    Payload(String),
}

/// Errors raised while closing an output instance.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("Final flush did not complete within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Flush scheduler task failed: {0}")]
    Task(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Payload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidFieldType {
            key: "status".to_string(),
            value: "integer".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Key type(integer) for key(status) must be either string, boolean, or double"
        );

        let error = ConfigError::Missing("customer_id");
        assert_eq!(error.to_string(), "Missing required option: customer_id");
    }

    #[test]
    fn test_delivery_error_from_serde() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let delivery_error = DeliveryError::from(err);
        assert!(matches!(delivery_error, DeliveryError::Payload(_)));
        assert!(delivery_error.to_string().starts_with("payload error"));
    }
}
