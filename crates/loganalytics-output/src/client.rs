// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery client boundary and the HTTP client for the Data Collector API.

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

use crate::config::OutputConfig;
use crate::constants::API_VERSION;
use crate::errors::{ConfigError, DeliveryError};
use crate::projector::Document;

const LOGS_RESOURCE: &str = "/api/logs";

/// What the remote API answered for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status: StatusCode,
    pub body: String,
}

impl DeliveryResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Sends `documents` under `stream_key`. `time_field` names the field the
    /// remote side should use as the record timestamp; empty means ingestion time.
    async fn post(
        &self,
        stream_key: &str,
        documents: &[Document],
        time_field: &str,
    ) -> Result<DeliveryResponse, DeliveryError>;

    fn is_success(&self, response: &DeliveryResponse) -> bool {
        response.status.is_success()
    }
}

/// Everything a request signature may cover.
#[derive(Debug, Clone, Copy)]
pub struct SigningInput<'a> {
    pub customer_id: &'a str,
    pub shared_key: &'a str,
    pub method: &'a str,
    pub content_length: usize,
    pub content_type: &'a str,
    pub date: &'a str,
    pub resource: &'a str,
}

/// Produces the `Authorization` header for a request, if any.
pub trait Authorizer: Send + Sync + Debug {
    fn authorization(&self, input: &SigningInput<'_>) -> Option<String>;
}

/// Sends requests without an `Authorization` header, for deployments where a
/// signing proxy sits in front of the ingestion API.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsignedAuthorizer;

impl Authorizer for UnsignedAuthorizer {
    fn authorization(&self, _input: &SigningInput<'_>) -> Option<String> {
        None
    }
}

#[derive(Clone)]
pub struct HttpDeliveryClient {
    client: reqwest::Client,
    url: String,
    customer_id: String,
    shared_key: String,
    authorizer: Arc<dyn Authorizer>,
}

impl HttpDeliveryClient {
    /// Builds the client for `config`. Fails on an unusable proxy URL or when
    /// the HTTP stack cannot be initialised.
    pub fn new(config: &OutputConfig) -> Result<Self, ConfigError> {
        let base = match &config.endpoint_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.{}", config.customer_id, config.endpoint),
        };
        let url = format!("{base}{LOGS_RESOURCE}?api-version={API_VERSION}");

        let mut builder = reqwest::Client::builder().timeout(config.request_timeout());
        if let Some(proxy) = &config.https_proxy {
            let proxy = reqwest::Proxy::https(proxy).map_err(|_| ConfigError::InvalidValue {
                option: "https_proxy",
                value: proxy.clone(),
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            url,
            customer_id: config.customer_id.clone(),
            shared_key: config.shared_key.clone(),
            authorizer: Arc::new(UnsignedAuthorizer),
        })
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn headers(
        &self,
        stream_key: &str,
        time_field: &str,
        date: &str,
        content_length: usize,
    ) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("Log-Type", header_value(stream_key)?);
        headers.insert("x-ms-date", header_value(date)?);
        if !time_field.is_empty() {
            headers.insert("time-generated-field", header_value(time_field)?);
        }

        let input = SigningInput {
            customer_id: &self.customer_id,
            shared_key: &self.shared_key,
            method: "POST",
            content_length,
            content_type: "application/json",
            date,
            resource: LOGS_RESOURCE,
        };
        if let Some(authorization) = self.authorizer.authorization(&input) {
            headers.insert(AUTHORIZATION, header_value(&authorization)?);
        }
        Ok(headers)
    }
}

impl Debug for HttpDeliveryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDeliveryClient")
            .field("url", &self.url)
            .field("customer_id", &self.customer_id)
            .field("shared_key", &"<redacted>")
            .field("authorizer", &self.authorizer)
            .finish_non_exhaustive()
    }
}

fn header_value(value: &str) -> Result<HeaderValue, DeliveryError> {
    HeaderValue::from_str(value)
        .map_err(|e| DeliveryError::Payload(format!("invalid header value '{value}': {e}")))
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn post(
        &self,
        stream_key: &str,
        documents: &[Document],
        time_field: &str,
    ) -> Result<DeliveryResponse, DeliveryError> {
        let body = serde_json::to_vec(documents)?;
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let headers = self.headers(stream_key, time_field, &date, body.len())?;

        debug!(
            "POST {} ({} documents, {} bytes) as log type {stream_key}",
            self.url,
            documents.len(),
            body.len()
        );
        let resp = self
            .client
            .post(&self.url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        // Don't read response body unless needed
        let body = if status.is_success() {
            String::new()
        } else {
            resp.text().await.unwrap_or_default()
        };
        Ok(DeliveryResponse { status, body })
    }
}
