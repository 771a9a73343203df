// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Default ingestion host suffix; the workspace id is prepended as a subdomain.
pub const DEFAULT_ENDPOINT: &str = "ods.opinsights.azure.com";

/// Data Collector API version sent with every request.
pub const API_VERSION: &str = "2016-04-01";

/// Maximum number of documents in one request to the ingestion API.
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 50;

/// Number of buffered documents for one stream key that triggers a flush.
pub const DEFAULT_FLUSH_ITEMS: usize = 50;

pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// The remote API rejects log types longer than this.
pub const MAX_STREAM_KEY_LEN: usize = 100;
