// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered delivery of structured log records to the Log Analytics Data
//! Collector API.
//!
//! ```text
//!   host pipeline ──> FieldProjector ──> BatchAccumulator ──> FlushScheduler
//!                    (per record)       (per stream key)      (count / timer)
//!                                                                   │
//!                                                                   v
//!                               DeliveryClient <── DeliveryDispatcher
//!                               (HTTP POST)        (chunking, outcomes)
//! ```
//!
//! - [`projector`]: key allow-list and type coercion
//! - [`stream_key`]: fixed or `%{field}` templated log types
//! - [`aggregator`]: per-key buffers with an atomic drain
//! - [`scheduler`]: threshold/timer flush triggering, one flush per key at a time
//! - [`dispatcher`]: chunked delivery with per-chunk outcomes
//! - [`client`]: delivery client trait and the HTTP implementation
//! - [`output`]: register / receive / close lifecycle

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod client;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod errors;
pub mod output;
pub mod projector;
pub mod scheduler;
pub mod stream_key;
