// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chunked delivery of a flushed batch.
//!
//! Every chunk is attempted exactly once. A rejected or failed chunk is logged
//! with its content and dropped; the remaining chunks are still sent. Nothing
//! is re-buffered, so delivery is at-most-once.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, error};

use crate::aggregator::Batch;
use crate::client::DeliveryClient;
use crate::projector::Document;

/// Result of delivering one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The remote API accepted the chunk.
    Delivered(StatusCode),
    /// The remote API answered with a non-success status.
    Rejected(StatusCode),
    /// No usable response: transport failure or unserializable payload.
    TransportError(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }
}

/// Splits `documents` into ordered chunks of at most `max_items`.
pub fn split_into_chunks(
    documents: &[Document],
    max_items: usize,
) -> std::slice::Chunks<'_, Document> {
    documents.chunks(max_items.max(1))
}

pub struct DeliveryDispatcher {
    client: Arc<dyn DeliveryClient>,
    max_batch_items: usize,
    time_field: String,
}

impl DeliveryDispatcher {
    pub fn new(
        client: Arc<dyn DeliveryClient>,
        max_batch_items: usize,
        time_field: String,
    ) -> Self {
        Self {
            client,
            max_batch_items: max_batch_items.max(1),
            time_field,
        }
    }

    /// Delivers `batch` chunk by chunk, in order. Returns one outcome per chunk.
    pub async fn dispatch(&self, batch: &Batch) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();
        for chunk in split_into_chunks(&batch.documents, self.max_batch_items) {
            outcomes.push(self.deliver_chunk(&batch.stream_key, chunk).await);
        }
        outcomes
    }

    async fn deliver_chunk(&self, stream_key: &str, chunk: &[Document]) -> DeliveryOutcome {
        debug!(
            "Posting log batch (log count: {}) as log type {stream_key}. First log: {}",
            chunk.len(),
            chunk
                .first()
                .map(|d| serde_json::to_string(d).unwrap_or_default())
                .unwrap_or_default()
        );

        match self.client.post(stream_key, chunk, &self.time_field).await {
            Ok(resp) if self.client.is_success(&resp) => {
                debug!(
                    "Successfully posted logs as log type {stream_key} with result code {}",
                    resp.status.as_u16()
                );
                DeliveryOutcome::Delivered(resp.status)
            }
            Ok(resp) => {
                error!(
                    "Request failure (log type {stream_key}): error code: {}, body: {}, data=>{}",
                    resp.status.as_u16(),
                    resp.body,
                    chunk_json(chunk)
                );
                DeliveryOutcome::Rejected(resp.status)
            }
            Err(e) => {
                error!(
                    "Exception occurred in posting as log type {stream_key}: '{e}', data=>{}",
                    chunk_json(chunk)
                );
                DeliveryOutcome::TransportError(e.to_string())
            }
        }
    }
}

fn chunk_json(chunk: &[Document]) -> String {
    serde_json::to_string(chunk).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeliveryResponse;
    use crate::errors::DeliveryError;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn doc(i: usize) -> Document {
        let mut d = Document::new();
        d.insert("seq".to_string(), json!(i));
        d
    }

    fn batch(key: &str, n: usize) -> Batch {
        Batch {
            stream_key: key.to_string(),
            documents: (0..n).map(doc).collect(),
        }
    }

    /// Replies with the scripted results in order, then 200.
    struct ScriptedClient {
        script: Mutex<Vec<Result<DeliveryResponse, DeliveryError>>>,
        calls: Mutex<Vec<(String, Vec<Document>, String)>>,
    }

    impl ScriptedClient {
        fn new(mut script: Vec<Result<DeliveryResponse, DeliveryError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DeliveryClient for ScriptedClient {
        async fn post(
            &self,
            stream_key: &str,
            documents: &[Document],
            time_field: &str,
        ) -> Result<DeliveryResponse, DeliveryError> {
            self.calls.lock().unwrap().push((
                stream_key.to_string(),
                documents.to_vec(),
                time_field.to_string(),
            ));
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(DeliveryResponse::new(StatusCode::OK)))
        }
    }

    #[tokio::test]
    async fn test_dispatch_splits_into_chunks() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let dispatcher = DeliveryDispatcher::new(client.clone(), 2, "eventtime".to_string());

        let outcomes = dispatcher.dispatch(&batch("X", 5)).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(DeliveryOutcome::is_delivered));
        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, vec![doc(0), doc(1)]);
        assert_eq!(calls[1].1, vec![doc(2), doc(3)]);
        assert_eq!(calls[2].1, vec![doc(4)]);
        assert!(calls.iter().all(|(k, _, t)| k == "X" && t == "eventtime"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rejected_chunk_does_not_stop_siblings() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(DeliveryResponse {
            status: StatusCode::FORBIDDEN,
            body: "bad signature".to_string(),
        })]));
        let dispatcher = DeliveryDispatcher::new(client.clone(), 1, String::new());

        let outcomes = dispatcher.dispatch(&batch("X", 2)).await;

        assert_eq!(
            outcomes,
            vec![
                DeliveryOutcome::Rejected(StatusCode::FORBIDDEN),
                DeliveryOutcome::Delivered(StatusCode::OK),
            ]
        );
        assert_eq!(client.calls.lock().unwrap().len(), 2);
        assert!(logs_contain("error code: 403"));
        assert!(logs_contain(r#"data=>[{"seq":0}]"#));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transport_error_does_not_stop_siblings() {
        let client = Arc::new(ScriptedClient::new(vec![Err(DeliveryError::Transport(
            "connection reset".to_string(),
        ))]));
        let dispatcher = DeliveryDispatcher::new(client.clone(), 1, String::new());

        let outcomes = dispatcher.dispatch(&batch("X", 2)).await;

        assert_eq!(
            outcomes[0],
            DeliveryOutcome::TransportError("transport error: connection reset".to_string())
        );
        assert!(outcomes[1].is_delivered());
        assert!(logs_contain("connection reset"));
    }

    #[tokio::test]
    async fn test_dispatch_empty_batch_sends_nothing() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let dispatcher = DeliveryDispatcher::new(client.clone(), 10, String::new());
        assert!(dispatcher.dispatch(&batch("X", 0)).await.is_empty());
        assert!(client.calls.lock().unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_chunks_partition_batch(n in 0usize..200, max in 1usize..60) {
            let documents: Vec<Document> = (0..n).map(doc).collect();
            let chunks: Vec<&[Document]> = split_into_chunks(&documents, max).collect();

            prop_assert_eq!(chunks.len(), n.div_ceil(max));
            prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= max));
            let rebuilt: Vec<Document> = chunks.concat();
            prop_assert_eq!(rebuilt, documents);
        }
    }
}
