// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-stream-key buffering of projected documents.
//!
//! The accumulator is the only mutable state shared between ingestion and
//! flushing. Producers call [`BatchAccumulator::add`] from any thread; the
//! scheduler calls [`BatchAccumulator::drain`], which atomically takes the
//! whole buffer for one key. A document added after the drain point lands
//! in the next batch, so nothing is lost or handed out twice.
//!
//! Each pending batch remembers when its first document arrived. That
//! instant is what the windowed scheduler measures the maximum age against.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::Instant;
use tracing::debug;

use crate::projector::Document;

/// Documents accumulated for one stream key since its last flush, in arrival order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub stream_key: String,
    pub documents: Vec<Document>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// What [`BatchAccumulator::add`] did with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The document had no fields and was dropped.
    Discarded,
    /// The document started a new batch for its key.
    Opened,
    /// The document joined an existing batch still under the threshold.
    Appended,
    /// The batch now holds at least the flush threshold.
    ThresholdReached,
}

#[derive(Debug)]
struct PendingBatch {
    opened_at: Instant,
    documents: Vec<Document>,
}

#[derive(Debug)]
pub struct BatchAccumulator {
    batches: Mutex<HashMap<String, PendingBatch>>,
    flush_items: usize,
}

impl BatchAccumulator {
    /// `flush_items` is the per-key document count at which [`add`](Self::add)
    /// starts reporting that the key should be flushed.
    pub fn new(flush_items: usize) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            flush_items,
        }
    }

    /// Appends `document` to the batch of `stream_key`. Empty documents are
    /// discarded.
    pub fn add(&self, stream_key: &str, document: Document) -> AddOutcome {
        if document.is_empty() {
            debug!("Skipping document without fields for log type {stream_key}");
            return AddOutcome::Discarded;
        }

        #[allow(clippy::expect_used)]
        let mut batches = self.batches.lock().expect("lock poisoned");
        let batch = batches
            .entry(stream_key.to_string())
            .or_insert_with(|| PendingBatch {
                opened_at: Instant::now(),
                documents: Vec::new(),
            });
        batch.documents.push(document);

        if batch.documents.len() >= self.flush_items {
            AddOutcome::ThresholdReached
        } else if batch.documents.len() == 1 {
            AddOutcome::Opened
        } else {
            AddOutcome::Appended
        }
    }

    pub fn should_flush(&self, stream_key: &str) -> bool {
        self.len(stream_key) >= self.flush_items
    }

    /// Removes and returns everything buffered for `stream_key`.
    /// Returns `None` when there is nothing to flush.
    pub fn drain(&self, stream_key: &str) -> Option<Batch> {
        let pending = {
            #[allow(clippy::expect_used)]
            let mut batches = self.batches.lock().expect("lock poisoned");
            batches.remove(stream_key)?
        };
        if pending.documents.is_empty() {
            return None;
        }
        Some(Batch {
            stream_key: stream_key.to_string(),
            documents: pending.documents,
        })
    }

    /// Drains every non-empty batch.
    pub fn drain_all(&self) -> Vec<Batch> {
        let drained = {
            #[allow(clippy::expect_used)]
            let mut batches = self.batches.lock().expect("lock poisoned");
            std::mem::take(&mut *batches)
        };
        drained
            .into_iter()
            .filter(|(_, pending)| !pending.documents.is_empty())
            .map(|(stream_key, pending)| Batch {
                stream_key,
                documents: pending.documents,
            })
            .collect()
    }

    /// Keys that currently hold at least one document.
    pub fn stream_keys(&self) -> Vec<String> {
        #[allow(clippy::expect_used)]
        let batches = self.batches.lock().expect("lock poisoned");
        batches
            .iter()
            .filter(|(_, pending)| !pending.documents.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys holding data together with the instant their batch was opened.
    pub fn opened_at(&self) -> Vec<(String, Instant)> {
        #[allow(clippy::expect_used)]
        let batches = self.batches.lock().expect("lock poisoned");
        batches
            .iter()
            .filter(|(_, pending)| !pending.documents.is_empty())
            .map(|(key, pending)| (key.clone(), pending.opened_at))
            .collect()
    }

    pub fn len(&self, stream_key: &str) -> usize {
        #[allow(clippy::expect_used)]
        let batches = self.batches.lock().expect("lock poisoned");
        batches.get(stream_key).map_or(0, |pending| pending.documents.len())
    }

    pub fn total_len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let batches = self.batches.lock().expect("lock poisoned");
        batches.values().map(|pending| pending.documents.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn flush_items(&self) -> usize {
        self.flush_items
    }
}
