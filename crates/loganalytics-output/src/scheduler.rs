// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flush triggering and serialization.
//!
//! In windowed mode two signal sources feed one flush decision:
//!
//! ```text
//!   add() ──threshold reached──> channel ──┐
//!                                          ├──> flush(key) ──> drain ──> dispatch
//!   batch age >= interval ─────────────────┘
//! ```
//!
//! The time bound is per stream key. A batch is flushed at the latest
//! `flush_interval` after its first document arrived; draining a batch
//! restarts that key's clock, so one busy key never delays another.
//!
//! At most one flush per stream key runs at a time. A trigger that arrives
//! while that key is already flushing is suppressed, not queued: the running
//! flush has drained the batch and anything added since is picked up by the
//! next trigger.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::aggregator::{AddOutcome, Batch, BatchAccumulator};
use crate::dispatcher::{DeliveryDispatcher, DeliveryOutcome};

/// Wakeups sent from the ingestion path to the windowed scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushSignal {
    /// A new batch started; its age deadline has to be taken into account.
    BatchOpened(String),
    /// The batch reached the flush threshold.
    ThresholdReached(String),
}

impl FlushSignal {
    /// The signal the scheduler needs after an `add`, if any.
    pub fn after_add(stream_key: &str, outcome: AddOutcome) -> Option<Self> {
        match outcome {
            AddOutcome::Opened => Some(FlushSignal::BatchOpened(stream_key.to_string())),
            AddOutcome::ThresholdReached => {
                Some(FlushSignal::ThresholdReached(stream_key.to_string()))
            }
            AddOutcome::Appended | AddOutcome::Discarded => None,
        }
    }
}

/// Removes its key from the in-flight set when dropped.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    stream_key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        #[allow(clippy::expect_used)]
        let mut in_flight = self.in_flight.lock().expect("lock poisoned");
        in_flight.remove(&self.stream_key);
    }
}

#[derive(Clone)]
pub struct FlushScheduler {
    accumulator: Arc<BatchAccumulator>,
    dispatcher: Arc<DeliveryDispatcher>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl FlushScheduler {
    pub fn new(accumulator: Arc<BatchAccumulator>, dispatcher: Arc<DeliveryDispatcher>) -> Self {
        Self {
            accumulator,
            dispatcher,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn try_begin(&self, stream_key: &str) -> Option<InFlightGuard> {
        #[allow(clippy::expect_used)]
        let mut in_flight = self.in_flight.lock().expect("lock poisoned");
        if !in_flight.insert(stream_key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            stream_key: stream_key.to_string(),
        })
    }

    fn is_in_flight(&self, stream_key: &str) -> bool {
        #[allow(clippy::expect_used)]
        let in_flight = self.in_flight.lock().expect("lock poisoned");
        in_flight.contains(stream_key)
    }

    /// Drains and dispatches the batch of `stream_key`.
    ///
    /// Returns `None` when the flush was suppressed because another flush of
    /// the same key is running, or when there was nothing to send.
    pub async fn flush_key(&self, stream_key: &str) -> Option<Vec<DeliveryOutcome>> {
        let Some(guard) = self.try_begin(stream_key) else {
            debug!("Flush of log type {stream_key} already in progress, skipping");
            return None;
        };
        self.flush_claimed(guard).await
    }

    async fn flush_claimed(&self, guard: InFlightGuard) -> Option<Vec<DeliveryOutcome>> {
        let batch = self.accumulator.drain(&guard.stream_key)?;
        Some(self.dispatch_batch(batch).await)
    }

    /// Flushes every key that holds data. Keys are dispatched concurrently.
    pub async fn flush_all(&self) -> Vec<DeliveryOutcome> {
        let keys = self.accumulator.stream_keys();
        let results = join_all(keys.iter().map(|key| self.flush_key(key))).await;
        results.into_iter().flatten().flatten().collect()
    }

    /// Dispatches batches that were accumulated outside the shared buffer,
    /// one concurrent dispatch per batch.
    pub async fn dispatch_batches(&self, batches: Vec<Batch>) -> Vec<DeliveryOutcome> {
        let results = join_all(batches.into_iter().map(|batch| self.dispatch_batch(batch))).await;
        results.into_iter().flatten().collect()
    }

    async fn dispatch_batch(&self, batch: Batch) -> Vec<DeliveryOutcome> {
        let flush_id = Uuid::new_v4();
        debug!(
            "Start flush {flush_id}: {} documents as log type {}",
            batch.len(),
            batch.stream_key
        );
        let outcomes = self.dispatcher.dispatch(&batch).await;
        let failed = outcomes.iter().filter(|o| !o.is_delivered()).count();
        debug!(
            "End flush {flush_id}: {} chunks, {failed} failed",
            outcomes.len()
        );
        outcomes
    }

    /// Earliest instant at which a batch that is not already flushing
    /// reaches `max_age`.
    fn next_deadline(&self, max_age: Duration) -> Option<Instant> {
        self.accumulator
            .opened_at()
            .into_iter()
            .filter(|(stream_key, _)| !self.is_in_flight(stream_key))
            .map(|(_, opened_at)| opened_at + max_age)
            .min()
    }

    /// Keys whose batch is at least `max_age` old at `now`.
    fn expired_keys(&self, max_age: Duration, now: Instant) -> Vec<String> {
        self.accumulator
            .opened_at()
            .into_iter()
            .filter(|(_, opened_at)| *opened_at + max_age <= now)
            .map(|(stream_key, _)| stream_key)
            .collect()
    }

    /// Claims `stream_key` before spawning so the run loop never sees it as
    /// idle while the task has not started yet.
    fn spawn_flush(&self, tasks: &mut JoinSet<()>, stream_key: &str) {
        let Some(guard) = self.try_begin(stream_key) else {
            debug!("Flush of log type {stream_key} already in progress, skipping");
            return;
        };
        let scheduler = self.clone();
        tasks.spawn(async move {
            scheduler.flush_claimed(guard).await;
        });
    }

    /// Runs the windowed flush loop until `cancel_token` fires, then waits for
    /// in-flight flushes and performs a final flush of everything buffered.
    pub async fn run(
        self,
        flush_interval: Duration,
        mut signals: mpsc::UnboundedReceiver<FlushSignal>,
        cancel_token: CancellationToken,
    ) {
        debug!("Flush scheduler started with interval {flush_interval:?}");

        let mut tasks = JoinSet::new();

        loop {
            let deadline = self.next_deadline(flush_interval);
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => {
                    debug!("Flush scheduler received shutdown signal");
                    break;
                }
                () = wait_until(deadline) => {
                    for stream_key in self.expired_keys(flush_interval, Instant::now()) {
                        self.spawn_flush(&mut tasks, &stream_key);
                    }
                }
                Some(signal) = signals.recv() => {
                    // a new batch only needs the deadline recomputed
                    if let FlushSignal::ThresholdReached(stream_key) = signal {
                        self.spawn_flush(&mut tasks, &stream_key);
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!("Flush task failed: {e}");
                    }
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Flush task failed: {e}");
            }
        }
        let outcomes = self.flush_all().await;
        debug!(
            "Flush scheduler stopped after final flush of {} chunks",
            outcomes.len()
        );
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
