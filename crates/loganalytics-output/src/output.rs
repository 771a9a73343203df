// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The output instance driven by the host pipeline.
//!
//! Lifecycle: [`LogAnalyticsOutput::register`] validates the configuration,
//! builds the delivery client and, in windowed mode, starts the flush
//! scheduler. Records come in through [`receive`](LogAnalyticsOutput::receive)
//! or [`receive_group`](LogAnalyticsOutput::receive_group).
//! [`close`](LogAnalyticsOutput::close) performs the final flush.
//!
//! Documents that fail delivery are logged and dropped. There is no
//! dead-letter output.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::BatchAccumulator;
use crate::client::{DeliveryClient, HttpDeliveryClient};
use crate::config::{DeliveryMode, OutputConfig};
use crate::dispatcher::{DeliveryDispatcher, DeliveryOutcome};
use crate::errors::{ConfigError, ShutdownError};
use crate::projector::{FieldProjector, Record};
use crate::scheduler::{FlushScheduler, FlushSignal};
use crate::stream_key::StreamKeyTemplate;

pub struct LogAnalyticsOutput {
    config: Arc<OutputConfig>,
    projector: FieldProjector,
    stream_key: StreamKeyTemplate,
    accumulator: Arc<BatchAccumulator>,
    scheduler: FlushScheduler,
    signal_tx: Option<mpsc::UnboundedSender<FlushSignal>>,
    cancel_token: CancellationToken,
    scheduler_task: TokioMutex<Option<JoinHandle<()>>>,
}

impl LogAnalyticsOutput {
    /// Validates `config` and starts an output that ships over HTTP.
    ///
    /// In windowed mode this spawns the flush scheduler, so it must be called
    /// from within a Tokio runtime.
    pub fn register(config: OutputConfig) -> Result<Self, ConfigError> {
        let client = HttpDeliveryClient::new(&config)?;
        Self::register_with_client(config, Arc::new(client))
    }

    /// Same as [`register`](Self::register) with a caller-provided delivery client.
    pub fn register_with_client(
        config: OutputConfig,
        client: Arc<dyn DeliveryClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let projector = config.field_projector()?;
        let stream_key = config.stream_key_template()?;
        let config = Arc::new(config);

        let accumulator = Arc::new(BatchAccumulator::new(config.flush_items));
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            client,
            config.max_batch_items,
            config.time_generated_field.clone(),
        ));
        let scheduler = FlushScheduler::new(Arc::clone(&accumulator), dispatcher);
        let cancel_token = CancellationToken::new();

        let (signal_tx, scheduler_task) = match config.delivery_mode {
            DeliveryMode::Windowed => {
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(scheduler.clone().run(
                    config.flush_interval(),
                    rx,
                    cancel_token.clone(),
                ));
                (Some(tx), Some(task))
            }
            DeliveryMode::Batch => (None, None),
        };

        info!(
            "Log Analytics output registered: log type '{}', {:?} mode",
            config.log_type, config.delivery_mode
        );

        Ok(Self {
            config,
            projector,
            stream_key,
            accumulator,
            scheduler,
            signal_tx,
            cancel_token,
            scheduler_task: TokioMutex::new(scheduler_task),
        })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Number of documents buffered and not yet flushed.
    pub fn pending(&self) -> usize {
        self.accumulator.total_len()
    }

    /// Buffers one record. Never blocks on delivery.
    ///
    /// In windowed mode the scheduler is told about new batches and reached
    /// thresholds. In batch mode the record waits for [`flush`](Self::flush)
    /// or [`close`](Self::close).
    ///
    /// Hosts should stop calling this before [`close`](Self::close). A record
    /// that races with `close` is picked up by its last pass over the buffer
    /// if it lands in time, otherwise it is reported as unflushed.
    pub fn receive(&self, record: &Record) {
        if self.cancel_token.is_cancelled() {
            warn!("Dropping record received after close");
            return;
        }
        let Some(stream_key) = self.stream_key.resolve(record) else {
            return;
        };
        let document = self.projector.project(record);
        let outcome = self.accumulator.add(&stream_key, document);

        if self.cancel_token.is_cancelled() {
            warn!("Record for log type {stream_key} buffered while closing");
            return;
        }
        let Some(tx) = &self.signal_tx else {
            return;
        };
        if let Some(signal) = FlushSignal::after_add(&stream_key, outcome) {
            if tx.send(signal).is_err() {
                error!("Flush scheduler is gone, buffered records will wait for close");
            }
        }
    }

    /// Processes one externally delimited group of records.
    ///
    /// In batch mode the group is projected, split by stream key and each
    /// key is dispatched once before this returns. In windowed mode the
    /// records are simply buffered and an empty result is returned.
    pub async fn receive_group(&self, records: &[Record]) -> Vec<DeliveryOutcome> {
        if self.config.delivery_mode == DeliveryMode::Windowed {
            for record in records {
                self.receive(record);
            }
            return Vec::new();
        }
        if self.cancel_token.is_cancelled() {
            warn!("Dropping {} records received after close", records.len());
            return Vec::new();
        }

        let flush_guid = Uuid::new_v4();
        debug!(
            "Start receive: {flush_guid}. Received {} events",
            records.len()
        );

        let group = BatchAccumulator::new(usize::MAX);
        for record in records {
            if let Some(stream_key) = self.stream_key.resolve(record) {
                group.add(&stream_key, self.projector.project(record));
            }
        }

        let batches = group.drain_all();
        if batches.is_empty() {
            debug!("No documents in batch. Skipping");
            return Vec::new();
        }

        let outcomes = self.scheduler.dispatch_batches(batches).await;
        debug!("End receive: {flush_guid}");
        outcomes
    }

    /// Flushes everything currently buffered.
    pub async fn flush(&self) -> Vec<DeliveryOutcome> {
        self.scheduler.flush_all().await
    }

    /// Stops the scheduler and flushes what is left, bounded by the
    /// configured shutdown timeout. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), ShutdownError> {
        let timeout = self.config.shutdown_timeout();
        self.cancel_token.cancel();

        let task = self.scheduler_task.lock().await.take();
        let shutdown = async {
            if let Some(task) = task {
                // the scheduler performs the final flush when cancelled
                task.await.map_err(|e| ShutdownError::Task(e.to_string()))?;
            }
            // batch mode buffer, or records that raced with cancellation
            if !self.accumulator.is_empty() {
                self.scheduler.flush_all().await;
            }
            Ok::<(), ShutdownError>(())
        };
        let result = match tokio::time::timeout(timeout, shutdown).await {
            Ok(result) => result,
            Err(_) => Err(ShutdownError::Timeout(timeout)),
        };

        match &result {
            Ok(()) if !self.accumulator.is_empty() => warn!(
                "Log Analytics output closed, {} documents buffered during close were not flushed",
                self.accumulator.total_len()
            ),
            Ok(()) => debug!("Log Analytics output closed"),
            Err(e) => error!(
                "Log Analytics output closed with {} documents unflushed: {e}",
                self.accumulator.total_len()
            ),
        }
        result
    }
}

impl Drop for LogAnalyticsOutput {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeliveryResponse;
    use crate::errors::DeliveryError;
    use crate::projector::Document;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<(String, Vec<Document>)>>,
    }

    #[async_trait]
    impl DeliveryClient for RecordingClient {
        async fn post(
            &self,
            stream_key: &str,
            documents: &[Document],
            _time_field: &str,
        ) -> Result<DeliveryResponse, DeliveryError> {
            self.calls
                .lock()
                .unwrap()
                .push((stream_key.to_string(), documents.to_vec()));
            Ok(DeliveryResponse::new(StatusCode::OK))
        }
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn config(mode: DeliveryMode) -> OutputConfig {
        OutputConfig {
            customer_id: "workspace".to_string(),
            shared_key: "key".to_string(),
            log_type: "Logs".to_string(),
            delivery_mode: mode,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_config() {
        let client = Arc::new(RecordingClient::default());
        let mut bad = config(DeliveryMode::Batch);
        bad.key_types.insert("a".to_string(), "uuid".to_string());
        assert!(LogAnalyticsOutput::register_with_client(bad, client).is_err());
    }

    #[tokio::test]
    async fn test_receive_drops_empty_documents() {
        let client = Arc::new(RecordingClient::default());
        let mut cfg = config(DeliveryMode::Windowed);
        cfg.key_names = vec!["message".to_string()];
        let output = LogAnalyticsOutput::register_with_client(cfg, client.clone()).unwrap();

        output.receive(&record(json!({"other": "x"})));
        assert_eq!(output.pending(), 0);

        output.receive(&record(json!({"message": "hello", "other": "x"})));
        assert_eq!(output.pending(), 1);

        output.close().await.unwrap();
        assert_eq!(
            client.calls.lock().unwrap().clone(),
            vec![(
                "Logs".to_string(),
                vec![record(json!({"message": "hello"}))]
            )]
        );
    }

    #[tokio::test]
    async fn test_batch_mode_receive_waits_for_flush() {
        let client = Arc::new(RecordingClient::default());
        let output =
            LogAnalyticsOutput::register_with_client(config(DeliveryMode::Batch), client.clone())
                .unwrap();

        output.receive(&record(json!({"a": 1})));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.calls.lock().unwrap().is_empty());

        let outcomes = output.flush().await;
        assert_eq!(outcomes, vec![DeliveryOutcome::Delivered(StatusCode::OK)]);
    }

    #[tokio::test]
    async fn test_receive_group_with_no_documents() {
        let client = Arc::new(RecordingClient::default());
        let mut cfg = config(DeliveryMode::Batch);
        cfg.key_names = vec!["missing".to_string()];
        let output = LogAnalyticsOutput::register_with_client(cfg, client.clone()).unwrap();

        let outcomes = output
            .receive_group(&[record(json!({"a": 1})), record(json!({"b": 2}))])
            .await;
        assert!(outcomes.is_empty());
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_reports_config_errors_by_cause() {
        let mut bad_proxy = config(DeliveryMode::Batch);
        bad_proxy.https_proxy = Some("not a url".to_string());
        assert!(matches!(
            LogAnalyticsOutput::register(bad_proxy),
            Err(ConfigError::InvalidValue {
                option: "https_proxy",
                ..
            })
        ));

        let mut bad_log_type = config(DeliveryMode::Batch);
        bad_log_type.log_type = "bad-name".to_string();
        assert!(matches!(
            LogAnalyticsOutput::register(bad_log_type),
            Err(ConfigError::InvalidStreamKey(_))
        ));
    }

    #[tokio::test]
    async fn test_close_flushes_records_buffered_after_final_flush() {
        let client = Arc::new(RecordingClient::default());
        let output = LogAnalyticsOutput::register_with_client(
            config(DeliveryMode::Windowed),
            client.clone(),
        )
        .unwrap();

        output.cancel_token.cancel();
        // the scheduler finishes its own final flush first
        tokio::time::sleep(Duration::from_millis(10)).await;
        output
            .accumulator
            .add("Logs", record(json!({"message": "late"})));
        assert_eq!(output.pending(), 1);

        output.close().await.unwrap();

        assert_eq!(
            client.calls.lock().unwrap().clone(),
            vec![(
                "Logs".to_string(),
                vec![record(json!({"message": "late"}))]
            )]
        );
        assert_eq!(output.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_late_records() {
        let client = Arc::new(RecordingClient::default());
        let output = LogAnalyticsOutput::register_with_client(
            config(DeliveryMode::Windowed),
            client.clone(),
        )
        .unwrap();

        output.close().await.unwrap();
        output.close().await.unwrap();

        output.receive(&record(json!({"a": 1})));
        assert_eq!(output.pending(), 0);
    }
}
