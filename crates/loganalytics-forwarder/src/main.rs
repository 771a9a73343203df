// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use loganalytics_output::{
    config::{DeliveryMode, OutputConfig},
    output::LogAnalyticsOutput,
    projector::Record,
};

const DEFAULT_GROUP_SIZE: usize = 125;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LA_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let filter = match EnvFilter::try_new(&env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level '{log_level}': {e}");
            EnvFilter::new("info")
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set tracing subscriber: {e}");
    }

    debug!("Logging subsystem enabled");

    let config = match OutputConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}. Shutting down forwarder.");
            return;
        }
    };
    let group_size = env::var("LA_GROUP_SIZE")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .filter(|size| *size > 0)
        .unwrap_or(DEFAULT_GROUP_SIZE);
    let mode = config.delivery_mode;

    let output = match LogAnalyticsOutput::register(config) {
        Ok(output) => output,
        Err(e) => {
            error!("Unable to start Log Analytics output: {e}. Shutting down forwarder.");
            return;
        }
    };

    info!("Forwarding JSON records from stdin in {mode:?} mode");

    let mut lines = BufReader::new(io::stdin()).lines();
    let mut group: Vec<Record> = Vec::new();
    let mut line_no: u64 = 0;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = &mut interrupt => {
                info!("Received interrupt, shutting down");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("End of input after {line_no} lines");
                break;
            }
            Err(e) => {
                error!("Failed to read stdin: {e}");
                break;
            }
        };
        line_no += 1;

        let Some(record) = parse_record(&line, line_no) else {
            continue;
        };
        match mode {
            DeliveryMode::Windowed => output.receive(&record),
            DeliveryMode::Batch => {
                group.push(record);
                if group.len() >= group_size {
                    output.receive_group(&group).await;
                    group.clear();
                }
            }
        }
    }

    if !group.is_empty() {
        output.receive_group(&group).await;
    }
    if let Err(e) = output.close().await {
        error!("Shutdown incomplete: {e}");
    }
}

fn parse_record(line: &str, line_no: u64) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::Object(record)) => Some(record),
        Ok(_) => {
            warn!("Skipping line {line_no}: not a JSON object");
            None
        }
        Err(e) => {
            warn!("Skipping line {line_no}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_json_objects() {
        let record = parse_record(r#" {"message": "hi", "n": 1} "#, 1).unwrap();
        assert_eq!(record["message"], json!("hi"));
        assert_eq!(record["n"], json!(1));
    }

    #[test]
    fn skips_blank_and_non_object_lines() {
        assert!(parse_record("", 1).is_none());
        assert!(parse_record("   ", 2).is_none());
        assert!(parse_record("[1, 2]", 3).is_none());
        assert!(parse_record("\"text\"", 4).is_none());
        assert!(parse_record("{not json", 5).is_none());
    }
}
