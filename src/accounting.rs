//! Accounting sink: one record per bridge that reached the scheduler.

use serde_json::{Map, Value};
use std::sync::Mutex;
use tracing::{info, warn};

/// Interface the engine emits completed-bridge records through.
pub trait AccountingSink: Send + Sync {
    fn emit(&self, record: &Map<String, Value>);
}

/// Serializes each record to a single log line. When the record carries an
/// `Error`, the message is appended after the JSON the way the daily log
/// format expects it.
pub struct LogSink;

impl AccountingSink for LogSink {
    fn emit(&self, record: &Map<String, Value>) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialize accounting record");
                return;
            }
        };
        match record.get("Error").and_then(Value::as_str) {
            Some(error) if !error.is_empty() => {
                info!(target: "accounting", "{line}:  {error}");
            }
            _ => info!(target: "accounting", "{line}"),
        }
    }
}

/// Retains records in memory; used by embedders and tests to observe
/// accounting without a log pipeline.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Map<String, Value>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AccountingSink for MemorySink {
    fn emit(&self, record: &Map<String, Value>) {
        self.records.lock().unwrap().push(record.clone());
    }
}
