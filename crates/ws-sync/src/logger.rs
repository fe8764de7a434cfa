//! Structured in-memory execution log.
//!
//! The engine accumulates entries while it runs and persists the whole list
//! as JSON on the execution row. Entries mirror to `tracing` as they land so
//! live logs and the stored trail stay consistent.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

/// Thread-safe accumulator shared by the engine and its helpers.
#[derive(Default)]
pub struct ExecutionLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, message: impl Into<String>, context: serde_json::Value) {
        let message = message.into();
        info!(target: "ws_sync::execution", "{message}");
        self.push(LogLevel::Info, message, context);
    }

    pub fn warn(&self, message: impl Into<String>, context: serde_json::Value) {
        let message = message.into();
        warn!(target: "ws_sync::execution", "{message}");
        self.push(LogLevel::Warn, message, context);
    }

    pub fn error(&self, message: impl Into<String>, context: serde_json::Value) {
        let message = message.into();
        error!(target: "ws_sync::execution", "{message}");
        self.push(LogLevel::Error, message, context);
    }

    fn push(&self, level: LogLevel, message: String, context: serde_json::Value) {
        let mut entries = self.entries.lock().expect("execution log lock poisoned");
        entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
            context,
        });
    }

    /// Drop accumulated entries; called at the start of each execution so a
    /// reused engine does not leak logs across runs.
    pub fn clear(&self) {
        self.entries.lock().expect("execution log lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("execution log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the entries as the JSON array stored on the execution row.
    pub fn to_json(&self) -> serde_json::Value {
        let entries = self.entries.lock().expect("execution log lock poisoned");
        serde_json::to_value(&*entries).unwrap_or_else(|_| serde_json::Value::Array(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_accumulate_in_order() {
        let log = ExecutionLog::new();
        log.info("starting", serde_json::json!({"items": 3}));
        log.warn("one skipped", serde_json::Value::Null);
        log.error("one failed", serde_json::json!({"id": "A-9"}));

        let json = log.to_json();
        let arr = json.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[0]["level"], "info");
        assert_eq!(arr[0]["message"], "starting");
        assert_eq!(arr[0]["context"]["items"], 3);
        assert_eq!(arr[2]["level"], "error");
    }

    #[test]
    fn null_context_is_not_serialized() {
        let log = ExecutionLog::new();
        log.warn("no context", serde_json::Value::Null);
        let json = log.to_json();
        assert!(json[0].get("context").is_none());
    }
}
