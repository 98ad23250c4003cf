use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Entries kept per unit by [`MemoryLogSink`].
pub const LOG_CAPACITY: usize = 100;

const LOG_TARGET: &str = "updraft";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub unit_id: String,
    pub level: LogLevel,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only destination for pipeline activity.
pub trait LogSink: Send + Sync {
    fn record(&self, entry: LogEntry);
}

/// In-memory sink retaining the most recent [`LOG_CAPACITY`] entries per unit.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl MemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries for `unit_id`, oldest first.
    #[must_use]
    pub fn entries(&self, unit_id: &str) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(unit_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, unit_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(unit_id);
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, entry: LogEntry) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let unit_entries = entries.entry(entry.unit_id.clone()).or_default();
        while unit_entries.len() >= LOG_CAPACITY {
            unit_entries.pop_front();
        }
        unit_entries.push_back(entry);
    }
}

/// Per-unit writer: always forwards to the `log` facade, and to the sink when
/// logging is enabled for the unit.
#[derive(Clone)]
pub struct UnitLog {
    unit_id: String,
    sink: Option<Arc<dyn LogSink>>,
    clock: Arc<dyn Clock>,
}

impl UnitLog {
    pub fn new(unit_id: &str, sink: Option<Arc<dyn LogSink>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            sink,
            clock,
        }
    }

    pub fn write(&self, level: LogLevel, message: &str, context: &[(&str, String)]) {
        log::log!(target: LOG_TARGET, log::Level::from(level), "[{}] {message}", self.unit_id);

        if let Some(sink) = &self.sink {
            sink.record(LogEntry {
                unit_id: self.unit_id.clone(),
                level,
                message: message.to_string(),
                context: context
                    .iter()
                    .map(|(key, value)| ((*key).to_string(), value.clone()))
                    .collect(),
                timestamp: self.clock.now(),
            });
        }
    }

    pub fn info(&self, message: &str, context: &[(&str, String)]) {
        self.write(LogLevel::Info, message, context);
    }

    pub fn warning(&self, message: &str, context: &[(&str, String)]) {
        self.write(LogLevel::Warning, message, context);
    }

    pub fn error(&self, message: &str, context: &[(&str, String)]) {
        self.write(LogLevel::Error, message, context);
    }

    pub fn debug(&self, message: &str, context: &[(&str, String)]) {
        self.write(LogLevel::Debug, message, context);
    }
}
