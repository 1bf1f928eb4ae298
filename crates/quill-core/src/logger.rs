use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quill_types::EventType;

use crate::event_bus::{Channel, EventBroker};

const MAX_ENTRIES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// In-process log feed for presentation layers. Each entry is kept in a
/// bounded history, mirrored to `tracing`, and published to subscribers.
#[derive(Clone, Default)]
pub struct Logger {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    broker: EventBroker<LogEntry>,
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Channel<LogEntry> {
        self.broker.subscribe()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn debug(&self, text: impl Into<String>) {
        self.log(LogLevel::Debug, text.into());
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(LogLevel::Info, text.into());
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.log(LogLevel::Warn, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(LogLevel::Error, text.into());
    }

    fn log(&self, level: LogLevel, text: String) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "quill.log", "{text}"),
            LogLevel::Info => tracing::info!(target: "quill.log", "{text}"),
            LogLevel::Warn => tracing::warn!(target: "quill.log", "{text}"),
            LogLevel::Error => tracing::error!(target: "quill.log", "{text}"),
        }
        let entry = LogEntry {
            level,
            text,
            created_at: Utc::now(),
        };
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() >= MAX_ENTRIES {
                entries.remove(0);
            }
            entries.push(entry.clone());
        }
        self.broker.publish(EventType::Created, entry);
    }
}
