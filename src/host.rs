//! jamproxy/src/host.rs
//! Interfaces the core calls out to: the console and the settings store.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a console message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Notify,
    Success,
    Warn,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsoleMessage {
    #[serde(rename = "type")]
    pub level: ConsoleLevel,
    pub message: String,
}

impl ConsoleMessage {
    pub fn new(level: ConsoleLevel, message: impl Into<String>) -> Self {
        ConsoleMessage {
            level,
            message: message.into(),
        }
    }
}

/// Every user-visible failure ends up here.
pub trait ConsoleSink: Send + Sync {
    fn message(&self, message: ConsoleMessage);

    fn notify(&self, message: &str) {
        self.message(ConsoleMessage::new(ConsoleLevel::Notify, message));
    }

    fn warn(&self, message: &str) {
        self.message(ConsoleMessage::new(ConsoleLevel::Warn, message));
    }

    fn error(&self, message: &str) {
        self.message(ConsoleMessage::new(ConsoleLevel::Error, message));
    }
}

/// Flat key/value settings owned by the host application.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn update(&self, key: &str, value: Value);
}

/// In-memory settings. The host persists them however it likes.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: DashMap<String, Value>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store from a JSON object. Non-object values yield an empty store.
    pub fn from_json(value: Value) -> Self {
        let store = Self::new();
        if let Value::Object(map) = value {
            for (key, value) in map {
                store.values.insert(key, value);
            }
        }
        store
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn update(&self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}
