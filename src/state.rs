//! jamproxy/src/state.rs
//! Global state and the shared key/value store behind `Dispatch::set_state`.

use dashmap::{DashMap, mapref::entry::Entry};
use lazy_static::lazy_static;
use serde_json::Value;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use tracing_subscriber::{filter::EnvFilter, reload::Handle as ReloadHandle};

// Global counters
pub static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);
pub static TOTAL_SESSIONS: AtomicU64 = AtomicU64::new(0);
pub static ACTIVE_SESSIONS: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    pub static ref RELOAD_HANDLE: Mutex<Option<ReloadHandle<EnvFilter, tracing_subscriber::Registry>>> =
        Mutex::new(None);
}

pub(crate) fn next_session_id() -> u64 {
    SESSION_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Called with `(key, new_value)` after a write that changed the stored value.
pub type StateObserver = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Flat key/value state shared by every session and plugin.
#[derive(Default)]
pub struct StateStore {
    values: DashMap<String, Value>,
    observers: DashMap<u64, StateObserver>,
    next_observer: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Stores `value` unless it equals the current one. Returns whether anything changed.
    pub fn set(&self, key: &str, value: Value) -> bool {
        let changed = match self.values.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == value {
                    false
                } else {
                    entry.insert(value.clone());
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(value.clone());
                true
            }
        };

        if changed {
            // Snapshot first so observers may touch the store themselves.
            let observers: Vec<StateObserver> =
                self.observers.iter().map(|o| o.value().clone()).collect();
            for observer in observers {
                observer(key, &value);
            }
        }
        changed
    }

    pub fn observe(&self, observer: StateObserver) -> u64 {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, observer);
        id
    }

    pub fn unobserve(&self, id: u64) -> bool {
        self.observers.remove(&id).is_some()
    }

    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
