//! jamproxy/src/logging.rs
//! Logging initialization, runtime level updates, and the tracing-backed console.

use crate::host::{ConsoleLevel, ConsoleMessage, ConsoleSink};
use crate::state::RELOAD_HANDLE;
use std::sync::Once;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt, reload::Layer as ReloadLayer};

static LOG_INIT: Once = Once::new();

// Initialize logging once
pub fn init_logging(default: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let (reload_layer, handle) = ReloadLayer::new(filter);
        let subscriber = tracing_subscriber::registry()
            .with(reload_layer)
            .with(fmt::layer());
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            if let Ok(mut slot) = RELOAD_HANDLE.lock() {
                *slot = Some(handle);
            }
        }
    });
}

/// Swap the active filter. Returns false if logging was never initialized here.
pub fn set_log_level(level: &str) -> bool {
    let Ok(slot) = RELOAD_HANDLE.lock() else {
        return false;
    };
    match slot.as_ref() {
        Some(handle) => handle.reload(EnvFilter::new(level)).is_ok(),
        None => false,
    }
}

/// Console that writes through `tracing`. Used when no UI console is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsole;

impl ConsoleSink for TracingConsole {
    fn message(&self, message: ConsoleMessage) {
        match message.level {
            ConsoleLevel::Error => error!(target: "console", "{}", message.message),
            ConsoleLevel::Warn => warn!(target: "console", "{}", message.message),
            ConsoleLevel::Notify | ConsoleLevel::Success => {
                info!(target: "console", "{}", message.message)
            }
        }
    }
}
