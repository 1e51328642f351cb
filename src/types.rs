//! jamproxy/src/types.rs
//! Core data structures, type aliases, and constants.

use crate::host::SettingsStore;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fmt, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

// Handles
pub type SessionId = u64;

/// Default loopback port the game client is hardcoded to.
pub const DEFAULT_PORT: u16 = 443;

/// Which leg of a session a message arrived on.
///
/// `Local` messages come from the game client and go upstream by default,
/// `Remote` messages come from the real server and go to the client.
/// `Any` only appears in hook registrations and matches both.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Local,
    Remote,
    Any,
}

impl Direction {
    /// The leg a message from this direction is forwarded to.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Local => Direction::Remote,
            Direction::Remote => Direction::Local,
            Direction::Any => Direction::Any,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Local => "local",
            Direction::Remote => "remote",
            Direction::Any => "any",
        })
    }
}

/// Proxy settings, read from the settings store with camelCase keys.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyOptions {
    pub remote_host: Option<String>,
    /// Overrides the remote port. By default the remote leg mirrors the listener port.
    pub remote_port: Option<u16>,
    pub secure_connection: bool,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Milliseconds.
    pub connection_timeout: u64,
    /// `socks5://[user:pass@]host[:port]`
    pub upstream_proxy: Option<String>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        ProxyOptions {
            remote_host: None,
            remote_port: None,
            secure_connection: false,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            connection_timeout: 10_000,
            upstream_proxy: None,
        }
    }
}

impl ProxyOptions {
    /// Reads each known key from the store on its own. A missing, null or
    /// unusable value falls back to that key's default only.
    pub fn from_settings(settings: &dyn SettingsStore) -> Self {
        let defaults = ProxyOptions::default();
        ProxyOptions {
            remote_host: setting(settings, "remoteHost").or(defaults.remote_host),
            remote_port: setting(settings, "remotePort").or(defaults.remote_port),
            secure_connection: setting(settings, "secureConnection")
                .unwrap_or(defaults.secure_connection),
            auto_reconnect: setting(settings, "autoReconnect").unwrap_or(defaults.auto_reconnect),
            max_reconnect_attempts: setting(settings, "maxReconnectAttempts")
                .unwrap_or(defaults.max_reconnect_attempts),
            connection_timeout: setting(settings, "connectionTimeout")
                .unwrap_or(defaults.connection_timeout),
            upstream_proxy: setting(settings, "upstreamProxy").or(defaults.upstream_proxy),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }
}

fn setting<T: DeserializeOwned>(settings: &dyn SettingsStore, key: &str) -> Option<T> {
    let value = settings.get(key).filter(|v| !v.is_null())?;
    match serde_json::from_value(value) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, "Invalid setting, using the default: {}", e);
            None
        }
    }
}

/// Per-call write options for `send_local` / `send_remote`.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            retries: 0,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Emitted whenever a session's remote leg connects or the session goes away.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub session: SessionId,
    pub connected: bool,
}

// A unified async stream trait so plain TCP, TLS and SOCKS5 streams share one type.
pub trait AsyncStreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStreamTrait for T {}

pub type AsyncStream = dyn AsyncStreamTrait;
