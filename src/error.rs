//! jamproxy/src/error.rs
//! Error types for the proxy core.

use std::time::Duration;
use thiserror::Error;

/// Transport and session failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("listener is already bound to {0}")]
    AlreadyBound(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("socks5 error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("invalid upstream proxy url: {0}")]
    InvalidProxyUrl(String),

    #[error("remote host is not configured")]
    NoRemoteHost,

    #[error("{0} socket is not connected")]
    NotConnected(&'static str),

    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("session is closed")]
    Closed,
}

impl ProxyError {
    /// Whether retrying the same connect could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ProxyError::NoRemoteHost
                | ProxyError::InvalidProxyUrl(_)
                | ProxyError::Closed
                | ProxyError::AlreadyBound(_)
        )
    }
}

/// A frame that looked like a known format but failed to parse.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid xml: {0}")]
    Xml(String),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty xml document")]
    EmptyXml,
}

/// Plugin load failures. Each one skips a single plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to read manifest {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("plugin {0} is already loaded")]
    Duplicate(String),

    #[error("no entry registered for {main} (plugin {name})")]
    UnknownEntry { name: String, main: String },

    #[error("dependencies of {name} are not installed: {reason}")]
    Dependencies { name: String, reason: String },

    #[error("plugin {name} failed to start: {reason}")]
    Instantiate { name: String, reason: String },
}

/// Console command registry failures.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command {0} is already registered")]
    Duplicate(String),

    #[error("unknown command {0}")]
    Unknown(String),

    #[error("command {name} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
