//! jamproxy/src/lib.rs
//! Loopback intercepting proxy for a legacy game client, with plugin hooks on every message.
//!
//! The client connects to a [`Listener`] on localhost. Each client gets a
//! [`Session`] that opens the real server connection, splits both byte streams
//! into null-terminated frames, runs them through the [`Dispatch`] hooks, and
//! forwards whatever the hooks leave sendable.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod listener;
pub mod logging;
pub mod message;
pub mod plugin;
pub mod protocol;
pub mod state;
pub mod types;

pub use connection::{Outgoing, Session, SessionState, reconnect_delay};
pub use dispatch::{ANY_TYPE, CommandContext, Dispatch, HookContext, HookId, IntervalId};
pub use error::{CommandError, PluginError, ProtocolError, ProxyError, Result};
pub use host::{ConsoleLevel, ConsoleMessage, ConsoleSink, MemorySettings, SettingsStore};
pub use listener::{Listener, MetricsSnapshot};
pub use logging::{TracingConsole, init_logging, set_log_level};
pub use message::{Format, LoginParams, Message, Payload};
pub use plugin::{
    DirectoryPlugins, GamePlugin, LoadReport, LoadedPlugin, PluginContext, PluginFilesystem,
    PluginKind, PluginManifest, PluginRegistry,
};
pub use protocol::{FrameSplitter, NullDelimitedCodec};
pub use types::{ConnectionEvent, DEFAULT_PORT, Direction, ProxyOptions, SendOptions, SessionId};
