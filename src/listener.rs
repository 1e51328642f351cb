//! jamproxy/src/listener.rs
//! Loopback listener: accepts game clients and hands each one to a [`Session`].

use crate::{
    connection::{Outgoing, Session, SessionParts, SessionSet},
    dispatch::Dispatch,
    error::{ProxyError, Result},
    host::{ConsoleSink, SettingsStore},
    state::{ACTIVE_SESSIONS, TOTAL_SESSIONS},
    types::{ConnectionEvent, SendOptions, SessionId},
};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::broadcast, task::AbortHandle};
use tracing::{error, info, warn};

const EVENT_CAPACITY: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_sessions: u64,
    pub active_sessions: u64,
}

struct ListenerInner {
    dispatch: Dispatch,
    console: Arc<dyn ConsoleSink>,
    settings: Arc<dyn SettingsStore>,
    sessions: Arc<SessionSet>,
    events: broadcast::Sender<ConnectionEvent>,
    binding: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<AbortHandle>>,
}

/// Binds once and runs one session per accepted client.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn new(
        dispatch: Dispatch,
        settings: Arc<dyn SettingsStore>,
        console: Arc<dyn ConsoleSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Listener {
            inner: Arc::new(ListenerInner {
                dispatch,
                console,
                settings,
                sessions: Arc::new(SessionSet::new()),
                events,
                binding: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Binds `addr:port` and starts accepting. Port `0` picks a free port.
    /// A second call fails with [`ProxyError::AlreadyBound`], even after a failed bind.
    pub async fn serve(&self, addr: &str, port: u16) -> Result<SocketAddr> {
        let listen_str = format!("{}:{}", addr, port);
        if self.inner.binding.swap(true, Ordering::SeqCst) {
            let bound = self
                .local_addr()
                .map_or_else(|| listen_str.clone(), |a| a.to_string());
            return Err(ProxyError::AlreadyBound(bound));
        }

        info!(%listen_str, "Starting listener");
        let listener = TcpListener::bind(&listen_str)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: listen_str.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        if let Ok(mut slot) = self.inner.local_addr.lock() {
            *slot = Some(local_addr);
        }
        info!("Bound {}", local_addr);

        let parts = SessionParts {
            port: local_addr.port(),
            dispatch: self.inner.dispatch.unpinned(),
            console: self.inner.console.clone(),
            settings: self.inner.settings.clone(),
            events: self.inner.events.clone(),
            sessions: Arc::downgrade(&self.inner.sessions),
        };
        let console = self.inner.console.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((inbound, peer)) => {
                        let _ = inbound.set_nodelay(true);
                        let session = Session::start(parts.clone(), inbound);
                        info!(session = session.id(), %peer, "Accepted client");
                        tokio::spawn(async move {
                            let _ = session.connect().await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        console.error(&format!("Failed to accept a connection: {}", e));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });
        if let Ok(mut slot) = self.inner.accept_task.lock() {
            *slot = Some(task.abort_handle());
        }
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.lock().ok().and_then(|a| *a)
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.inner.dispatch
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by_key(Session::id);
        sessions
    }

    /// Connect and disconnect notifications for every session.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Sends to every connected client. Returns how many writes succeeded.
    pub async fn broadcast_local(&self, message: impl Into<Outgoing>) -> usize {
        let message = message.into();
        let mut sent = 0;
        for session in self.sessions() {
            match session.send_local(message.clone(), SendOptions::default()).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(session = session.id(), "Broadcast to client failed: {}", e),
            }
        }
        sent
    }

    /// Sends to the server leg of every session. Returns how many writes succeeded.
    pub async fn broadcast_remote(&self, message: impl Into<Outgoing>) -> usize {
        let message = message.into();
        let mut sent = 0;
        for session in self.sessions().into_iter().filter(Session::is_connected) {
            match session.send_remote(message.clone(), SendOptions::default()).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(session = session.id(), "Broadcast to server failed: {}", e),
            }
        }
        sent
    }

    /// Stops accepting and closes every session. Returns how many were closed.
    pub async fn shutdown(&self) -> usize {
        if let Some(task) = self.inner.accept_task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        let sessions = self.sessions();
        for session in &sessions {
            session.disconnect(true).await;
        }
        info!(closed = sessions.len(), "Listener shut down");
        sessions.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_sessions: TOTAL_SESSIONS.load(Ordering::Relaxed),
            active_sessions: ACTIVE_SESSIONS.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{host::MemorySettings, logging::TracingConsole};

    fn listener() -> Listener {
        let console: Arc<dyn ConsoleSink> = Arc::new(TracingConsole);
        Listener::new(
            Dispatch::new(console.clone()),
            Arc::new(MemorySettings::new()),
            console,
        )
    }

    #[tokio::test]
    async fn binds_only_once() {
        let listener = listener();
        let addr = listener.serve("127.0.0.1", 0).await.unwrap();
        assert_eq!(listener.port(), Some(addr.port()));
        assert!(matches!(
            listener.serve("127.0.0.1", 0).await,
            Err(ProxyError::AlreadyBound(_))
        ));
        assert_eq!(listener.shutdown().await, 0);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = listener();
        let addr = first.serve("127.0.0.1", 0).await.unwrap();
        let second = listener();
        assert!(matches!(
            second.serve("127.0.0.1", addr.port()).await,
            Err(ProxyError::Bind { .. })
        ));
        first.shutdown().await;
    }
}
