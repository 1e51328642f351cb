//! jamproxy/src/connection.rs
//! One intercepted client: the local socket, its remote leg, and the relay between them.
//!
//! Each socket gets a reader task that splits frames and pushes them onto a
//! bounded queue for its direction. A single drain task per session takes
//! messages off both queues (local first), runs the hooks, and forwards what
//! is left. Hooks for one session therefore never run for two messages at once.

use crate::{
    dispatch::{Dispatch, HookContext},
    error::{ProxyError, Result},
    host::{ConsoleSink, SettingsStore},
    message::Message,
    protocol::{self, NullDelimitedCodec},
    state::{ACTIVE_SESSIONS, TOTAL_SESSIONS, next_session_id},
    types::{AsyncStream, ConnectionEvent, Direction, ProxyOptions, SendOptions, SessionId},
};
use dashmap::DashMap;
use futures::StreamExt;
use lazy_static::lazy_static;
use std::{
    sync::{
        Arc, Mutex as StdMutex, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, broadcast, mpsc, watch},
    time::{Instant, timeout},
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use tokio_socks::tcp::Socks5Stream;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, error, info, warn};
use url::Url;

/// Per-direction queue depth before readers stop pulling from the socket.
pub const QUEUE_CAPACITY: usize = 1000;
/// Upper bound for a single write once the socket is available.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// A disconnect this soon after connecting is not announced.
pub const DISCONNECT_NOTICE_WINDOW: Duration = Duration::from_secs(5);
const RECONNECT_BASE_MS: f64 = 1000.0;
const RECONNECT_CAP_MS: f64 = 30_000.0;
const SOCKS_DEFAULT_PORT: u16 = 1080;

pub(crate) type SessionSet = DashMap<SessionId, Session>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something to write to a socket: a message (serialized from its payload) or a raw frame.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Message(Message),
    Raw(String),
}

impl Outgoing {
    fn into_payload(self) -> String {
        match self {
            Outgoing::Message(m) => m.to_message(),
            Outgoing::Raw(s) => s,
        }
    }
}

impl From<Message> for Outgoing {
    fn from(m: Message) -> Self {
        Outgoing::Message(m)
    }
}

impl From<String> for Outgoing {
    fn from(s: String) -> Self {
        Outgoing::Raw(s)
    }
}

impl From<&str> for Outgoing {
    fn from(s: &str) -> Self {
        Outgoing::Raw(s.to_string())
    }
}

/// Everything a session borrows from the listener that accepted it.
#[derive(Clone)]
pub(crate) struct SessionParts {
    pub port: u16,
    pub dispatch: Dispatch,
    pub console: Arc<dyn ConsoleSink>,
    pub settings: Arc<dyn SettingsStore>,
    pub events: broadcast::Sender<ConnectionEvent>,
    pub sessions: Weak<SessionSet>,
}

struct Queued {
    direction: Direction,
    message: Message,
}

struct SessionInner {
    id: SessionId,
    parts: SessionParts,
    local: Mutex<Option<BoxedWriter>>,
    remote: Mutex<Option<BoxedWriter>>,
    local_queue: mpsc::Sender<Queued>,
    remote_queue: mpsc::Sender<Queued>,
    state: watch::Sender<SessionState>,
    closed: AtomicBool,
    manual_disconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    connected_at: StdMutex<Option<Instant>>,
    cancel: CancellationToken,
}

/// Cheap to clone. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    fn build(
        parts: SessionParts,
        local: Option<BoxedWriter>,
    ) -> (Session, mpsc::Receiver<Queued>, mpsc::Receiver<Queued>) {
        let (local_queue, local_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (remote_queue, remote_rx) = mpsc::channel(QUEUE_CAPACITY);
        // Accepted sessions connect straight away.
        let (state, _) = watch::channel(SessionState::Connecting);
        let session = Session {
            inner: Arc::new(SessionInner {
                id: next_session_id(),
                parts,
                local: Mutex::new(local),
                remote: Mutex::new(None),
                local_queue,
                remote_queue,
                state,
                closed: AtomicBool::new(false),
                manual_disconnect: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                connected_at: StdMutex::new(None),
                cancel: CancellationToken::new(),
            }),
        };
        (session, local_rx, remote_rx)
    }

    /// Wraps an accepted client socket and starts its reader and drain tasks.
    /// The remote leg is opened separately with [`Session::connect`].
    pub(crate) fn start<S>(parts: SessionParts, local: S) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(local);
        let (session, local_rx, remote_rx) = Self::build(parts, Some(Box::new(writer)));
        TOTAL_SESSIONS.fetch_add(1, Ordering::Relaxed);
        // Registered before any task runs, so an early close still finds it.
        if let Some(sessions) = session.inner.parts.sessions.upgrade() {
            sessions.insert(session.id(), session.clone());
            ACTIVE_SESSIONS.fetch_add(1, Ordering::Relaxed);
        }

        session.spawn_reader(Direction::Local, reader);
        tokio::spawn(session.clone().drain(local_rx, remote_rx));
        info!(session = session.id(), "Session started");
        session
    }

    /// A session with no sockets, for exercising hooks.
    #[cfg(test)]
    pub(crate) fn detached(dispatch: Dispatch) -> Session {
        let (events, _) = broadcast::channel(1);
        let parts = SessionParts {
            port: crate::types::DEFAULT_PORT,
            console: dispatch.console().clone(),
            dispatch,
            settings: Arc::new(crate::host::MemorySettings::new()),
            events,
            sessions: Weak::new(),
        };
        Self::build(parts, None).0
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Port of the listener that accepted this session.
    pub fn port(&self) -> u16 {
        self.inner.parts.port
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.inner.parts.dispatch
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        self.inner.state.send_replace(state);
    }

    // ── Remote leg ───────────────────────────────────────────────

    /// Opens the remote leg using the current settings. On failure, retries with
    /// backoff when `autoReconnect` is on, otherwise reports and closes the session.
    pub async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ProxyError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }
        let options = ProxyOptions::from_settings(self.inner.parts.settings.as_ref());
        self.set_state(SessionState::Connecting);

        match self.connect_once(&options).await {
            Ok(()) => Ok(()),
            Err(ProxyError::Closed) => Err(ProxyError::Closed),
            Err(e)
                if options.auto_reconnect
                    && e.is_transient()
                    && !self.inner.manual_disconnect.load(Ordering::SeqCst) =>
            {
                self.reconnect(&options, e).await
            }
            Err(e) => {
                error!(session = self.id(), "Could not connect to the server: {}", e);
                self.inner
                    .parts
                    .console
                    .error(&format!("Could not connect to the server: {}", e));
                self.disconnect(false).await;
                Err(e)
            }
        }
    }

    async fn reconnect(&self, options: &ProxyOptions, mut last_error: ProxyError) -> Result<()> {
        loop {
            if self.is_closed() || self.inner.manual_disconnect.load(Ordering::SeqCst) {
                return Err(ProxyError::Closed);
            }
            let attempt = self.inner.reconnect_attempts.load(Ordering::SeqCst);
            if attempt >= options.max_reconnect_attempts {
                error!(session = self.id(), attempts = attempt, "Giving up: {}", last_error);
                self.inner.parts.console.error(&format!(
                    "Could not reconnect after {} attempts: {}",
                    attempt, last_error
                ));
                self.disconnect(false).await;
                return Err(ProxyError::ReconnectExhausted(attempt));
            }

            let delay = reconnect_delay(attempt);
            self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            warn!(
                session = self.id(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting: {}",
                last_error
            );

            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(ProxyError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect_once(options).await {
                Ok(()) => return Ok(()),
                Err(ProxyError::Closed) => return Err(ProxyError::Closed),
                Err(e) => last_error = e,
            }
        }
    }

    async fn connect_once(&self, options: &ProxyOptions) -> Result<()> {
        let host = options
            .remote_host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or(ProxyError::NoRemoteHost)?;
        let port = options.remote_port.unwrap_or(self.port());
        let limit = options.connection_timeout();

        // Dropping the timed-out future tears the half-open socket down.
        let stream = match timeout(limit, open_remote(&host, port, options)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(ProxyError::Timeout(limit)),
        };
        if self.is_closed() {
            return Err(ProxyError::Closed);
        }

        let (reader, writer) = tokio::io::split(stream);
        *self.inner.remote.lock().await = Some(Box::new(writer));
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        if let Ok(mut at) = self.inner.connected_at.lock() {
            *at = Some(Instant::now());
        }
        self.set_state(SessionState::Connected);
        self.spawn_reader(Direction::Remote, reader);

        let _ = self.inner.parts.events.send(ConnectionEvent {
            session: self.id(),
            connected: true,
        });
        info!(session = self.id(), %host, port, tls = options.secure_connection, "Connected to server");
        Ok(())
    }

    // ── Relay ────────────────────────────────────────────────────

    fn spawn_reader<R>(&self, direction: Direction, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let session = self.clone();
        let queue = match direction {
            Direction::Remote => self.inner.remote_queue.clone(),
            _ => self.inner.local_queue.clone(),
        };
        let cancel = self.inner.cancel.clone();

        tokio::spawn(async move {
            let mut frames = FramedRead::new(reader, NullDelimitedCodec::default());
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = frames.next() => next,
                };
                let raw = match next {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => {
                        debug!(session = session.id(), %direction, "Read failed: {}", e);
                        break;
                    }
                    None => break,
                };
                let Some(message) = Message::classify(raw) else {
                    debug!(session = session.id(), %direction, "Dropping unrecognized frame");
                    continue;
                };
                if queue.capacity() == 0 {
                    warn!(session = session.id(), %direction, "Message queue full, pausing reads");
                }
                if queue.send(Queued { direction, message }).await.is_err() {
                    return;
                }
            }
            info!(session = session.id(), %direction, "Socket closed");
            session.disconnect(false).await;
        });
    }

    async fn drain(self, mut local_rx: mpsc::Receiver<Queued>, mut remote_rx: mpsc::Receiver<Queued>) {
        let cancel = self.inner.cancel.clone();
        loop {
            let item = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                Some(item) = local_rx.recv() => item,
                Some(item) = remote_rx.recv() => item,
                else => break,
            };
            self.process(item).await;
        }
        debug!(session = self.id(), "Drain stopped");
    }

    async fn process(&self, item: Queued) {
        let Queued { direction, mut message } = item;

        if let Err(e) = message.parse() {
            debug!(session = self.id(), %direction, "Forwarding unparsable frame as is: {}", e);
            self.forward(direction, message.raw().to_string()).await;
            return;
        }

        let shared = Arc::new(Mutex::new(message));
        self.dispatch()
            .all(HookContext {
                session: self.clone(),
                dispatch: self.dispatch().unpinned(),
                direction,
                message: shared.clone(),
            })
            .await;
        let message = shared.lock().await;

        if direction == Direction::Local && protocol::is_policy_request(message.raw()) {
            let policy = protocol::policy_response(self.port());
            if let Err(e) = self.send_local(policy, SendOptions::default()).await {
                warn!(session = self.id(), "Failed to answer policy request: {}", e);
            }
            return;
        }
        if message.message_type().is_some_and(protocol::is_bootstrap) {
            self.forward(direction, message.raw().to_string()).await;
            return;
        }
        if message.send {
            self.forward(direction, message.to_message()).await;
        }
    }

    async fn forward(&self, from: Direction, payload: String) {
        let to = from.opposite();
        if let Err(e) = self.send(to, payload, SendOptions::default()).await {
            if self.is_closed() {
                return;
            }
            error!(session = self.id(), %to, "Forward failed: {}", e);
            self.inner
                .parts
                .console
                .error(&format!("Failed to send to {}: {}", to, e));
        }
    }

    /// Writes to the game client.
    pub async fn send_local(&self, message: impl Into<Outgoing>, options: SendOptions) -> Result<()> {
        self.send(Direction::Local, message.into().into_payload(), options)
            .await
    }

    /// Writes to the game server. Waits out a pending connect or reconnect first.
    pub async fn send_remote(&self, message: impl Into<Outgoing>, options: SendOptions) -> Result<()> {
        self.send(Direction::Remote, message.into().into_payload(), options)
            .await
    }

    async fn send(&self, to: Direction, payload: String, options: SendOptions) -> Result<()> {
        let frame = protocol::encode_frame(&payload);
        let mut attempt = 0;
        loop {
            match self.write_once(to, &frame).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < options.retries && !self.is_closed() => {
                    attempt += 1;
                    warn!(session = self.id(), %to, attempt, "Write failed, retrying: {}", e);
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_once(&self, to: Direction, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(ProxyError::Closed);
        }
        let slot = match to {
            Direction::Remote => {
                // Held until the pending connect (and any reconnect backoff) settles.
                // Every path out of Connecting ends in Connected or a disconnect.
                let mut state = self.inner.state.subscribe();
                let settled = async {
                    state
                        .wait_for(|s| *s != SessionState::Connecting)
                        .await
                        .is_ok()
                };
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => return Err(ProxyError::Closed),
                    _ = settled => {}
                }
                &self.inner.remote
            }
            _ => &self.inner.local,
        };

        let mut guard = slot.lock().await;
        let writer = guard.as_mut().ok_or(ProxyError::NotConnected(match to {
            Direction::Remote => "remote",
            _ => "local",
        }))?;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match timeout(WRITE_TIMEOUT, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::Timeout(WRITE_TIMEOUT)),
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Closes both sockets and drops anything still queued. Safe to call repeatedly.
    /// `manual` marks a user-requested close, which is never announced and never retried.
    pub async fn disconnect(&self, manual: bool) {
        if manual {
            self.inner.manual_disconnect.store(true, Ordering::SeqCst);
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.set_state(SessionState::Disconnected);

        for slot in [&self.inner.local, &self.inner.remote] {
            if let Some(mut writer) = slot.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        }

        let id = self.id();
        let parts = &self.inner.parts;
        parts.dispatch.clear_intervals(id);
        if let Some(sessions) = parts.sessions.upgrade() {
            if sessions.remove(&id).is_some() {
                ACTIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed);
            }
        }
        let _ = parts.events.send(ConnectionEvent {
            session: id,
            connected: false,
        });

        let connected_at = self.inner.connected_at.lock().ok().and_then(|at| *at);
        let settled = connected_at.is_some_and(|at| at.elapsed() >= DISCONNECT_NOTICE_WINDOW);
        if !self.inner.manual_disconnect.load(Ordering::SeqCst) && settled {
            parts.console.warn("Disconnected from the server.");
        }
        info!(session = id, manual, "Session closed");
    }
}

/// Backoff before reconnect attempt `attempt` (0-based): 1s doubling, up to 30% jitter, capped at 30s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let jitter = rand::random::<f64>() * 0.3;
    let base = RECONNECT_BASE_MS * 2f64.powi(attempt.min(16) as i32);
    Duration::from_millis((base * (1.0 + jitter)).min(RECONNECT_CAP_MS) as u64)
}

async fn open_remote(host: &str, port: u16, options: &ProxyOptions) -> Result<Box<AsyncStream>> {
    let target = format!("{}:{}", host, port);
    let stream: Box<AsyncStream> = match options.upstream_proxy.as_deref().filter(|p| !p.is_empty()) {
        Some(proxy) => connect_via_proxy(proxy, host, port).await?,
        None => Box::new(
            TcpStream::connect(&target)
                .await
                .map_err(|source| ProxyError::Connect {
                    target: target.clone(),
                    source,
                })?,
        ),
    };

    if options.secure_connection {
        wrap_tls(host, stream).await
    } else {
        Ok(stream)
    }
}

async fn connect_via_proxy(proxy: &str, host: &str, port: u16) -> Result<Box<AsyncStream>> {
    let url = Url::parse(proxy).map_err(|e| ProxyError::InvalidProxyUrl(format!("{}: {}", proxy, e)))?;
    if url.scheme() != "socks5" {
        return Err(ProxyError::InvalidProxyUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    let proxy_host = url
        .host_str()
        .ok_or_else(|| ProxyError::InvalidProxyUrl(format!("{}: missing host", proxy)))?;
    let proxy_addr = format!("{}:{}", proxy_host, url.port().unwrap_or(SOCKS_DEFAULT_PORT));
    let username = url.username();
    let password = url.password().unwrap_or_default();

    debug!(%proxy_addr, %host, port, "Connecting through SOCKS5");
    let stream = if username.is_empty() {
        Socks5Stream::connect(proxy_addr.as_str(), (host, port)).await?
    } else {
        Socks5Stream::connect_with_password(proxy_addr.as_str(), (host, port), username, password)
            .await?
    };
    Ok(Box::new(stream))
}

lazy_static! {
    static ref TLS_CONFIG: StdMutex<Option<Arc<ClientConfig>>> = StdMutex::new(None);
}

fn tls_config() -> Result<Arc<ClientConfig>> {
    let mut cached = TLS_CONFIG
        .lock()
        .map_err(|_| ProxyError::Tls("tls config lock poisoned".into()))?;
    if let Some(config) = cached.as_ref() {
        return Ok(config.clone());
    }
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    let config = Arc::new(config);
    *cached = Some(config.clone());
    Ok(config)
}

async fn wrap_tls(host: &str, stream: Box<AsyncStream>) -> Result<Box<AsyncStream>> {
    let name = ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::Tls(format!("{}: {}", host, e)))?;
    let connector = TlsConnector::from(tls_config()?);
    let tls = connector
        .connect(name, stream)
        .await
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    Ok(Box::new(tls))
}
