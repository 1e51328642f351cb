//! jamproxy/src/dispatch.rs
//! Hook registry, shared state, console commands, intervals, and the plugin table.
//!
//! Hooks, commands and plugins live together in a [`Registry`]. A plugin reload
//! builds a fresh registry off to the side and swaps it in at once, so a
//! dispatch that already grabbed the old registry runs to completion against it.

use crate::{
    connection::Session,
    error::CommandError,
    host::ConsoleSink,
    message::{LoginParams, Message, XtCommand},
    plugin::LoadedPlugin,
    state::{StateObserver, StateStore},
    types::{Direction, SessionId},
};
use dashmap::DashMap;
use futures::{
    FutureExt,
    future::BoxFuture,
    stream::{FuturesUnordered, StreamExt},
};
use serde_json::{Value, json};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::AbortHandle};
use tracing::{debug, error, info, warn};

/// Matches every message type.
pub const ANY_TYPE: &str = "*";

pub type HookId = u64;
pub type IntervalId = u64;

pub type CallbackFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type HookFn = Arc<dyn Fn(HookContext) -> CallbackFuture + Send + Sync>;
pub type CommandFn = Arc<dyn Fn(CommandContext) -> CallbackFuture + Send + Sync>;
pub type IntervalFn = Arc<dyn Fn(Dispatch) -> CallbackFuture + Send + Sync>;

/// What a hook sees: the session, the direction and the shared message.
#[derive(Clone)]
pub struct HookContext {
    pub session: Session,
    pub dispatch: Dispatch,
    pub direction: Direction,
    /// Hooks run concurrently; mutations go through the lock.
    pub message: Arc<Mutex<Message>>,
}

#[derive(Clone)]
pub struct CommandContext {
    pub dispatch: Dispatch,
    pub parameters: Vec<String>,
}

#[derive(Clone)]
struct Hook {
    id: HookId,
    callback: HookFn,
}

#[derive(Clone)]
struct Command {
    id: u64,
    description: String,
    callback: CommandFn,
}

struct Interval {
    session: Option<SessionId>,
    // Registry the registering handle was pinned to, if any.
    origin: Option<Weak<Registry>>,
    handle: AbortHandle,
}

#[derive(Default)]
pub(crate) struct Registry {
    hooks: DashMap<(Direction, String), Vec<Hook>>,
    commands: DashMap<String, Command>,
    pub(crate) plugins: DashMap<String, LoadedPlugin>,
}

impl Registry {
    /// Hooks for `message_type` (and `*`) under `direction`, plus every
    /// [`Direction::Any`] hook whatever type it was registered for.
    fn matching(&self, direction: Direction, message_type: Option<&str>) -> Vec<Hook> {
        let mut matched = Vec::new();
        if direction != Direction::Any {
            let mut types = vec![ANY_TYPE];
            types.extend(message_type);
            for t in types {
                if let Some(hooks) = self.hooks.get(&(direction, t.to_string())) {
                    matched.extend(hooks.value().iter().cloned());
                }
            }
        }
        for entry in self.hooks.iter().filter(|e| e.key().0 == Direction::Any) {
            matched.extend(entry.value().iter().cloned());
        }
        matched
    }

    /// Drops hooks and commands registered at or after `mark`.
    fn discard_since(&self, mark: u64) -> (usize, usize) {
        let mut hooks = 0;
        for mut entry in self.hooks.iter_mut() {
            let before = entry.len();
            entry.retain(|h| h.id < mark);
            hooks += before - entry.len();
        }
        self.hooks.retain(|_, hooks| !hooks.is_empty());

        let before = self.commands.len();
        self.commands.retain(|_, command| command.id < mark);
        (hooks, before - self.commands.len())
    }

    fn hook_count(&self) -> usize {
        self.hooks.iter().map(|e| e.value().len()).sum()
    }
}

struct DispatchInner {
    registry: RwLock<Arc<Registry>>,
    state: StateStore,
    console: Arc<dyn ConsoleSink>,
    intervals: DashMap<IntervalId, Interval>,
    next_id: AtomicU64,
    reload_lock: Mutex<()>,
}

/// Cheap to clone; every clone talks to the same runtime.
#[derive(Clone)]
pub struct Dispatch {
    inner: Arc<DispatchInner>,
    // Set while a reload is staging a new registry; registrations land there.
    pinned: Option<Arc<Registry>>,
}

impl Dispatch {
    pub fn new(console: Arc<dyn ConsoleSink>) -> Self {
        let dispatch = Dispatch {
            inner: Arc::new(DispatchInner {
                registry: RwLock::new(Arc::new(Registry::default())),
                state: StateStore::new(),
                console,
                intervals: DashMap::new(),
                next_id: AtomicU64::new(1),
                reload_lock: Mutex::new(()),
            }),
            pinned: None,
        };
        dispatch.register_defaults();
        dispatch
    }

    pub fn console(&self) -> &Arc<dyn ConsoleSink> {
        &self.inner.console
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn registry(&self) -> Arc<Registry> {
        if let Some(pinned) = &self.pinned {
            return pinned.clone();
        }
        match self.inner.registry.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// A handle whose registrations go to `registry` instead of the live one.
    pub(crate) fn pinned_to(&self, registry: Arc<Registry>) -> Dispatch {
        Dispatch {
            inner: self.inner.clone(),
            pinned: Some(registry),
        }
    }

    /// Handle that always follows the live registry.
    pub fn unpinned(&self) -> Dispatch {
        Dispatch {
            inner: self.inner.clone(),
            pinned: None,
        }
    }

    pub(crate) fn swap_registry(&self, registry: Arc<Registry>) {
        match self.inner.registry.write() {
            Ok(mut guard) => *guard = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
    }

    pub(crate) async fn reload_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.reload_lock.lock().await
    }

    // ── Hooks ────────────────────────────────────────────────────

    /// Registers `callback` for messages of `message_type` ([`ANY_TYPE`] for all)
    /// arriving from `direction`. A [`Direction::Any`] hook runs for every
    /// message in both directions, regardless of `message_type`.
    pub fn on_message<F, Fut>(&self, direction: Direction, message_type: &str, callback: F) -> HookId
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id();
        let callback: HookFn = Arc::new(move |ctx: HookContext| callback(ctx).boxed());
        self.registry()
            .hooks
            .entry((direction, message_type.to_string()))
            .or_default()
            .push(Hook { id, callback });
        debug!(hook = id, %direction, message_type, "Registered hook");
        id
    }

    pub fn off_message(&self, id: HookId) -> bool {
        let registry = self.registry();
        let mut removed = false;
        for mut entry in registry.hooks.iter_mut() {
            let before = entry.len();
            entry.retain(|h| h.id != id);
            removed |= entry.len() != before;
        }
        registry.hooks.retain(|_, hooks| !hooks.is_empty());
        removed
    }

    pub fn hook_count(&self) -> usize {
        self.registry().hook_count()
    }

    /// Runs every matching hook concurrently and waits for all of them.
    /// A failing or panicking hook is reported and does not affect the others.
    pub async fn all(&self, ctx: HookContext) {
        let message_type = ctx
            .message
            .lock()
            .await
            .message_type()
            .map(str::to_string);
        let hooks = self
            .registry()
            .matching(ctx.direction, message_type.as_deref());
        if hooks.is_empty() {
            return;
        }

        let mut pending = FuturesUnordered::new();
        for Hook { id, callback } in hooks {
            let ctx = ctx.clone();
            pending.push(async move {
                let result = AssertUnwindSafe(async move { callback(ctx).await })
                    .catch_unwind()
                    .await;
                (id, result)
            });
        }

        let label = message_type.as_deref().unwrap_or("?");
        while let Some((id, result)) = pending.next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(session = ctx.session.id(), hook = id, message_type = label, "Hook failed: {:#}", e);
                    self.inner
                        .console
                        .error(&format!("Hook for {} failed: {:#}", label, e));
                }
                Err(_) => {
                    error!(session = ctx.session.id(), hook = id, message_type = label, "Hook panicked");
                    self.inner
                        .console
                        .error(&format!("Hook for {} panicked", label));
                }
            }
        }
    }

    // ── State ────────────────────────────────────────────────────

    /// No-op when `value` equals what is stored. Returns whether it changed.
    pub fn set_state(&self, key: &str, value: impl Into<Value>) -> bool {
        self.inner.state.set(key, value.into())
    }

    pub fn get_state(&self, key: &str, default: impl Into<Value>) -> Value {
        self.inner.state.get(key).unwrap_or_else(|| default.into())
    }

    pub fn on_state_change<F>(&self, observer: F) -> u64
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let observer: StateObserver = Arc::new(observer);
        self.inner.state.observe(observer)
    }

    pub fn off_state_change(&self, id: u64) -> bool {
        self.inner.state.unobserve(id)
    }

    pub fn state_snapshot(&self) -> serde_json::Map<String, Value> {
        self.inner.state.snapshot()
    }

    // Re-registered on every reload, since a reload starts from an empty registry.
    pub(crate) fn register_defaults(&self) {
        self.on_message(Direction::Local, "rj", |ctx: HookContext| async move {
            let command = ctx.message.lock().await.as_xt().map(|p| p.command());
            if let Some(XtCommand::RoomJoin { routing_id, room }) = command {
                ctx.dispatch.set_state("room", room);
                ctx.dispatch.set_state("internalRoomId", routing_id);
            }
            Ok(())
        });

        self.on_message(Direction::Remote, "login", |ctx: HookContext| async move {
            let params = ctx.message.lock().await.login_params();
            match params {
                Some(LoginParams::Object(player)) => {
                    ctx.dispatch.set_state("player", player);
                }
                Some(LoginParams::Tokens(tokens)) => {
                    warn!(session = ctx.session.id(), "login arrived as a flat token list");
                    ctx.dispatch.set_state("player", json!(tokens));
                }
                None => debug!(session = ctx.session.id(), "login without player data"),
            }
            Ok(())
        });
    }

    // ── Commands ─────────────────────────────────────────────────

    pub fn on_command<F, Fut>(
        &self,
        name: &str,
        description: &str,
        callback: F,
    ) -> Result<(), CommandError>
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let registry = self.registry();
        match registry.commands.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CommandError::Duplicate(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let callback: CommandFn = Arc::new(move |ctx: CommandContext| callback(ctx).boxed());
                slot.insert(Command {
                    id: self.next_id(),
                    description: description.to_string(),
                    callback,
                });
                Ok(())
            }
        }
    }

    pub fn off_command(&self, name: &str) -> bool {
        self.registry().commands.remove(name).is_some()
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn commands(&self) -> Vec<(String, String)> {
        let mut commands: Vec<_> = self
            .registry()
            .commands
            .iter()
            .map(|e| (e.key().clone(), e.value().description.clone()))
            .collect();
        commands.sort();
        commands
    }

    pub async fn run_command(&self, name: &str, parameters: Vec<String>) -> Result<(), CommandError> {
        let callback = self
            .registry()
            .commands
            .get(name)
            .map(|c| c.callback.clone())
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;

        let ctx = CommandContext {
            dispatch: self.unpinned(),
            parameters,
        };
        let result = AssertUnwindSafe(async move { callback(ctx).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("command panicked")));

        result.map_err(|source| {
            self.inner
                .console
                .error(&format!("Command {} failed: {:#}", name, source));
            CommandError::Failed {
                name: name.to_string(),
                source,
            }
        })
    }

    /// Splits a console line on whitespace and runs it.
    pub async fn run_command_line(&self, line: &str) -> Result<(), CommandError> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let name = parts.next().unwrap_or_default();
        self.run_command(&name, parts.collect()).await
    }

    // ── Intervals ────────────────────────────────────────────────

    /// Calls `callback` every `period` until cleared. Intervals bound to a session
    /// are cleared when it disconnects. Must be called inside a Tokio runtime.
    pub fn set_interval<F, Fut>(
        &self,
        session: Option<SessionId>,
        period: Duration,
        callback: F,
    ) -> IntervalId
    where
        F: Fn(Dispatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id();
        let callback: IntervalFn = Arc::new(move |d: Dispatch| callback(d).boxed());
        let dispatch = self.unpinned();
        let period = period.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; the callback first runs one period in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cb = callback.clone();
                let d = dispatch.clone();
                let result = AssertUnwindSafe(async move { cb(d).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("interval panicked")));
                if let Err(e) = result {
                    error!(interval = id, "Interval failed: {:#}", e);
                    dispatch
                        .console()
                        .error(&format!("Interval {} failed: {:#}", id, e));
                }
            }
        });

        self.inner.intervals.insert(
            id,
            Interval {
                session,
                origin: self.pinned.as_ref().map(Arc::downgrade),
                handle: task.abort_handle(),
            },
        );
        id
    }

    pub fn clear_interval(&self, id: IntervalId) -> bool {
        match self.inner.intervals.remove(&id) {
            Some((_, interval)) => {
                interval.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every interval registered for `session`. Returns how many.
    pub fn clear_intervals(&self, session: SessionId) -> usize {
        let mut cleared = 0;
        self.inner.intervals.retain(|_, interval| {
            if interval.session == Some(session) {
                interval.handle.abort();
                cleared += 1;
                false
            } else {
                true
            }
        });
        cleared
    }

    /// Next id to be handed out. Everything registered afterwards compares `>=`.
    pub(crate) fn id_mark(&self) -> u64 {
        self.inner.next_id.load(Ordering::Relaxed)
    }

    /// Undoes what this pinned handle registered since `mark`: hooks and commands
    /// in its registry, and the intervals it started.
    pub(crate) fn discard_since(&self, mark: u64) {
        let Some(registry) = &self.pinned else {
            return;
        };
        let (hooks, commands) = registry.discard_since(mark);
        let mut intervals = 0;
        self.inner.intervals.retain(|id, interval| {
            let owned = interval
                .origin
                .as_ref()
                .is_some_and(|origin| std::ptr::eq(origin.as_ptr(), Arc::as_ptr(registry)));
            if *id >= mark && owned {
                interval.handle.abort();
                intervals += 1;
                false
            } else {
                true
            }
        });
        debug!(hooks, commands, intervals, "Discarded registrations");
    }

    pub(crate) fn clear_all_intervals(&self) {
        self.inner.intervals.retain(|_, interval| {
            interval.handle.abort();
            false
        });
    }

    pub fn interval_count(&self) -> usize {
        self.inner.intervals.len()
    }

    // ── Plugins ──────────────────────────────────────────────────

    pub fn plugin(&self, name: &str) -> Option<LoadedPlugin> {
        self.registry().plugins.get(name).map(|p| p.value().clone())
    }

    /// Loaded plugins in load order.
    pub fn plugins(&self) -> Vec<LoadedPlugin> {
        let mut plugins: Vec<LoadedPlugin> = self
            .registry()
            .plugins
            .iter()
            .map(|p| p.value().clone())
            .collect();
        plugins.sort_by(|a, b| {
            (a.manifest.kind, &a.manifest.name).cmp(&(b.manifest.kind, &b.manifest.name))
        });
        plugins
    }

    /// Drops every hook, command, plugin and interval, keeping only the built-in hooks.
    pub async fn clear_all(&self) {
        let _guard = self.reload_guard().await;
        let fresh = Arc::new(Registry::default());
        self.pinned_to(fresh.clone()).register_defaults();
        self.clear_all_intervals();
        self.swap_registry(fresh);
        info!("Cleared all hooks, commands and plugins");
    }

    /// Tells every game plugin that settings were persisted.
    pub async fn notify_settings_updated(&self) {
        for plugin in self.plugins() {
            let Some(instance) = plugin.instance.clone() else {
                continue;
            };
            let result = AssertUnwindSafe(async move { instance.on_settings_updated().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("panicked")));
            if let Err(e) = result {
                error!(plugin = %plugin.manifest.name, "Settings update failed: {:#}", e);
                self.inner.console.error(&format!(
                    "Plugin {} failed to apply settings: {:#}",
                    plugin.manifest.name, e
                ));
            }
        }
    }
}
