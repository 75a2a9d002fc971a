//! Typed event registry: one ordered listener list per event kind (log, callback, tunnel status).
//! Delivery is synchronous, in registration order, on the thread that emits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Severity carried by log and tunnel-status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational diagnostic (bind retries, tunnel failures, body conversions).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LogEvent {
    pub level: Level,
    pub message: String,
}

/// Tunnel outcome. On success `message` is the public callback URL; on failure it is the cause.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TunnelStatusEvent {
    pub level: Level,
    pub message: String,
}

/// One inbound POST /callback, normalized. Built per request and dropped after emission.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackEvent {
    pub query_parameters: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

/// Handle returned by `add`; pass to `remove` to unsubscribe. Only meaningful
/// for the registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Inner<E> {
    next_id: u64,
    entries: Vec<(ListenerId, Callback<E>)>,
}

/// Ordered listeners for a single event kind.
pub struct Listeners<E> {
    inner: RwLock<Inner<E>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    pub fn add<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let id = ListenerId(g.next_id);
        g.next_id += 1;
        g.entries.push((id, Arc::new(f)));
        id
    }

    /// Returns false if the id was not registered (already removed).
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let before = g.entries.len();
        g.entries.retain(|(eid, _)| *eid != id);
        g.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener in registration order. The list is snapshotted first,
    /// so listeners may subscribe or unsubscribe from inside a callback.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = match self.inner.read() {
            Ok(g) => g.entries.iter().map(|(_, f)| Arc::clone(f)).collect(),
            Err(p) => p.into_inner().entries.iter().map(|(_, f)| Arc::clone(f)).collect(),
        };
        for f in snapshot {
            f(event);
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Registries {
    log: Listeners<LogEvent>,
    callback: Listeners<CallbackEvent>,
    tunnel_status: Listeners<TunnelStatusEvent>,
}

/// Event hub owned by one listener instance. Clones share the same registries,
/// so the HTTP router and the bootstrapper publish to the same subscribers.
#[derive(Clone, Default)]
pub struct Events {
    inner: Arc<Registries>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_log<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        self.inner.log.add(f)
    }

    pub fn on_callback<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&CallbackEvent) + Send + Sync + 'static,
    {
        self.inner.callback.add(f)
    }

    pub fn on_tunnel_status<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&TunnelStatusEvent) + Send + Sync + 'static,
    {
        self.inner.tunnel_status.add(f)
    }

    pub fn off_log(&self, id: ListenerId) -> bool {
        self.inner.log.remove(id)
    }

    pub fn off_callback(&self, id: ListenerId) -> bool {
        self.inner.callback.remove(id)
    }

    pub fn off_tunnel_status(&self, id: ListenerId) -> bool {
        self.inner.tunnel_status.remove(id)
    }

    pub fn emit_log(&self, event: &LogEvent) {
        self.inner.log.emit(event);
    }

    pub fn emit_callback(&self, event: &CallbackEvent) {
        self.inner.callback.emit(event);
    }

    pub fn emit_tunnel_status(&self, event: &TunnelStatusEvent) {
        self.inner.tunnel_status.emit(event);
    }

    #[inline]
    pub fn log(&self, level: Level, message: impl Into<String>) {
        self.emit_log(&LogEvent {
            level,
            message: message.into(),
        });
    }

    #[inline]
    pub fn tunnel_status(&self, level: Level, message: impl Into<String>) {
        self.emit_tunnel_status(&TunnelStatusEvent {
            level,
            message: message.into(),
        });
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("log", &self.inner.log.len())
            .field("callback", &self.inner.callback.len())
            .field("tunnel_status", &self.inner.tunnel_status.len())
            .finish()
    }
}
