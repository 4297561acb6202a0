//! Connection hub: authoritative registry of live sessions.
//!
//! Three concurrent maps share ownership of each connection: `id → conn`,
//! `id → username`, and `lowercased username → id`. Registration subscribes
//! to the connection's close event so a dying session unregisters itself;
//! unregistration removes both username mappings atomically with the id
//! mapping and unsubscribes the close hook.
//!
//! The count is maintained with interlocked arithmetic and is eventually
//! consistent with the id map under concurrent register/unregister; no
//! global lock exists on the hot path.

use std::sync::{
    Arc, Mutex, PoisonError, Weak,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{Connection, HookId, SessionId},
    pool::Pool,
};

/// Extra snapshot capacity to tolerate registrations racing a snapshot.
const SNAPSHOT_SLACK: usize = 8;

/// Result of a broadcast fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastOutcome {
    /// Sends scheduled before cancellation.
    pub attempted: usize,
    /// Sends that returned an error (logged, never fatal to peers).
    pub failed: usize,
}

type UnregisterHook = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Thread-safe registry of active sessions.
pub struct ConnectionHub {
    connections: DashMap<SessionId, Registered>,
    usernames: DashMap<SessionId, String>,
    by_username: DashMap<String, SessionId>,
    count: AtomicUsize,
    disposed: AtomicBool,
    on_unregister: Mutex<Vec<UnregisterHook>>,
    snapshots: Pool<Vec<Arc<Connection>>>,
}

/// A registered connection plus its close subscription.
struct Registered {
    conn: Arc<Connection>,
    close_hook: HookId,
}

impl ConnectionHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            usernames: DashMap::new(),
            by_username: DashMap::new(),
            count: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            on_unregister: Mutex::new(Vec::new()),
            snapshots: Pool::new(4),
        })
    }

    /// Register a connection.
    ///
    /// Returns `false` without side effects if the id is already present or
    /// the hub is disposed. On success the hub subscribes to the
    /// connection's close event and bumps the count.
    pub fn register(self: &Arc<Self>, conn: Arc<Connection>) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }

        let id = conn.id();
        let weak: Weak<Self> = Arc::downgrade(self);
        let close_hook = conn.on_close(move |_| {
            if let Some(hub) = weak.upgrade() {
                hub.unregister_id(id);
            }
        });

        // The entry guard holds a shard lock; anything that touches the map
        // again (like the sweep below) must run after it drops.
        let closing = match self.connections.entry(id) {
            Entry::Occupied(_) => {
                // Lost the race (or duplicate registration); roll back the
                // subscription so the stranger's close can't touch us.
                conn.remove_close_hook(close_hook);
                return false;
            },
            Entry::Vacant(slot) => {
                let closing = conn.is_closing();
                slot.insert(Registered { conn, close_hook });
                self.count.fetch_add(1, Ordering::AcqRel);
                closing
            },
        };

        // The close event may have fired between subscription and
        // insertion; sweep the corpse rather than leak it.
        if closing {
            self.unregister_id(id);
        }
        true
    }

    /// Unregister a connection. Returns `false` if it was not registered.
    pub fn unregister(&self, conn: &Arc<Connection>) -> bool {
        self.unregister_id(conn.id())
    }

    /// Unregister by session id.
    pub fn unregister_id(&self, id: SessionId) -> bool {
        let Some((_, registered)) = self.connections.remove(&id) else {
            return false;
        };
        self.count.fetch_sub(1, Ordering::AcqRel);
        registered.conn.remove_close_hook(registered.close_hook);

        if let Some((_, name)) = self.usernames.remove(&id) {
            self.by_username.remove_if(&name.to_lowercase(), |_, owner| *owner == id);
        }

        let hooks = lock(&self.on_unregister);
        for hook in hooks.iter() {
            hook(&registered.conn);
        }
        true
    }

    /// Subscribe to unregistration events (fired once per unregistered
    /// connection).
    pub fn on_unregister(&self, hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        lock(&self.on_unregister).push(Box::new(hook));
    }

    /// Associate a username with a registered connection.
    ///
    /// No-op on a blank name or a disposed hub. If the connection already
    /// had a username, the old reverse mapping is removed first; both
    /// mappings are then overwritten.
    pub fn associate_username(&self, conn: &Arc<Connection>, name: &str) {
        if self.disposed.load(Ordering::Acquire) || name.trim().is_empty() {
            return;
        }
        let id = conn.id();
        if !self.connections.contains_key(&id) {
            return;
        }

        let lower = name.to_lowercase();
        if let Some(old) = self.usernames.insert(id, name.to_string()) {
            let old_lower = old.to_lowercase();
            if old_lower != lower {
                self.by_username.remove_if(&old_lower, |_, owner| *owner == id);
            }
        }
        self.by_username.insert(lower, id);
    }

    /// Look up a connection by id.
    #[must_use]
    pub fn connection(&self, id: SessionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(&entry.conn))
    }

    /// Look up a connection by serialized id bytes.
    #[must_use]
    pub fn connection_by_serialized_id(&self, bytes: &[u8]) -> Option<Arc<Connection>> {
        SessionId::from_bytes(bytes).and_then(|id| self.connection(id))
    }

    /// Look up a connection by username (case-insensitive).
    #[must_use]
    pub fn connection_by_username(&self, name: &str) -> Option<Arc<Connection>> {
        let id = *self.by_username.get(&name.to_lowercase())?;
        self.connection(id)
    }

    /// Username associated with a session id, if any.
    #[must_use]
    pub fn username(&self, id: SessionId) -> Option<String> {
        self.usernames.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Best-effort snapshot of the registered connections.
    ///
    /// Race-tolerant: may include a few just-added entries or omit them, but
    /// never blocks registrations. The working buffer is pooled; the
    /// returned vector is right-sized.
    #[must_use]
    pub fn list_connections(&self) -> Vec<Arc<Connection>> {
        let budget = self.connection_count() + SNAPSHOT_SLACK;

        let mut buf = self.snapshots.rent_or(Vec::new);
        buf.clear();
        buf.reserve(budget);
        for entry in self.connections.iter().take(budget) {
            buf.push(Arc::clone(&entry.conn));
        }

        let out: Vec<Arc<Connection>> = buf.iter().map(Arc::clone).collect();

        buf.clear();
        self.snapshots.give(buf);
        out
    }

    /// Fan a message out to every registered connection.
    ///
    /// `send` is invoked once per connection; all sends run concurrently and
    /// the call resolves when every one has settled. Individual failures are
    /// logged and counted, never fatal to peers. Once `cancel` is signalled
    /// no further sends are scheduled.
    pub async fn broadcast<F, Fut, E>(
        &self,
        msg: Bytes,
        send: F,
        cancel: &CancellationToken,
    ) -> BroadcastOutcome
    where
        F: Fn(Arc<Connection>, Bytes) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        self.broadcast_where(msg, send, |_| true, cancel).await
    }

    /// Fan a message out to every connection matching `predicate`.
    pub async fn broadcast_where<F, Fut, E, P>(
        &self,
        msg: Bytes,
        send: F,
        predicate: P,
        cancel: &CancellationToken,
    ) -> BroadcastOutcome
    where
        F: Fn(Arc<Connection>, Bytes) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
        P: Fn(&Arc<Connection>) -> bool,
    {
        let mut pending = Vec::new();
        let mut targets = Vec::new();

        for conn in self.list_connections() {
            if cancel.is_cancelled() {
                break;
            }
            if !predicate(&conn) {
                continue;
            }
            targets.push(conn.id());
            pending.push(send(Arc::clone(&conn), msg.clone()));
        }

        let attempted = pending.len();
        let mut failed = 0;
        for (id, result) in targets.into_iter().zip(join_all(pending).await) {
            if let Err(e) = result {
                failed += 1;
                tracing::warn!(session = %id, error = %e, "broadcast send failed");
            }
        }

        BroadcastOutcome { attempted, failed }
    }

    /// Disconnect every connection, then clear all maps and zero the count.
    ///
    /// Per-connection errors are swallowed; a dying peer cannot block
    /// shutdown of the rest.
    pub async fn close_all(&self, reason: Option<String>) {
        let snapshot = self.list_connections();
        join_all(snapshot.iter().map(|conn| conn.disconnect(reason.clone()))).await;

        for entry in self.connections.iter() {
            entry.conn.remove_close_hook(entry.close_hook);
        }
        self.connections.clear();
        self.usernames.clear();
        self.by_username.clear();
        self.count.store(0, Ordering::Release);
    }

    /// Dispose the hub: close everything, then ignore all further calls.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_all(Some("disposed".to_string())).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
