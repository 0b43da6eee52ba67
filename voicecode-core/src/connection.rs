//! Connection & dispatch layer: per-connection state and the process-wide
//! connection table (§3 "Connection", "ConnectionTable"; §4.1).

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use tokio::sync::mpsc::UnboundedSender;
use voicecode_protocol::ServerMessage;

/// Opaque handle identifying one connection; assigned on accept, never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One client's server-side state. The transport itself is represented as
/// an unbounded channel to the task that owns the socket; sending to it
/// never blocks the dispatcher.
pub struct Connection {
    pub id: ConnectionId,
    sender: UnboundedSender<ServerMessage>,
    pub authenticated: bool,
    pub subscribed_session_ids: HashSet<String>,
    pub deleted_sessions: HashSet<String>,
    pub recent_sessions_limit: u32,
    pub working_directory: Option<String>,
}

const DEFAULT_RECENT_SESSIONS_LIMIT: u32 = 5;

impl Connection {
    pub fn new(id: ConnectionId, sender: UnboundedSender<ServerMessage>) -> Self {
        Self {
            id,
            sender,
            authenticated: false,
            subscribed_session_ids: HashSet::new(),
            deleted_sessions: HashSet::new(),
            recent_sessions_limit: DEFAULT_RECENT_SESSIONS_LIMIT,
            working_directory: None,
        }
    }

    /// Enqueue `message` for delivery. Failures (the writer task has
    /// exited) are the caller's cue to let the connection get reaped on
    /// the next table sweep (§4.1 "Failure semantics") rather than an
    /// error to propagate.
    pub fn send(&self, message: ServerMessage) {
        if self.sender.send(message).is_err() {
            tracing::debug!(connection = ?self.id, "dropping message: writer task gone");
        }
    }

    pub fn wants_session(&self, session_id: &str) -> bool {
        self.authenticated && !self.deleted_sessions.contains(session_id)
    }
}

/// Process-wide connection registry, guarded by a single `RwLock` scoped
/// to this structure only — no global server lock (§5). Every operation is
/// a quick in-memory mutation or channel send, so a blocking `std` lock is
/// held only across non-suspending work.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Connection>> {
        self.inner.read().expect("connection table lock poisoned")
    }

    #[allow(clippy::expect_used)]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Connection>> {
        self.inner.write().expect("connection table lock poisoned")
    }

    pub fn insert(&self, connection: Connection) {
        self.write().insert(connection.id, connection);
    }

    pub fn remove(&self, id: ConnectionId) {
        self.write().remove(&id);
    }

    pub fn mutate<F, R>(&self, id: ConnectionId, f: F) -> Option<R>
    where
        F: FnOnce(&mut Connection) -> R,
    {
        self.write().get_mut(&id).map(f)
    }

    /// Send `message` to every authenticated connection that has not
    /// deleted `session_id` (§4.1 "Broadcast", §3 invariants).
    pub fn broadcast_for_session(&self, session_id: &str, message: ServerMessage) {
        for connection in self.read().values() {
            if connection.wants_session(session_id) {
                connection.send(message.clone());
            }
        }
    }

    /// Send `message` to every authenticated connection, regardless of
    /// `deleted_sessions` (used for session-agnostic broadcasts such as
    /// `workstream_*` events).
    pub fn broadcast(&self, message: ServerMessage) {
        for connection in self.read().values() {
            if connection.authenticated {
                connection.send(message.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }
}
