//! The connection registry: who is connected where.
//!
//! Two indexes over the same sessions, `connection → session` and
//! `user → session`, kept as a bijection. Both live behind one
//! reader/writer lock so no reader can observe one index updated and the
//! other not. Every method takes the lock exactly once; there is no
//! read-then-write sequence a concurrent sweep or login could interleave
//! with.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hallgate_protocol::UserId;
use hallgate_transport::ConnectionId;

use crate::Session;

#[derive(Debug, Default)]
struct Indexes {
    by_connection: HashMap<ConnectionId, Arc<Session>>,
    by_user: HashMap<UserId, Arc<Session>>,
}

/// Concurrent bidirectional map between connections and sessions.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    indexes: RwLock<Indexes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic elsewhere can't leave the indexes half-written: every
    // mutation below completes before the guard drops.
    fn read(&self) -> RwLockReadGuard<'_, Indexes> {
        self.indexes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexes> {
        self.indexes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `session` under both its connection and its user id.
    ///
    /// Whatever previously occupied either slot is unlinked from both
    /// indexes in the same critical section and returned, so the caller
    /// can close and announce it. At most two sessions are displaced: the
    /// user's old session elsewhere, and another user's session on this
    /// connection.
    pub fn register(&self, session: Arc<Session>) -> Vec<Arc<Session>> {
        let user_id = session.user_id();
        let conn = session.connection();
        let mut displaced = Vec::new();

        let mut idx = self.write();
        if let Some(old) = idx.by_user.remove(&user_id) {
            idx.by_connection.remove(&old.connection());
            displaced.push(old);
        }
        if let Some(old) = idx.by_connection.remove(&conn) {
            idx.by_user.remove(&old.user_id());
            displaced.push(old);
        }
        idx.by_connection.insert(conn, Arc::clone(&session));
        idx.by_user.insert(user_id, session);
        displaced
    }

    /// O(1) lookup by connection.
    pub fn lookup_by_connection(&self, conn: ConnectionId) -> Option<Arc<Session>> {
        self.read().by_connection.get(&conn).cloned()
    }

    /// O(1) lookup by user.
    pub fn lookup_by_user(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.read().by_user.get(&user_id).cloned()
    }

    /// Removes whatever session is on `conn`. Idempotent.
    pub fn remove(&self, conn: ConnectionId) -> Option<Arc<Session>> {
        let mut idx = self.write();
        let session = idx.by_connection.remove(&conn)?;
        unlink_user(&mut idx, &session);
        Some(session)
    }

    /// Removes `session` only if it is still the one registered on its
    /// connection.
    ///
    /// The heartbeat sweep works from a snapshot; by the time it decides to
    /// evict, the connection may already carry a newer login. This keeps
    /// the sweep from tearing that one down.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut idx = self.write();
        let current = match idx.by_connection.get(&session.connection()) {
            Some(current) if Arc::ptr_eq(current, session) => Arc::clone(current),
            _ => return false,
        };
        idx.by_connection.remove(&current.connection());
        unlink_user(&mut idx, &current);
        true
    }

    /// Point-in-time copy of every active session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.read().by_connection.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().by_connection.is_empty()
    }

    /// Whether the two indexes describe the same set of sessions.
    ///
    /// Always `true` in correct operation; tests assert on it after
    /// concurrent workloads.
    pub fn is_consistent(&self) -> bool {
        let idx = self.read();
        idx.by_connection.len() == idx.by_user.len()
            && idx.by_connection.iter().all(|(conn, s)| {
                s.connection() == *conn
                    && idx
                        .by_user
                        .get(&s.user_id())
                        .is_some_and(|u| Arc::ptr_eq(u, s))
            })
    }
}

/// Drops the user-side entry for `session`, but only if it points at that
/// exact session.
fn unlink_user(idx: &mut Indexes, session: &Arc<Session>) {
    match idx.by_user.get(&session.user_id()) {
        Some(s) if Arc::ptr_eq(s, session) => {
            idx.by_user.remove(&session.user_id());
        }
        _ => {
            debug_assert!(false, "registry indexes diverged for {}", session.user_id());
            tracing::error!(
                user_id = %session.user_id(),
                conn_id = %session.connection(),
                "registry invariant violated: user index does not match connection index"
            );
        }
    }
}
