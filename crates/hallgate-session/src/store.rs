//! The hall store: where login tokens and account data come from.
//!
//! The hall (an upstream service) writes two kinds of keys, and this crate
//! only ever reads them:
//!
//! ```text
//! {project}:hall:token:{token}       → JSON {UserId, GameId, RoomLevel, ServerId}
//! {project}:hall:user:data:{UserId}  → hash {SellerId, ChannelId, Amount, BankAmount}
//! ```
//!
//! [`HallStore`] is the seam: production code plugs in a client for the
//! real key/value service, tests and demos use [`MemoryStore`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use hallgate_protocol::UserId;
use serde::{Deserialize, Serialize};

use crate::{ServerIdentity, SessionError, UserProfile};

/// Read access to the hall's key/value store.
///
/// # Trait bounds
///
/// - `Send + Sync + 'static` → shared by every connection task for the
///   server's lifetime.
/// - The returned futures are `Send` so logins can run on any worker.
pub trait HallStore: Send + Sync + 'static {
    /// Fetches a string value. `Ok(None)` if the key doesn't exist.
    ///
    /// # Errors
    /// [`SessionError::Storage`] if the store can't be reached.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, SessionError>> + Send;

    /// Fetches every field of a hash. A missing key is an empty map.
    ///
    /// # Errors
    /// [`SessionError::Storage`] if the store can't be reached.
    fn hgetall(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, String>, SessionError>> + Send;
}

impl<T: HallStore> HallStore for Arc<T> {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, SessionError>> + Send {
        (**self).get(key)
    }

    fn hgetall(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, String>, SessionError>> + Send {
        (**self).hgetall(key)
    }
}

/// Key under which the hall stores a login token.
pub fn token_key(project: &str, token: &str) -> String {
    format!("{project}:hall:token:{token}")
}

/// Key under which the hall stores a user's account fields.
pub fn user_data_key(project: &str, user_id: UserId) -> String {
    format!("{project}:hall:user:data:{}", user_id.0)
}

/// What the hall records against a login token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenDescriptor {
    pub user_id: UserId,
    #[serde(default)]
    pub game_id: i64,
    #[serde(default)]
    pub room_level: i64,
    #[serde(default)]
    pub server_id: i64,
}

impl TokenDescriptor {
    /// The server the hall routed this token to.
    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity {
            game_id: self.game_id,
            room_level: self.room_level,
            server_id: self.server_id,
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Entry {
    Value(Vec<u8>),
    Hash(HashMap<String, String>),
}

/// An in-process [`HallStore`].
///
/// Stands in for the hall in tests and the demo binary. The write helpers
/// mirror what the hall does when it sends a user to this server.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Entry::Value(value.into()));
    }

    pub fn hset_all(&self, key: impl Into<String>, fields: HashMap<String, String>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Entry::Hash(fields));
    }

    pub fn del(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Records `token` as routing `descriptor.user_id` to the server in
    /// `descriptor`.
    pub fn issue_token(&self, project: &str, token: &str, descriptor: &TokenDescriptor) {
        match serde_json::to_vec(descriptor) {
            Ok(json) => self.set(token_key(project, token), json),
            Err(e) => tracing::error!(error = %e, "failed to encode token descriptor"),
        }
    }

    /// Writes the account fields for `profile.user_id`.
    pub fn put_profile(&self, project: &str, profile: &UserProfile) {
        self.hset_all(user_data_key(project, profile.user_id), profile.to_fields());
    }

    fn lookup(&self, key: &str) -> Option<Entry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl HallStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionError> {
        match self.lookup(key) {
            Some(Entry::Value(v)) => Ok(Some(v)),
            Some(Entry::Hash(_)) => Err(SessionError::Storage(format!(
                "{key} holds a hash, not a value"
            ))),
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, SessionError> {
        match self.lookup(key) {
            Some(Entry::Hash(h)) => Ok(h),
            Some(Entry::Value(_)) => Err(SessionError::Storage(format!(
                "{key} holds a value, not a hash"
            ))),
            None => Ok(HashMap::new()),
        }
    }
}
