//! Pluggable handlers: custom message ids plus the join/leave slots.
//!
//! One reader/writer lock guards the whole table. Dispatch takes the read
//! side just long enough to clone the handler `Arc`, then runs the handler
//! with no lock held, so a handler may itself register or unregister
//! handlers without deadlocking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::future::BoxFuture;
use hallgate_protocol::{HeartbeatProbe, LoginRequest, Payload, UserId};
use hallgate_transport::ConnectionId;

use crate::SessionError;

/// Join/leave notification. Runs on the task executor.
pub type UserCallback = Arc<dyn Fn(UserId) + Send + Sync>;

/// Handler for a custom message id. Runs on the connection's read path and
/// is awaited before that connection's next frame is read.
pub type MessageHandler = Arc<dyn Fn(ConnectionId, Payload) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Table {
    messages: HashMap<String, MessageHandler>,
    user_joined: Option<UserCallback>,
    user_left: Option<UserCallback>,
}

/// The handler table.
#[derive(Default)]
pub struct CallbackRegistry {
    table: RwLock<Table>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `handler` to `msg_id`, replacing any earlier binding.
    ///
    /// Returns `true` if a previous handler was replaced.
    ///
    /// # Errors
    /// [`SessionError::ReservedMessageId`] for `login` and `heartbeat`,
    /// which never reach custom handlers.
    pub fn register_message_handler<F, Fut>(
        &self,
        msg_id: impl Into<String>,
        handler: F,
    ) -> Result<bool, SessionError>
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let msg_id = msg_id.into();
        if is_reserved(&msg_id) {
            return Err(SessionError::ReservedMessageId(msg_id));
        }
        let handler: MessageHandler =
            Arc::new(move |conn: ConnectionId, payload: Payload| -> BoxFuture<'static, ()> {
                Box::pin(handler(conn, payload))
            });
        let replaced = self.write().messages.insert(msg_id.clone(), handler).is_some();
        tracing::debug!(%msg_id, replaced, "message handler registered");
        Ok(replaced)
    }

    /// Removes the binding for `msg_id`. Returns whether one existed.
    pub fn unregister_message_handler(&self, msg_id: &str) -> bool {
        self.write().messages.remove(msg_id).is_some()
    }

    /// The handler currently bound to `msg_id`.
    pub fn message_handler(&self, msg_id: &str) -> Option<MessageHandler> {
        self.read().messages.get(msg_id).cloned()
    }

    /// Runs the handler bound to `msg_id`, if any. Returns whether one ran.
    pub async fn dispatch(&self, conn: ConnectionId, msg_id: &str, payload: Payload) -> bool {
        // The guard is dropped here, before the handler's future runs.
        let Some(handler) = self.message_handler(msg_id) else {
            return false;
        };
        handler(conn, payload).await;
        true
    }

    /// Sets the user-joined slot. Last writer wins.
    pub fn register_user_joined<F>(&self, callback: F)
    where
        F: Fn(UserId) + Send + Sync + 'static,
    {
        self.write().user_joined = Some(Arc::new(callback));
    }

    /// Sets the user-left slot. Last writer wins.
    pub fn register_user_left<F>(&self, callback: F)
    where
        F: Fn(UserId) + Send + Sync + 'static,
    {
        self.write().user_left = Some(Arc::new(callback));
    }

    pub fn user_joined(&self) -> Option<UserCallback> {
        self.read().user_joined.clone()
    }

    pub fn user_left(&self) -> Option<UserCallback> {
        self.read().user_left.clone()
    }
}

fn is_reserved(msg_id: &str) -> bool {
    msg_id == LoginRequest::MSG_ID || msg_id == HeartbeatProbe::MSG_ID
}
