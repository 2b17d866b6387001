//! Error types for the session layer.

use hallgate_protocol::{ProtocolError, UserId};
use hallgate_transport::TransportError;

use crate::ServerIdentity;

/// Rejection text sent to the client when its token can't be resolved.
pub const ERR_TOKEN_INVALID: &str = "token invalid";

/// Rejection text sent to the client when its token routes elsewhere.
pub const ERR_WRONG_SERVER: &str = "wrong server";

/// Errors that can occur during session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The token is unknown to the hall, or its descriptor is unreadable.
    #[error("invalid login token")]
    InvalidToken,

    /// The token is valid but was issued for a different game server.
    #[error("user {user_id} routed to {found:?}, this server is {expected:?}")]
    ServerMismatch {
        user_id: UserId,
        expected: ServerIdentity,
        found: ServerIdentity,
    },

    /// The hall store failed to answer. Transient; never retried here.
    #[error("hall store lookup failed: {0}")]
    Storage(String),

    /// No active session exists for the given user.
    #[error("no session for user {0}")]
    NotFound(UserId),

    /// `login` and `heartbeat` are handled by the session layer itself.
    #[error("message id {0:?} is reserved")]
    ReservedMessageId(String),

    /// The task executor has stopped; nothing more can be queued.
    #[error("task queue closed")]
    QueueClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// The `errmsg` to put in a rejected `login` reply.
    ///
    /// Store failures look exactly like a missing token to the client.
    pub fn login_errmsg(&self) -> &'static str {
        match self {
            Self::ServerMismatch { .. } => ERR_WRONG_SERVER,
            _ => ERR_TOKEN_INVALID,
        }
    }
}
