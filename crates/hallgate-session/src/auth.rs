//! Login validation against the hall store.
//!
//! ```text
//! Unauthenticated ──login──▶ Authenticating ──▶ Authenticated
//!                                  │
//!                                  └──────────▶ Rejected
//! ```
//!
//! [`Authenticator::authenticate`] only *reads*. It returns a fully built
//! [`Session`] or an error and never touches the registry, so a rejected
//! login leaves no trace behind.

use hallgate_transport::ConnectionId;

use crate::store::{token_key, user_data_key};
use crate::{HallStore, ServerIdentity, Session, SessionError, TokenDescriptor, UserProfile};

/// Turns hall login tokens into sessions for this server.
pub struct Authenticator<S: HallStore> {
    store: S,
    project: String,
    identity: ServerIdentity,
}

impl<S: HallStore> Authenticator<S> {
    pub fn new(store: S, project: impl Into<String>, identity: ServerIdentity) -> Self {
        Self {
            store,
            project: project.into(),
            identity,
        }
    }

    /// The routing identity tokens must carry to be accepted here.
    pub fn identity(&self) -> ServerIdentity {
        self.identity
    }

    /// Validates `token` and builds a session bound to `conn`.
    ///
    /// # Errors
    /// - [`SessionError::InvalidToken`]: unknown token or unreadable
    ///   descriptor.
    /// - [`SessionError::ServerMismatch`]: token routed to another server.
    /// - [`SessionError::Storage`]: the hall store didn't answer.
    pub async fn authenticate(
        &self,
        conn: ConnectionId,
        token: &str,
    ) -> Result<Session, SessionError> {
        let raw = self
            .store
            .get(&token_key(&self.project, token))
            .await?
            .ok_or(SessionError::InvalidToken)?;

        let descriptor: TokenDescriptor = serde_json::from_slice(&raw).map_err(|e| {
            tracing::warn!(%conn, error = %e, "unreadable token descriptor");
            SessionError::InvalidToken
        })?;

        let found = descriptor.identity();
        if found != self.identity {
            return Err(SessionError::ServerMismatch {
                user_id: descriptor.user_id,
                expected: self.identity,
                found,
            });
        }

        let fields = self
            .store
            .hgetall(&user_data_key(&self.project, descriptor.user_id))
            .await?;
        let profile = UserProfile::from_fields(descriptor.user_id, &fields);

        Ok(Session::new(profile, conn))
    }
}
