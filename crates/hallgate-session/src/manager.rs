//! The session manager: the one object the server talks to.
//!
//! ```text
//!               ┌──────────────── SessionManager ────────────────┐
//! frames ──────▶│ dispatch ─┬─ login ────▶ Authenticator          │
//!               │           ├─ heartbeat ─▶ reset counter         │
//!               │           └─ other ────▶ CallbackRegistry       │
//!               │                                                 │
//!               │  ConnectionRegistry ◀── HeartbeatMonitor (timer)│
//!               │        │                                        │
//!               │        └── UserJoined / UserLeft ──▶ TaskQueue ─┼──▶ Executor
//!               └─────────────────────────────────────────────────┘
//! ```
//!
//! Every registry change that game code can observe is followed by exactly
//! one queued `UserJoined` or `UserLeft`. The registry's `remove_session`
//! decides who wins when a logout, a kick and a sweep race for the same
//! session: only the caller that actually unlinked it announces the leave.

use std::sync::{Arc, Mutex, PoisonError};

use hallgate_protocol::{Codec, Frame, HeartbeatProbe, LoginReply, LoginRequest, Payload, UserId};
use hallgate_transport::{ConnectionId, ConnectionSink};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    task_queue, Authenticator, CallbackRegistry, ConnectionRegistry, HallStore, HeartbeatMonitor,
    ServerIdentity, Session, SessionConfig, SessionError, Task, TaskQueue, UserProfile,
};

/// Everything a [`SessionManager`] needs from the outside world.
pub struct HallContext<S, K, C> {
    /// Where login tokens and account data are read from.
    pub store: S,
    /// How frames reach connections the manager doesn't own.
    pub sink: K,
    /// Wire format for outgoing frames.
    pub codec: C,
    /// The routing identity tokens must match.
    pub identity: ServerIdentity,
    pub config: SessionConfig,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// State shared between the manager and the heartbeat monitor.
pub(crate) struct Hub<K, C> {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) queue: TaskQueue,
    sink: K,
    codec: C,
}

impl<K: ConnectionSink, C: Codec> Hub<K, C> {
    fn encode<T: Serialize>(&self, msg_id: &str, body: &T) -> Result<Vec<u8>, SessionError> {
        let frame = Frame::with(msg_id, body)?;
        Ok(self.codec.encode(&frame)?)
    }

    /// Encodes `body` as a `msg_id` frame and queues it for `conn`.
    pub(crate) fn send<T: Serialize>(
        &self,
        conn: ConnectionId,
        msg_id: &str,
        body: &T,
    ) -> Result<(), SessionError> {
        let bytes = self.encode(msg_id, body)?;
        self.sink.send_to(conn, bytes)?;
        Ok(())
    }

    /// Unregisters the session and closes its connection.
    ///
    /// Returns `false` if the session was already gone or replaced, in
    /// which case whoever removed it has closed and announced it. The
    /// connection is left alone then: it may carry a newer login.
    pub(crate) async fn evict(&self, session: &Arc<Session>, reason: &'static str) -> bool {
        if !self.registry.remove_session(session) {
            return false;
        }
        self.sink.close(session.connection());
        tracing::info!(
            user_id = %session.user_id(),
            conn_id = %session.connection(),
            reason,
            "session evicted"
        );
        self.announce(Task::UserLeft(session.user_id())).await;
        true
    }

    async fn announce(&self, task: Task) {
        if let Err(e) = self.queue.enqueue(task).await {
            // Only happens during shutdown.
            tracing::warn!(error = %e, "dropping lifecycle task");
        }
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

struct Inner<S: HallStore, K, C> {
    hub: Arc<Hub<K, C>>,
    callbacks: Arc<CallbackRegistry>,
    auth: Authenticator<S>,
    config: SessionConfig,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the session lifecycle for one hall server.
///
/// Cheap to clone; every clone drives the same registry, queue and
/// callbacks.
pub struct SessionManager<S: HallStore, K: ConnectionSink, C: Codec> {
    inner: Arc<Inner<S, K, C>>,
}

impl<S: HallStore, K: ConnectionSink, C: Codec> Clone for SessionManager<S, K, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: HallStore, K: ConnectionSink, C: Codec> SessionManager<S, K, C> {
    /// Builds the manager and spawns its task executor.
    ///
    /// Heartbeats are not started; call [`start_heartbeats`] or drive
    /// [`heartbeat_monitor`] sweeps by hand.
    ///
    /// # Panics
    /// Outside a Tokio runtime.
    ///
    /// [`start_heartbeats`]: Self::start_heartbeats
    /// [`heartbeat_monitor`]: Self::heartbeat_monitor
    pub fn new(ctx: HallContext<S, K, C>) -> Self {
        let config = ctx.config.validated();
        let callbacks = Arc::new(CallbackRegistry::new());
        let (queue, executor) = task_queue(config.queue_capacity, Arc::clone(&callbacks));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let executor = tokio::spawn(executor.run(shutdown_rx));

        tracing::info!(
            project = %config.project,
            game_id = ctx.identity.game_id,
            room_level = ctx.identity.room_level,
            server_id = ctx.identity.server_id,
            "session manager started"
        );

        Self {
            inner: Arc::new(Inner {
                hub: Arc::new(Hub {
                    registry: ConnectionRegistry::new(),
                    queue,
                    sink: ctx.sink,
                    codec: ctx.codec,
                }),
                callbacks,
                auth: Authenticator::new(ctx.store, config.project.clone(), ctx.identity),
                config,
                shutdown,
                workers: Mutex::new(vec![executor]),
            }),
        }
    }

    /// [`new`](Self::new) plus [`start_heartbeats`](Self::start_heartbeats).
    pub fn start(ctx: HallContext<S, K, C>) -> Self {
        let manager = Self::new(ctx);
        manager.start_heartbeats();
        manager
    }

    /// Spawns the heartbeat monitor on its own timer.
    pub fn start_heartbeats(&self) {
        let monitor = self.heartbeat_monitor();
        let handle = tokio::spawn(monitor.run(self.inner.shutdown.subscribe()));
        self.workers().push(handle);
    }

    /// A monitor over this manager's sessions, for running sweeps directly.
    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor<K, C> {
        HeartbeatMonitor::new(
            Arc::clone(&self.inner.hub),
            self.inner.config.heartbeat_interval,
            self.inner.config.heartbeat_threshold,
        )
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> ServerIdentity {
        self.inner.auth.identity()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.hub.registry
    }

    /// A producer handle for the task queue.
    pub fn task_queue(&self) -> TaskQueue {
        self.inner.hub.queue.clone()
    }

    // -- inbound ------------------------------------------------------------

    /// Routes one inbound frame from `conn`.
    ///
    /// `login` and `heartbeat` are handled here; any other id goes to the
    /// registered message handler, and is dropped if there is none.
    pub async fn dispatch(&self, conn: ConnectionId, frame: Frame) {
        match frame.msg_id.as_str() {
            LoginRequest::MSG_ID => self.handle_login(conn, &frame).await,
            HeartbeatProbe::MSG_ID => self.handle_heartbeat(conn),
            _ => {
                let Frame { msg_id, data } = frame;
                if !self.inner.callbacks.dispatch(conn, &msg_id, data).await {
                    tracing::debug!(%conn, %msg_id, "no handler for message");
                }
            }
        }
    }

    async fn handle_login(&self, conn: ConnectionId, frame: &Frame) {
        let hub = &self.inner.hub;

        let result = match frame.parse::<LoginRequest>() {
            Ok(request) => self.inner.auth.authenticate(conn, &request.token).await,
            Err(e) => {
                tracing::debug!(%conn, error = %e, "malformed login payload");
                Err(SessionError::InvalidToken)
            }
        };

        let session = match result {
            Ok(session) => Arc::new(session),
            Err(err) => {
                match &err {
                    SessionError::Storage(_) => tracing::warn!(%conn, error = %err, "login failed"),
                    _ => tracing::info!(%conn, error = %err, "login rejected"),
                }
                let reply = LoginReply::rejected(err.login_errmsg());
                if let Err(e) = hub.send(conn, LoginReply::MSG_ID, &reply) {
                    tracing::debug!(%conn, error = %e, "login rejection not delivered");
                }
                return;
            }
        };

        // The ack is queued before the session becomes visible to sweeps,
        // so it always reaches the client ahead of the first probe.
        let user_id = session.user_id();
        let reply = LoginReply::Accepted {
            user_id,
            reconnect_token: session.reconnect_token().to_string(),
        };
        if let Err(e) = hub.send(conn, LoginReply::MSG_ID, &reply) {
            // The connection went away while we were authenticating.
            tracing::debug!(%conn, %user_id, error = %e, "login accepted on a dead connection");
            return;
        }

        let displaced = hub.registry.register(session);
        for old in displaced {
            if old.connection() != conn {
                hub.sink.close(old.connection());
            }
            tracing::info!(
                user_id = %old.user_id(),
                old_conn = %old.connection(),
                new_conn = %conn,
                "session replaced by new login"
            );
            hub.announce(Task::UserLeft(old.user_id())).await;
        }

        tracing::info!(%conn, %user_id, "user logged in");
        hub.announce(Task::UserJoined(user_id)).await;
    }

    fn handle_heartbeat(&self, conn: ConnectionId) {
        match self.inner.hub.registry.lookup_by_connection(conn) {
            Some(session) => session.reset_heartbeat(),
            None => tracing::debug!(%conn, "heartbeat from unauthenticated connection"),
        }
    }

    /// Tells the manager the transport has closed `conn`.
    ///
    /// Returns the user that was logged in on it, if any. Closing an
    /// unauthenticated or already cleaned-up connection does nothing.
    pub async fn on_connection_closed(&self, conn: ConnectionId) -> Option<UserId> {
        let session = self.inner.hub.registry.remove(conn)?;
        let user_id = session.user_id();
        tracing::info!(%conn, %user_id, "user disconnected");
        self.inner.hub.announce(Task::UserLeft(user_id)).await;
        Some(user_id)
    }

    // -- callbacks ----------------------------------------------------------

    /// See [`CallbackRegistry::register_message_handler`].
    pub fn register_message_handler<F, Fut>(
        &self,
        msg_id: impl Into<String>,
        handler: F,
    ) -> Result<bool, SessionError>
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.callbacks.register_message_handler(msg_id, handler)
    }

    pub fn unregister_message_handler(&self, msg_id: &str) -> bool {
        self.inner.callbacks.unregister_message_handler(msg_id)
    }

    /// Sets the callback run on the executor after each successful login.
    pub fn register_user_joined<F>(&self, callback: F)
    where
        F: Fn(UserId) + Send + Sync + 'static,
    {
        self.inner.callbacks.register_user_joined(callback);
    }

    /// Sets the callback run on the executor after each session ends.
    pub fn register_user_left<F>(&self, callback: F)
    where
        F: Fn(UserId) + Send + Sync + 'static,
    {
        self.inner.callbacks.register_user_left(callback);
    }

    // -- queries ------------------------------------------------------------

    /// The profile captured when `user_id` logged in.
    pub fn lookup_user_profile(&self, user_id: UserId) -> Option<UserProfile> {
        self.session(user_id).map(|s| s.profile().clone())
    }

    pub fn session(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.inner.hub.registry.lookup_by_user(user_id)
    }

    pub fn session_for(&self, conn: ConnectionId) -> Option<Arc<Session>> {
        self.inner.hub.registry.lookup_by_connection(conn)
    }

    // -- outbound -----------------------------------------------------------

    /// Disconnects `user_id`. Returns `false` if they weren't logged in.
    pub async fn kick_user(&self, user_id: UserId) -> bool {
        match self.session(user_id) {
            Some(session) => self.inner.hub.evict(&session, "kicked").await,
            None => false,
        }
    }

    /// Sends a `msg_id` frame to `user_id`. Returns whether it was queued.
    pub fn send_to_user<T: Serialize>(&self, user_id: UserId, msg_id: &str, body: &T) -> bool {
        match self.try_send_to_user(user_id, msg_id, body) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(%user_id, %msg_id, error = %e, "send to user failed");
                false
            }
        }
    }

    /// Like [`send_to_user`](Self::send_to_user), saying why nothing was
    /// queued.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] if `user_id` isn't logged in.
    /// - [`SessionError::Protocol`] if `body` isn't a JSON object.
    /// - [`SessionError::Transport`] if the connection is gone or its
    ///   outbound line is full.
    pub fn try_send_to_user<T: Serialize>(
        &self,
        user_id: UserId,
        msg_id: &str,
        body: &T,
    ) -> Result<(), SessionError> {
        let session = self.session(user_id).ok_or(SessionError::NotFound(user_id))?;
        self.inner.hub.send(session.connection(), msg_id, body)
    }

    /// Sends a `msg_id` frame to every logged-in user. Returns how many
    /// sessions it was queued for.
    pub fn broadcast_to_all<T: Serialize>(&self, msg_id: &str, body: &T) -> usize {
        let hub = &self.inner.hub;
        let bytes = match hub.encode(msg_id, body) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%msg_id, error = %e, "broadcast not encodable");
                return 0;
            }
        };

        hub.registry
            .sessions()
            .iter()
            .filter(|s| hub.sink.send_to(s.connection(), bytes.clone()).is_ok())
            .count()
    }

    // -- task queue ---------------------------------------------------------

    /// Queues `f` to run on the executor, after everything already queued.
    pub async fn invoke<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.hub.queue.invoke(f).await
    }

    /// Resolves once every task queued so far has run.
    pub async fn flush(&self) -> Result<(), SessionError> {
        self.inner.hub.queue.flush().await
    }

    // -- lifecycle ----------------------------------------------------------

    /// Stops the heartbeat monitor, runs the tasks already queued, and
    /// waits for both to finish. Sessions are left registered.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let workers = std::mem::take(&mut *self.workers());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "session worker ended abnormally");
            }
        }
        tracing::info!("session manager stopped");
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
