//! `HallServer` builder and accept loop.
//!
//! This is the entry point for running a hall server. It ties together all
//! the layers: transport → protocol → session.

use std::future::Future;
use std::sync::Arc;

use hallgate_protocol::{Codec, JsonCodec};
use hallgate_session::{HallContext, HallStore, ServerIdentity, SessionConfig, SessionManager};
use hallgate_transport::{Switchboard, Transport, WebSocketTransport, DEFAULT_LINE_CAPACITY};

use crate::handler::handle_connection;
use crate::HallError;

/// The session manager as the server wires it: outbound frames go through
/// the switchboard.
pub type HallSessions<S, C = JsonCodec> = SessionManager<S, Arc<Switchboard>, C>;

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<S: HallStore, C: Codec> {
    pub(crate) switchboard: Arc<Switchboard>,
    pub(crate) sessions: HallSessions<S, C>,
    pub(crate) codec: C,
}

/// Builder for configuring and starting a hall server.
///
/// # Example
///
/// ```rust,ignore
/// use hallgate::prelude::*;
///
/// let server = HallServerBuilder::new()
///     .bind("0.0.0.0:8080")
///     .identity(ServerIdentity { game_id: 1, room_level: 1, server_id: 1 })
///     .build(MemoryStore::new())
///     .await?;
/// server.sessions().register_user_joined(|id| println!("{id} joined"));
/// server.run().await
/// ```
pub struct HallServerBuilder {
    bind_addr: String,
    identity: ServerIdentity,
    session_config: SessionConfig,
    outbound_capacity: usize,
}

impl HallServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            identity: ServerIdentity::default(),
            session_config: SessionConfig::default(),
            outbound_capacity: DEFAULT_LINE_CAPACITY,
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the routing identity login tokens must carry.
    pub fn identity(mut self, identity: ServerIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Sets the session configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Sets how many frames may wait for one connection's writer. Sends
    /// beyond that fail until the client catches up.
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Binds the listener and starts the session layer (executor and
    /// heartbeat monitor) against `store`.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    ///
    /// # Errors
    /// [`HallError::Transport`] if the address can't be bound.
    pub async fn build<S: HallStore>(self, store: S) -> Result<HallServer<S, JsonCodec>, HallError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;
        let switchboard = Arc::new(Switchboard::with_capacity(self.outbound_capacity));

        let sessions = SessionManager::start(HallContext {
            store,
            sink: Arc::clone(&switchboard),
            codec: JsonCodec,
            identity: self.identity,
            config: self.session_config,
        });

        let state = Arc::new(ServerState {
            switchboard,
            sessions,
            codec: JsonCodec,
        });

        Ok(HallServer { transport, state })
    }
}

impl Default for HallServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A hall server bound to its listener.
///
/// Register callbacks through [`sessions()`](Self::sessions), then call
/// [`run()`](Self::run) to start accepting connections.
pub struct HallServer<S: HallStore, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<S, C>>,
}

impl<S, C> HallServer<S, C>
where
    S: HallStore,
    C: Codec,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The session layer. Clone it to keep a handle after `run` takes the
    /// server.
    pub fn sessions(&self) -> &HallSessions<S, C> {
        &self.state.sessions
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), HallError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `signal` resolves, then stops accepting,
    /// shuts the session layer down and returns.
    ///
    /// Connections already open keep their tasks; they end when the peer
    /// goes away.
    pub async fn run_until(mut self, signal: impl Future<Output = ()>) -> Result<(), HallError> {
        tracing::info!(addr = ?self.local_addr().ok(), "hall server running");
        tokio::pin!(signal);

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                () = &mut signal => break,
            }
        }

        tracing::info!("hall server shutting down");
        self.transport.shutdown().await?;
        self.state.sessions.shutdown().await;
        Ok(())
    }
}
