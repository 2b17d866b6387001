//! Transport abstraction layer for Hallgate.
//!
//! Provides the [`Transport`] and [`Connection`] traits that abstract over
//! the network listener, plus the [`ConnectionSink`] seam the session layer
//! uses to reach connections it doesn't own.
//!
//! # Ownership
//!
//! A [`Connection`] is owned by exactly one task (its reader). Everything
//! else addresses it by [`ConnectionId`] through a sink; the
//! [`Switchboard`] routes those frames to the task's writer half.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
mod switchboard;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use switchboard::{Outgoing, Switchboard, DEFAULT_LINE_CAPACITY};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Gracefully shuts down the transport, stopping new connections.
    async fn shutdown(&self) -> Result<(), Self::Error>;

    /// Returns the address the transport is listening on.
    fn local_addr(&self) -> std::io::Result<std::net::SocketAddr>;
}

/// A single connection that can send and receive bytes.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends data to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}

/// Delivers frames to connections by id, without owning them.
///
/// Both methods are synchronous and must not block: they are called from
/// the heartbeat sweep and the task executor, neither of which may stall on
/// a slow peer. Implementations queue the work for the connection's own
/// writer.
pub trait ConnectionSink: Send + Sync + 'static {
    /// Queues `data` for delivery to `conn`.
    ///
    /// # Errors
    /// [`TransportError::UnknownConnection`] if `conn` is not live.
    fn send_to(&self, conn: ConnectionId, data: Vec<u8>) -> Result<(), TransportError>;

    /// Asks the transport to close `conn`. Closing an unknown or already
    /// closed connection is a no-op.
    fn close(&self, conn: ConnectionId);
}

impl<T: ConnectionSink> ConnectionSink for std::sync::Arc<T> {
    fn send_to(&self, conn: ConnectionId, data: Vec<u8>) -> Result<(), TransportError> {
        (**self).send_to(conn, data)
    }

    fn close(&self, conn: ConnectionId) {
        (**self).close(conn)
    }
}
