//! Per-connection handler: writer task, read loop, and close cleanup.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Attach to the switchboard → the session layer can now reach us
//!   2. Spawn the writer → drains the switchboard line into the socket
//!   3. Loop: receive frames → hand each one to the session manager
//!   4. On exit: detach and report the close to the session manager
//!
//! The read loop also stops when the writer does, so a kick or eviction
//! (which closes the line) ends the whole connection.

use std::sync::Arc;

use hallgate_protocol::{Codec, Frame};
use hallgate_session::HallStore;
use hallgate_transport::{Connection, ConnectionId, Outgoing, WebSocketConnection};
use tokio::sync::mpsc;

use crate::server::ServerState;
use crate::HallError;

/// Drop guard that detaches the connection and ends its session when the
/// handler exits.
///
/// This ensures cleanup happens even if the handler panics. Since `Drop`
/// is synchronous, the session side runs in a fire-and-forget task.
struct ConnectionGuard<S: HallStore, C: Codec> {
    conn_id: ConnectionId,
    state: Arc<ServerState<S, C>>,
}

impl<S: HallStore, C: Codec> Drop for ConnectionGuard<S, C> {
    fn drop(&mut self) {
        let conn_id = self.conn_id;
        self.state.switchboard.detach(conn_id);
        let sessions = self.state.sessions.clone();
        tokio::spawn(async move {
            sessions.on_connection_closed(conn_id).await;
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<S, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<S, C>>,
) -> Result<(), HallError>
where
    S: HallStore,
    C: Codec,
{
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let outbox = state.switchboard.attach(conn_id);
    let _guard = ConnectionGuard {
        conn_id,
        state: Arc::clone(&state),
    };
    let mut writer = tokio::spawn(write_loop(Arc::clone(&conn), outbox));

    let result = loop {
        let data = tokio::select! {
            received = conn.recv() => match received {
                Ok(Some(data)) => data,
                Ok(None) => {
                    tracing::debug!(%conn_id, "connection closed by peer");
                    break Ok(());
                }
                Err(e) => break Err(HallError::Transport(e)),
            },
            _ = &mut writer => {
                tracing::debug!(%conn_id, "connection closed by server");
                break Ok(());
            }
        };

        let frame: Frame = match state.codec.decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "failed to decode frame");
                continue;
            }
        };

        tracing::trace!(%conn_id, msg_id = %frame.msg_id, "frame received");
        state.sessions.dispatch(conn_id, frame).await;
    };

    // _guard drops here → line detached, writer's channel closes, session ends.
    result
}

/// Writes queued frames to the socket until the server asks for the
/// connection to be closed or the line is detached, then closes the socket.
async fn write_loop(conn: Arc<WebSocketConnection>, mut outbox: mpsc::Receiver<Outgoing>) {
    let conn_id = conn.id();
    while let Some(item) = outbox.recv().await {
        match item {
            Outgoing::Frame(bytes) => {
                if let Err(e) = conn.send(&bytes).await {
                    tracing::debug!(%conn_id, error = %e, "send failed, stopping writer");
                    return;
                }
            }
            Outgoing::Close => break,
        }
    }

    // Also reached when a close request found the line full.
    if let Err(e) = conn.close().await {
        tracing::debug!(%conn_id, error = %e, "close handshake failed");
    }
}
