//! Outbound fan-out keyed by connection id.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{ConnectionId, ConnectionSink, TransportError};

/// Work queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// An encoded frame to write to the socket.
    Frame(Vec<u8>),
    /// Close the socket. Nothing queued after this is written.
    Close,
}

/// Frames a line holds before sends to it fail with
/// [`TransportError::Backpressure`].
pub const DEFAULT_LINE_CAPACITY: usize = 1024;

/// Maps live connection ids to their writer channels.
///
/// The connection handler calls [`attach`](Self::attach) right after accept
/// and drains the returned receiver into the socket. Any other task can then
/// reach that socket through the [`ConnectionSink`] impl.
///
/// Each line is bounded. A client that stops reading fills its line and
/// further sends to it fail instead of growing memory without limit.
#[derive(Debug)]
pub struct Switchboard {
    lines: DashMap<ConnectionId, mpsc::Sender<Outgoing>>,
    capacity: usize,
}

impl Default for Switchboard {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LINE_CAPACITY)
    }
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A switchboard whose lines each hold up to `capacity` frames
    /// (at least 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers `conn` and returns the receiving end of its outbound queue.
    ///
    /// Attaching an id twice replaces the earlier line; the old receiver
    /// sees its channel close.
    pub fn attach(&self, conn: ConnectionId) -> mpsc::Receiver<Outgoing> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.lines.insert(conn, tx).is_some() {
            tracing::warn!(%conn, "connection re-attached to switchboard");
        }
        rx
    }

    /// Forgets `conn`. Idempotent.
    pub fn detach(&self, conn: ConnectionId) {
        self.lines.remove(&conn);
    }

    /// Whether `conn` currently has a line.
    pub fn is_attached(&self, conn: ConnectionId) -> bool {
        self.lines.contains_key(&conn)
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl ConnectionSink for Switchboard {
    fn send_to(&self, conn: ConnectionId, data: Vec<u8>) -> Result<(), TransportError> {
        // Clone the sender so the shard lock isn't held across the send.
        let line = self
            .lines
            .get(&conn)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::UnknownConnection(conn))?;
        line.try_send(Outgoing::Frame(data)).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure(conn),
            TrySendError::Closed(_) => TransportError::UnknownConnection(conn),
        })
    }

    /// Detaches `conn` and asks its writer to close the socket.
    ///
    /// On a full line the `Close` marker can't be queued; the writer then
    /// sees the channel end once it has drained what is there, and closes
    /// the socket all the same.
    fn close(&self, conn: ConnectionId) {
        if let Some((_, line)) = self.lines.remove(&conn) {
            if line.try_send(Outgoing::Close).is_err() {
                tracing::debug!(%conn, "close marker not queued, line full or gone");
            }
            tracing::debug!(%conn, "close requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(id: u64) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_send_to_attached_connection_queues_frame() {
        let board = Switchboard::new();
        let mut rx = board.attach(cid(1));

        board.send_to(cid(1), b"hi".to_vec()).expect("should queue");

        assert_eq!(rx.try_recv().unwrap(), Outgoing::Frame(b"hi".to_vec()));
    }

    #[test]
    fn test_send_to_unknown_connection_returns_error() {
        let board = Switchboard::new();

        let result = board.send_to(cid(9), b"hi".to_vec());

        assert!(matches!(
            result,
            Err(TransportError::UnknownConnection(c)) if c == cid(9)
        ));
    }

    #[test]
    fn test_send_to_dropped_receiver_returns_error() {
        let board = Switchboard::new();
        drop(board.attach(cid(1)));

        assert!(board.send_to(cid(1), b"hi".to_vec()).is_err());
    }

    #[test]
    fn test_close_queues_close_and_detaches() {
        let board = Switchboard::new();
        let mut rx = board.attach(cid(1));

        board.close(cid(1));

        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close);
        assert!(!board.is_attached(cid(1)));
        assert!(board.send_to(cid(1), b"late".to_vec()).is_err());
    }

    #[test]
    fn test_full_line_reports_backpressure() {
        let board = Switchboard::with_capacity(2);
        let mut rx = board.attach(cid(1));

        board.send_to(cid(1), b"a".to_vec()).unwrap();
        board.send_to(cid(1), b"b".to_vec()).unwrap();
        let result = board.send_to(cid(1), b"c".to_vec());

        assert!(matches!(
            result,
            Err(TransportError::Backpressure(c)) if c == cid(1)
        ));
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Frame(b"a".to_vec()));
        board.send_to(cid(1), b"d".to_vec()).expect("room again after a read");
    }

    #[test]
    fn test_close_on_full_line_still_ends_writer() {
        let board = Switchboard::with_capacity(1);
        let mut rx = board.attach(cid(1));
        board.send_to(cid(1), b"a".to_vec()).unwrap();

        board.close(cid(1));

        assert!(!board.is_attached(cid(1)));
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Frame(b"a".to_vec()));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let board = Switchboard::with_capacity(0);
        let _rx = board.attach(cid(1));

        assert_eq!(board.capacity(), 1);
        board.send_to(cid(1), b"a".to_vec()).unwrap();
        assert!(board.send_to(cid(1), b"b".to_vec()).is_err());
    }

    #[test]
    fn test_close_unknown_connection_is_noop() {
        let board = Switchboard::new();
        board.close(cid(3));
        assert!(board.is_empty());
    }

    #[test]
    fn test_detach_is_idempotent() {
        let board = Switchboard::new();
        let _rx = board.attach(cid(1));
        assert_eq!(board.len(), 1);

        board.detach(cid(1));
        board.detach(cid(1));

        assert!(board.is_empty());
    }
}
