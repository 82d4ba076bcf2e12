//! Handles to downstream connections.
//!
//! The downstream transport lives outside the core; the worker only holds
//! a cloneable [`DownstreamHandle`] representing "who is waiting for the
//! reply". Commands flow over an mpsc channel to whatever task owns the
//! socket. Sends never block the worker: a full channel drops the command
//! with a warning rather than stalling every other transaction.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

/// How to close the downstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Flush pending writes, then close.
    FlushWrite,
    /// Close immediately, discarding pending writes.
    NoFlush,
}

/// Command delivered to the downstream transport task.
#[derive(Debug)]
pub enum DownstreamCommand {
    /// Write bytes to the peer; `end_stream` half-closes after the write.
    Write { data: Bytes, end_stream: bool },
    /// Close the connection.
    Close(CloseMode),
    /// Notify the transport that a transaction was reset.
    Reset,
}

/// Identifier assigned to a downstream connection within a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DownstreamId(u64);

impl DownstreamId {
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    #[must_use]
    pub fn as_u64(self) -> u64 { self.0 }
}

impl std::fmt::Display for DownstreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "downstream-{}", self.0)
    }
}

/// Cloneable command handle to one downstream connection.
#[derive(Clone)]
pub struct DownstreamHandle {
    tx: mpsc::Sender<DownstreamCommand>,
}

impl DownstreamHandle {
    /// Create a handle and the receiver the transport task drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DownstreamCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Whether the transport side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.tx.is_closed() }

    /// Queue a write toward the peer.
    pub fn write(&self, data: Bytes, end_stream: bool) {
        self.send(DownstreamCommand::Write { data, end_stream });
    }

    /// Queue a close of the connection.
    pub fn close(&self, mode: CloseMode) { self.send(DownstreamCommand::Close(mode)); }

    /// Notify the transport of a transaction reset.
    pub fn reset(&self) { self.send(DownstreamCommand::Reset); }

    fn send(&self, command: DownstreamCommand) {
        if let Err(error) = self.tx.try_send(command) {
            match error {
                mpsc::error::TrySendError::Full(command) => {
                    warn!(?command, "downstream channel full, command dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_reaches_the_transport_task() {
        let (handle, mut rx) = DownstreamHandle::channel(4);
        handle.write(Bytes::from_static(b"hello"), false);

        match rx.recv().await {
            Some(DownstreamCommand::Write { data, end_stream }) => {
                assert_eq!(&data[..], b"hello");
                assert!(!end_stream);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed() {
        let (handle, rx) = DownstreamHandle::channel(1);
        drop(rx);
        assert!(handle.is_closed());
        // Sending into a closed channel is a quiet no-op.
        handle.close(CloseMode::NoFlush);
    }
}
