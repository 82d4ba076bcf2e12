//! Upstream request state machine.
//!
//! An [`UpstreamRequest`] manages one pooled connection to one destination
//! host. It is created when routing first resolves that host and is kept
//! in the registry's per-host map so later transactions to the same host
//! reuse it. Messages written before the pool grants a connection are
//! buffered and flushed in arrival order; buffering is mandatory, an early
//! write must never be rejected or reordered.

use std::{collections::VecDeque, io};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    codec::{MessageDecoder, SignalingCodec},
    error::{PoolFailure, Result},
    message::MessageMetadata,
};

/// Connection state of an upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No pool acquisition has been issued yet.
    NotConnected,
    /// A pool acquisition is outstanding.
    Connecting,
    /// The pooled connection is usable.
    Connected,
    /// The connection was released or the peer closed it.
    Closed,
    /// The request was torn down after a failure.
    Reset,
}

/// One connection handed out by the upstream pool.
///
/// Dropping the box returns the connection to the pool without closing
/// it; `close` tears the transport down.
#[async_trait]
pub trait UpstreamConnection: Send {
    /// Write bytes to the upstream peer.
    async fn write(&mut self, data: Bytes, end_stream: bool) -> io::Result<()>;

    /// Close the underlying transport.
    async fn close(&mut self);
}

/// Asynchronous upstream connection pool.
///
/// Implementations deliver read bytes and close events for granted
/// connections as worker events; the core never polls sockets itself.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Acquire a connection to `host`.
    ///
    /// # Errors
    ///
    /// Returns a [`PoolFailure`] naming why no connection was granted.
    async fn acquire(&self, host: &str) -> std::result::Result<Box<dyn UpstreamConnection>, PoolFailure>;
}

/// Per-destination pooled-connection state machine.
pub struct UpstreamRequest {
    host: String,
    owner: String,
    state: ConnState,
    conn: Option<Box<dyn UpstreamConnection>>,
    pending: VecDeque<(Bytes, bool)>,
    inflight: usize,
    response_decoder: SignalingCodec,
    response_buf: BytesMut,
}

impl UpstreamRequest {
    /// Create a request for `host`, owned by the transaction that first
    /// resolved it.
    #[must_use]
    pub fn new(host: impl Into<String>, owner: impl Into<String>, codec: SignalingCodec) -> Self {
        Self {
            host: host.into(),
            owner: owner.into(),
            state: ConnState::NotConnected,
            conn: None,
            pending: VecDeque::new(),
            inflight: 0,
            response_decoder: codec,
            response_buf: BytesMut::new(),
        }
    }

    /// Destination host this request is bound to.
    #[must_use]
    pub fn host(&self) -> &str { &self.host }

    /// Transaction that created this request.
    #[must_use]
    pub fn owner(&self) -> &str { &self.owner }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnState { self.state }

    /// Whether messages are buffered or unanswered on this connection.
    #[must_use]
    pub fn has_outstanding(&self) -> bool { !self.pending.is_empty() || self.inflight > 0 }

    /// Begin connecting if no acquisition is outstanding yet.
    ///
    /// Returns `true` when the caller should issue the pool acquisition;
    /// at most one acquisition may ever be outstanding per request.
    pub fn begin_connect(&mut self) -> bool {
        if self.state == ConnState::NotConnected {
            self.state = ConnState::Connecting;
            true
        } else {
            false
        }
    }

    /// Write a message, buffering while the connection is not ready.
    ///
    /// # Errors
    ///
    /// Returns the transport error from the underlying write.
    pub async fn write(&mut self, data: Bytes, end_stream: bool) -> io::Result<()> {
        match self.state {
            ConnState::Connected => {
                let conn = self
                    .conn
                    .as_mut()
                    .expect("connected request always holds a connection");
                conn.write(data, end_stream).await?;
                self.inflight += 1;
                Ok(())
            }
            ConnState::NotConnected | ConnState::Connecting => {
                self.pending.push_back((data, end_stream));
                Ok(())
            }
            ConnState::Closed | ConnState::Reset => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "upstream request is torn down",
            )),
        }
    }

    /// Accept a granted connection and flush the pending queue in FIFO
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the transport error from a flush write; the request stays
    /// `Connected` and unflushed messages remain queued.
    pub async fn on_pool_ready(&mut self, conn: Box<dyn UpstreamConnection>) -> io::Result<()> {
        debug!(host = %self.host, queued = self.pending.len(), "upstream connection ready");
        self.conn = Some(conn);
        self.state = ConnState::Connected;

        while let Some((data, end_stream)) = self.pending.pop_front() {
            let conn = self
                .conn
                .as_mut()
                .expect("connected request always holds a connection");
            if let Err(error) = conn.write(data, end_stream).await {
                warn!(host = %self.host, %error, "flush to upstream failed");
                return Err(error);
            }
            self.inflight += 1;
        }
        Ok(())
    }

    /// Record a pool acquisition failure.
    pub fn on_pool_failure(&mut self, reason: PoolFailure) {
        warn!(host = %self.host, %reason, "upstream pool failure");
        self.state = ConnState::Reset;
        self.pending.clear();
    }

    /// Record a peer-initiated close.
    ///
    /// Returns `true` when messages were still pending or in flight, in
    /// which case the owning transaction must be reset.
    pub fn on_peer_closed(&mut self) -> bool {
        let outstanding = self.has_outstanding();
        self.state = ConnState::Closed;
        self.conn = None;
        self.pending.clear();
        outstanding
    }

    /// Detach the pooled connection, optionally closing it.
    ///
    /// After release the request must be removed from the per-host reuse
    /// map so later lookups do not observe a stale handle.
    pub async fn release(&mut self, close: bool) {
        if let Some(mut conn) = self.conn.take() {
            if close {
                conn.close().await;
            }
        }
        self.state = ConnState::Closed;
        self.pending.clear();
    }

    /// Decode response messages from upstream bytes.
    ///
    /// Partial messages stay buffered until more bytes arrive. Each
    /// decoded response accounts for one in-flight request.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ProxyError::Protocol`] when the upstream
    /// bytes cannot be decoded; the caller converts this to an
    /// upstream-protocol error for the owning transaction.
    pub fn decode_responses(&mut self, data: &[u8]) -> Result<Vec<MessageMetadata>> {
        self.response_buf.extend_from_slice(data);
        let mut responses = Vec::new();
        while let Some(metadata) = self.response_decoder.decode(&mut self.response_buf)? {
            self.inflight = self.inflight.saturating_sub(1);
            responses.push(metadata);
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::RecordingConnection;

    fn request() -> UpstreamRequest {
        UpstreamRequest::new("10.0.0.5:5060", "t1", SignalingCodec::default())
    }

    #[tokio::test]
    async fn writes_before_connect_are_buffered_and_flushed_in_order() {
        let mut request = request();
        assert!(request.begin_connect());

        request.write(Bytes::from_static(b"one"), false).await.unwrap();
        request.write(Bytes::from_static(b"two"), false).await.unwrap();
        assert_eq!(request.state(), ConnState::Connecting);

        let (conn, writes) = RecordingConnection::new();
        request.on_pool_ready(Box::new(conn)).await.unwrap();

        let written = writes.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(&written[0].0[..], b"one");
        assert_eq!(&written[1].0[..], b"two");
    }

    #[tokio::test]
    async fn only_one_acquisition_may_be_outstanding() {
        let mut request = request();
        assert!(request.begin_connect());
        assert!(!request.begin_connect());
    }

    #[tokio::test]
    async fn pool_failure_resets_and_clears_pending() {
        let mut request = request();
        request.begin_connect();
        request.write(Bytes::from_static(b"one"), false).await.unwrap();

        request.on_pool_failure(PoolFailure::Timeout);

        assert_eq!(request.state(), ConnState::Reset);
        assert!(!request.has_outstanding());
        assert!(request.write(Bytes::new(), false).await.is_err());
    }

    #[tokio::test]
    async fn peer_close_with_inflight_reports_outstanding() {
        let mut request = request();
        request.begin_connect();
        let (conn, _writes) = RecordingConnection::new();
        request.on_pool_ready(Box::new(conn)).await.unwrap();
        request.write(Bytes::from_static(b"one"), false).await.unwrap();

        assert!(request.on_peer_closed());
        assert_eq!(request.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn release_closes_when_asked() {
        let mut request = request();
        request.begin_connect();
        let (conn, _) = RecordingConnection::new();
        let closed = conn.closed_flag();
        request.on_pool_ready(Box::new(conn)).await.unwrap();

        request.release(true).await;

        assert!(closed.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(request.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn responses_decrement_inflight() {
        let mut request = request();
        request.begin_connect();
        let (conn, _) = RecordingConnection::new();
        request.on_pool_ready(Box::new(conn)).await.unwrap();
        request.write(Bytes::from_static(b"req"), false).await.unwrap();
        assert!(request.has_outstanding());

        let raw = concat!(
            "SIP/2.0 200 OK\r\n",
            "Via: SIP/2.0/TCP 10.0.0.1;branch=abc\r\n",
            "CSeq: 1 INVITE\r\n",
            "\r\n",
        );
        let responses = request.decode_responses(raw.as_bytes()).unwrap();
        assert_eq!(responses.len(), 1);
        assert!(!request.has_outstanding());
    }
}
