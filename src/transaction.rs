//! Active transaction state machine.
//!
//! An [`ActiveTransaction`] drives one request/response exchange: it runs
//! the local filter pipeline over the decoded request, hands routing off
//! to the worker, and emits the reply downstream once the upstream answers
//! (or a local reply short-circuits the exchange). Transactions never
//! re-route mid-flight; the route decision is computed once and cached.

use tracing::{debug, warn};

use crate::{
    codec::{MessageEncoder, SignalingEncoder},
    downstream::{DownstreamHandle, DownstreamId},
    error::{ProxyError, Result},
    filter::{Boundary, FilterChain, FilterContext, FilterStatus},
    message::{EditOp, MessageMetadata},
    metrics,
    reply::{LocalReply, ReplyClass},
};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    TransportBegin,
    MessageBegin,
    MessageEnd,
    TransportEnd,
    /// Routing is suspended on an assistant lookup for this key; the
    /// matched route index rides along for the resume.
    AwaitingAffinity { key: String, route: usize },
    /// The request was written (or queued) toward an upstream host.
    Dispatched,
    ResponseReceived,
    Replied,
    Reset,
}

/// Outcome of running the request boundaries through the filter chain.
#[derive(Debug)]
pub enum RequestPhase {
    /// All boundaries ran; routing may begin.
    Continue,
    /// A filter queued a local reply; the exchange is finished locally.
    LocalReply(LocalReply),
    /// A filter took over the exchange.
    Stopped,
}

/// One in-flight request/response exchange.
pub struct ActiveTransaction {
    id: String,
    downstream_id: DownstreamId,
    downstream: DownstreamHandle,
    state: TransactionState,
    metadata: MessageMetadata,
    chain: FilterChain,
    ctx: FilterContext,
    cached_route: Option<Option<usize>>,
    upstream_host: Option<String>,
    local_reply_sent: bool,
    reset_notified: bool,
}

impl ActiveTransaction {
    /// Create a transaction for a newly observed transaction identifier.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        downstream_id: DownstreamId,
        downstream: DownstreamHandle,
        metadata: MessageMetadata,
        chain: FilterChain,
    ) -> Self {
        Self {
            id: id.into(),
            downstream_id,
            downstream,
            state: TransactionState::Created,
            metadata,
            chain,
            ctx: FilterContext::default(),
            cached_route: None,
            upstream_host: None,
            local_reply_sent: false,
            reset_notified: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str { &self.id }

    #[must_use]
    pub fn downstream_id(&self) -> DownstreamId { self.downstream_id }

    #[must_use]
    pub fn state(&self) -> &TransactionState { &self.state }

    pub fn set_state(&mut self, state: TransactionState) { self.state = state; }

    #[must_use]
    pub fn metadata(&self) -> &MessageMetadata { &self.metadata }

    #[must_use]
    pub fn metadata_mut(&mut self) -> &mut MessageMetadata { &mut self.metadata }

    #[must_use]
    pub fn local_reply_sent(&self) -> bool { self.local_reply_sent }

    /// Route decision for this transaction, if already computed.
    ///
    /// `None` means not yet computed; `Some(None)` means computed with no
    /// matching route. Once computed the decision is reused for the life
    /// of the transaction.
    #[must_use]
    pub fn cached_route(&self) -> Option<Option<usize>> { self.cached_route }

    pub fn cache_route(&mut self, route: Option<usize>) {
        if self.cached_route.is_none() {
            self.cached_route = Some(route);
        }
    }

    /// Host of the upstream request this transaction is associated with.
    #[must_use]
    pub fn upstream_host(&self) -> Option<&str> { self.upstream_host.as_deref() }

    pub fn associate_upstream(&mut self, host: impl Into<String>) {
        self.upstream_host = Some(host.into());
    }

    /// Replace the current message for a follow-up wire message mapped to
    /// this transaction (an ACK or a retransmission), returning the
    /// previous one for the registry's message buffer.
    pub fn begin_message(&mut self, metadata: MessageMetadata) -> MessageMetadata {
        std::mem::replace(&mut self.metadata, metadata)
    }

    /// Run the four request boundaries through the filter pipeline.
    ///
    /// Filters already skipped because of an earlier local reply are
    /// treated as having run.
    pub fn run_request_boundaries(&mut self) -> RequestPhase {
        const BOUNDARIES: [(Boundary, TransactionState); 4] = [
            (Boundary::TransportBegin, TransactionState::TransportBegin),
            (Boundary::MessageBegin, TransactionState::MessageBegin),
            (Boundary::MessageEnd, TransactionState::MessageEnd),
            (Boundary::TransportEnd, TransactionState::TransportEnd),
        ];

        for (boundary, state) in BOUNDARIES {
            let status = self.chain.apply(
                boundary,
                &mut self.metadata,
                &mut self.ctx,
                self.local_reply_sent,
            );
            self.state = state;

            if let Some(reply) = self.ctx.take_local_reply() {
                return RequestPhase::LocalReply(reply);
            }
            if status == FilterStatus::StopIteration {
                return RequestPhase::Stopped;
            }
        }

        RequestPhase::Continue
    }

    /// Send a locally constructed response downstream.
    ///
    /// Further filter invocations for this transaction are skipped. When
    /// the downstream connection is already gone the write is suppressed
    /// and the transaction is simply finalized.
    pub fn send_local_reply(&mut self, reply: &LocalReply, own_ep: &str, end_stream: bool) {
        if !self.downstream.is_closed() {
            let buffer = reply.encode(&self.metadata, own_ep);
            self.downstream.write(buffer, end_stream);
        }

        self.local_reply_sent = true;
        self.state = TransactionState::Replied;
        metrics::inc_local_replies(match reply.class() {
            ReplyClass::SuccessReply => metrics::ReplyLabel::Success,
            ReplyClass::ErrorReply => metrics::ReplyLabel::Error,
            ReplyClass::Exception => metrics::ReplyLabel::Exception,
        });
        debug!(transaction = %self.id, status = reply.status(), "local reply sent");
    }

    /// Relay a decoded upstream response downstream.
    ///
    /// The response is re-stamped with this proxy's endpoint identifier
    /// and re-encoded before the write.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::DownstreamClosed`] when no peer remains to
    /// receive the response; the caller reclaims the transaction without
    /// writing.
    pub fn relay_upstream_response(
        &mut self,
        mut response: MessageMetadata,
        own_ep: &str,
    ) -> Result<()> {
        self.state = TransactionState::ResponseReceived;

        if self.downstream.is_closed() {
            warn!(transaction = %self.id, "downstream gone, dropping upstream response");
            return Err(ProxyError::DownstreamClosed);
        }

        response.set_ep(own_ep);
        response.push_edit(EditOp::InsertAfter {
            marker: format!("branch={}", self.id),
            value: format!(";ep={own_ep}"),
        });

        let buffer = SignalingEncoder.encode(&response);
        self.downstream.write(buffer, false);
        self.state = TransactionState::Replied;
        metrics::inc_responses();
        Ok(())
    }

    /// Tear the transaction down, notifying the downstream listener
    /// exactly once.
    pub fn on_reset(&mut self) {
        if !self.reset_notified {
            self.reset_notified = true;
            self.downstream.reset();
        }
        self.state = TransactionState::Reset;
    }
}
