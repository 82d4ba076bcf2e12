//! Message filter pipeline.
//!
//! Filters observe a transaction's transport and message boundaries in a
//! fixed order. Each invocation returns a [`FilterStatus`]; a filter may
//! also short-circuit the whole exchange by queueing a local reply on the
//! [`FilterContext`], which halts further handler invocation for that
//! boundary. Short-circuiting is an explicit control signal, never an
//! unwind.

use crate::{message::MessageMetadata, reply::LocalReply};

/// Control signal returned by each filter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Proceed to the next filter.
    Continue,
    /// Stop iterating; the filter will resume the exchange itself.
    StopIteration,
}

/// Boundary event presented to filters, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    TransportBegin,
    MessageBegin,
    MessageEnd,
    TransportEnd,
}

/// Per-invocation state shared between the transaction and its filters.
#[derive(Default)]
pub struct FilterContext {
    local_reply: Option<LocalReply>,
}

impl FilterContext {
    /// Queue a locally constructed response, short-circuiting the pipeline.
    pub fn send_local_reply(&mut self, reply: LocalReply) {
        if self.local_reply.is_none() {
            self.local_reply = Some(reply);
        }
    }

    /// Whether a local reply has been queued.
    #[must_use]
    pub fn local_reply_pending(&self) -> bool { self.local_reply.is_some() }

    /// Take the queued local reply, if any.
    pub fn take_local_reply(&mut self) -> Option<LocalReply> { self.local_reply.take() }
}

/// A handler observing transaction boundaries through one uniform entry
/// point.
pub trait MessageFilter: Send {
    /// Handle one boundary event for the current message.
    fn on_event(
        &mut self,
        boundary: Boundary,
        metadata: &mut MessageMetadata,
        ctx: &mut FilterContext,
    ) -> FilterStatus;
}

/// Ordered list of filters driven by a transaction.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn MessageFilter>>,
}

impl FilterChain {
    /// Build a chain from an ordered filter list.
    #[must_use]
    pub fn new(filters: Vec<Box<dyn MessageFilter>>) -> Self { Self { filters } }

    /// Number of installed filters.
    #[must_use]
    pub fn len(&self) -> usize { self.filters.len() }

    /// Whether the chain has no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.filters.is_empty() }

    /// Run one boundary event through the chain.
    ///
    /// If a local reply has already been sent for this transaction the
    /// chain is skipped entirely. If a filter queues a local reply,
    /// iteration stops and `Continue` is returned regardless of that
    /// filter's own status, so the caller can emit the reply and finalize.
    pub fn apply(
        &mut self,
        boundary: Boundary,
        metadata: &mut MessageMetadata,
        ctx: &mut FilterContext,
        local_reply_sent: bool,
    ) -> FilterStatus {
        if local_reply_sent {
            return FilterStatus::Continue;
        }

        for filter in &mut self.filters {
            let status = filter.on_event(boundary, metadata, ctx);
            if ctx.local_reply_pending() {
                return FilterStatus::Continue;
            }
            if status != FilterStatus::Continue {
                return status;
            }
        }

        FilterStatus::Continue
    }
}

/// Factory producing a fresh chain per transaction.
pub type FilterChainFactory = dyn Fn() -> FilterChain + Send + Sync;
