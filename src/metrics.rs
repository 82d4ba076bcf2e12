//! Metric helpers for `sipframe`.
//!
//! This module defines metric names and simple helper functions wrapping
//! the [`metrics`](https://docs.rs/metrics) crate. With the `metrics`
//! feature disabled every helper compiles to a no-op so call sites stay
//! unconditional.

/// Name of the counter tracking requests received from downstream.
pub const REQUESTS: &str = "sipframe_requests_total";
/// Name of the counter tracking responses relayed from upstream.
pub const RESPONSES: &str = "sipframe_responses_total";
/// Name of the counter tracking locally generated replies, by class.
pub const LOCAL_REPLIES: &str = "sipframe_local_replies_total";
/// Name of the counter tracking messages with no matching route.
pub const ROUTE_MISSING: &str = "sipframe_route_missing_total";
/// Name of the counter tracking picks against unknown clusters.
pub const UNKNOWN_CLUSTER: &str = "sipframe_unknown_cluster_total";
/// Name of the counter tracking picks refused by maintenance mode.
pub const MAINTENANCE_MODE: &str = "sipframe_upstream_rq_maintenance_mode_total";
/// Name of the counter tracking clusters with no healthy host.
pub const NO_HEALTHY_UPSTREAM: &str = "sipframe_no_healthy_upstream_total";
/// Name of the counter tracking downstream closes with active transactions.
pub const CX_DESTROY_WITH_ACTIVE: &str = "sipframe_cx_destroy_with_active_rq_total";
/// Name of the gauge tracking live (non-deleted) transactions.
pub const TRANSACTIONS_ACTIVE: &str = "sipframe_transactions_active";

/// Classification label for a local reply.
#[derive(Clone, Copy)]
pub enum ReplyLabel {
    Success,
    Error,
    Exception,
}

impl ReplyLabel {
    fn as_str(self) -> &'static str {
        match self {
            ReplyLabel::Success => "success",
            ReplyLabel::Error => "error",
            ReplyLabel::Exception => "exception",
        }
    }
}

/// Record a downstream request.
pub fn inc_requests() {
    #[cfg(feature = "metrics")]
    metrics::counter!(REQUESTS).increment(1);
}

/// Record a relayed upstream response.
pub fn inc_responses() {
    #[cfg(feature = "metrics")]
    metrics::counter!(RESPONSES).increment(1);
}

/// Record a locally generated reply of the given class.
pub fn inc_local_replies(label: ReplyLabel) {
    #[cfg(feature = "metrics")]
    metrics::counter!(LOCAL_REPLIES, "class" => label.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = label.as_str();
}

/// Record a message that matched no route entry.
pub fn inc_route_missing() {
    #[cfg(feature = "metrics")]
    metrics::counter!(ROUTE_MISSING).increment(1);
}

/// Record a pick against an unconfigured cluster.
pub fn inc_unknown_cluster() {
    #[cfg(feature = "metrics")]
    metrics::counter!(UNKNOWN_CLUSTER).increment(1);
}

/// Record a pick refused by maintenance mode.
pub fn inc_maintenance_mode() {
    #[cfg(feature = "metrics")]
    metrics::counter!(MAINTENANCE_MODE).increment(1);
}

/// Record a cluster with no healthy host.
pub fn inc_no_healthy_upstream() {
    #[cfg(feature = "metrics")]
    metrics::counter!(NO_HEALTHY_UPSTREAM).increment(1);
}

/// Record a downstream close that aborted active transactions.
pub fn inc_cx_destroy_with_active() {
    #[cfg(feature = "metrics")]
    metrics::counter!(CX_DESTROY_WITH_ACTIVE).increment(1);
}

/// Increment the live transaction gauge.
pub fn inc_transactions() {
    #[cfg(feature = "metrics")]
    metrics::gauge!(TRANSACTIONS_ACTIVE).increment(1.0);
}

/// Decrement the live transaction gauge.
pub fn dec_transactions() {
    #[cfg(feature = "metrics")]
    metrics::gauge!(TRANSACTIONS_ACTIVE).decrement(1.0);
}
