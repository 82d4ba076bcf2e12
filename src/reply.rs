//! Locally generated replies.
//!
//! A local reply is a response synthesized by the proxy itself, either
//! because a filter short-circuited the pipeline or because an error made
//! forwarding impossible. Replies echo the originating message's `Via`
//! header so the downstream peer can correlate them by branch.

use bytes::Bytes;

use crate::{
    error::{PoolFailure, ProxyError, RoutingFailure},
    message::MessageMetadata,
};

/// Classification of a local reply for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// A deliberate success answer, e.g. from a filter.
    SuccessReply,
    /// A protocol-level failure answer.
    ErrorReply,
    /// An unexpected internal condition.
    Exception,
}

/// A response synthesized by the proxy.
#[derive(Debug, Clone)]
pub struct LocalReply {
    class: ReplyClass,
    status: u16,
    reason: String,
}

impl LocalReply {
    /// A success reply with the given status line.
    #[must_use]
    pub fn success(status: u16, reason: impl Into<String>) -> Self {
        Self {
            class: ReplyClass::SuccessReply,
            status,
            reason: reason.into(),
        }
    }

    /// An error reply with the given status line.
    #[must_use]
    pub fn error(status: u16, reason: impl Into<String>) -> Self {
        Self {
            class: ReplyClass::ErrorReply,
            status,
            reason: reason.into(),
        }
    }

    /// Map a runtime error to the reply sent downstream.
    #[must_use]
    pub fn from_error(error: &ProxyError) -> Self {
        match error {
            ProxyError::Protocol(what) => Self::error(400, what.clone()),
            ProxyError::Routing(RoutingFailure::RouteMissing) => Self::error(404, "no route"),
            ProxyError::Routing(failure) => Self::error(503, failure.as_str()),
            ProxyError::UpstreamConnect(PoolFailure::Timeout) => {
                Self::error(504, "upstream connect timeout")
            }
            ProxyError::UpstreamConnect(reason) => Self::error(503, reason.to_string()),
            ProxyError::UpstreamProtocol(what) => Self::error(502, what.clone()),
            ProxyError::DownstreamClosed | ProxyError::Io(_) => Self {
                class: ReplyClass::Exception,
                status: 500,
                reason: "internal error".into(),
            },
        }
    }

    /// Reply classification.
    #[must_use]
    pub fn class(&self) -> ReplyClass { self.class }

    /// Status code on the reply's start line.
    #[must_use]
    pub fn status(&self) -> u16 { self.status }

    /// Serialize the reply, echoing correlation headers from `metadata`
    /// and stamping the proxy's own endpoint.
    #[must_use]
    pub fn encode(&self, metadata: &MessageMetadata, own_ep: &str) -> Bytes {
        let mut text = format!("SIP/2.0 {} {}\r\n", self.status, self.reason);
        for line in metadata.raw_msg().split("\r\n") {
            if let Some((name, _)) = line.split_once(':') {
                let name = name.trim();
                if name.eq_ignore_ascii_case("Via") || name.eq_ignore_ascii_case("CSeq") {
                    text.push_str(line);
                    text.push_str("\r\n");
                }
            }
        }
        text.push_str(&format!("X-EP: {own_ep}\r\n"));
        text.push_str("Content-Length: 0\r\n\r\n");
        Bytes::from(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;

    fn request_metadata() -> MessageMetadata {
        MessageMetadata::new(
            concat!(
                "INVITE sip:a@b.example.com SIP/2.0\r\n",
                "Via: SIP/2.0/TCP 10.0.0.1;branch=xyz\r\n",
                "CSeq: 1 INVITE\r\n",
                "\r\n",
            )
            .to_owned(),
        )
    }

    #[test]
    fn reply_echoes_via_and_cseq() {
        let reply = LocalReply::error(404, "no route");
        let bytes = reply.encode(&request_metadata(), "10.0.0.2");
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("SIP/2.0 404 no route\r\n"));
        assert!(text.contains("branch=xyz"));
        assert!(text.contains("CSeq: 1 INVITE"));
        assert!(text.contains("X-EP: 10.0.0.2"));
    }

    #[test]
    fn routing_failures_map_to_distinct_statuses() {
        let missing = LocalReply::from_error(&ProxyError::Routing(RoutingFailure::RouteMissing));
        let unhealthy =
            LocalReply::from_error(&ProxyError::Routing(RoutingFailure::NoHealthyUpstream));
        assert_eq!(missing.status(), 404);
        assert_eq!(unhealthy.status(), 503);
        assert_eq!(missing.class(), ReplyClass::ErrorReply);
    }

    #[test]
    fn pool_timeout_maps_to_gateway_timeout() {
        let reply = LocalReply::from_error(&ProxyError::UpstreamConnect(PoolFailure::Timeout));
        assert_eq!(reply.status(), 504);
    }
}
