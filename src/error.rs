//! Canonical error types for the proxy engine.
//!
//! `ProxyError` is the single runtime error surface. Every failure path in
//! the transaction, routing, and upstream layers converges here so callers
//! can decide between a locally generated error reply and a silent reclaim.

use std::fmt;

/// Attempted access of a metadata field that has no value.
///
/// Carries the field name so diagnostics can state exactly which optional
/// value was missing. Absence is always distinguishable from "set to empty".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsetField(pub &'static str);

impl fmt::Display for UnsetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metadata field `{}` is not set", self.0)
    }
}

impl std::error::Error for UnsetField {}

/// Reasons a routing decision can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingFailure {
    /// No route entry matched the message's domain.
    RouteMissing,
    /// The matched route names a cluster that does not exist.
    UnknownCluster,
    /// The cluster exists but is in maintenance mode.
    MaintenanceMode,
    /// The cluster has no healthy host to pick.
    NoHealthyUpstream,
}

impl RoutingFailure {
    /// Short token used in logs and reply reasons.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RouteMissing => "route missing",
            Self::UnknownCluster => "unknown cluster",
            Self::MaintenanceMode => "maintenance mode",
            Self::NoHealthyUpstream => "no healthy upstream",
        }
    }
}

/// Reasons the upstream connection pool can fail an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailure {
    /// The pool is at its connection limit.
    Overflow,
    /// The connect attempt timed out.
    Timeout,
    /// The connection failed locally before reaching the peer.
    LocalConnectFailure,
    /// The peer refused or dropped the connection.
    RemoteConnectFailure,
}

impl fmt::Display for PoolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Overflow => "pool overflow",
            Self::Timeout => "connect timeout",
            Self::LocalConnectFailure => "local connect failure",
            Self::RemoteConnectFailure => "remote connect failure",
        };
        f.write_str(reason)
    }
}

/// Top-level runtime error for the proxy engine.
#[derive(Debug)]
pub enum ProxyError {
    /// The message is malformed in a way that prevents dispatch, for
    /// example a missing transaction identifier.
    Protocol(String),
    /// No usable destination could be resolved for the message.
    Routing(RoutingFailure),
    /// The upstream pool could not provide a connection.
    UpstreamConnect(PoolFailure),
    /// The upstream peer sent a response that could not be decoded.
    UpstreamProtocol(String),
    /// The downstream connection is gone; nothing can be written back.
    DownstreamClosed,
    /// An error in the underlying transport.
    Io(std::io::Error),
}

impl ProxyError {
    /// Whether a locally generated error reply should be attempted for
    /// this error when the downstream peer is still reachable.
    #[must_use]
    pub fn wants_local_reply(&self) -> bool {
        !matches!(self, Self::DownstreamClosed | Self::Io(_))
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(what) => write!(f, "protocol error: {what}"),
            Self::Routing(failure) => write!(f, "routing error: {}", failure.as_str()),
            Self::UpstreamConnect(reason) => write!(f, "upstream connect error: {reason}"),
            Self::UpstreamProtocol(what) => write!(f, "upstream protocol error: {what}"),
            Self::DownstreamClosed => f.write_str("downstream connection closed"),
            Self::Io(error) => write!(f, "transport error: {error}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(error: std::io::Error) -> Self { Self::Io(error) }
}

impl From<UnsetField> for ProxyError {
    fn from(field: UnsetField) -> Self { Self::Protocol(field.to_string()) }
}

/// Canonical result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProxyError>;
