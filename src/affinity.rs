//! Sticky-session affinity support.
//!
//! Affinity routes a key derived from message content to the same upstream
//! host repeatedly. Bindings live in an external assistant service reached
//! over an async interface; a local [`AffinityCache`] keeps a best-effort
//! copy warmed by lookup responses and a subscription stream. The cache is
//! a hint, never ground truth; the assistant remains authoritative.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;

use crate::message::MessageMetadata;

/// Error reported by the assistant transport.
#[derive(Debug)]
pub struct AssistantError(pub String);

impl fmt::Display for AssistantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assistant error: {}", self.0)
    }
}

impl std::error::Error for AssistantError {}

/// One key-to-host binding pushed by the assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityUpdate {
    pub key: String,
    pub host: String,
}

/// Async interface to the external sticky-session assistant.
#[async_trait]
pub trait StickyAssistant: Send + Sync {
    /// Look up a previously bound host for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError`] on transport failure; a missing binding
    /// is `Ok(None)`, not an error.
    async fn lookup(&self, key: &str) -> Result<Option<String>, AssistantError>;

    /// Register a key-to-host binding for future stickiness.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError`] on transport failure.
    async fn bind(&self, key: &str, host: &str) -> Result<(), AssistantError>;

    /// Subscribe to binding updates for keys under `prefix`.
    fn subscribe(&self, prefix: &str) -> BoxStream<'static, AffinityUpdate>;
}

/// Local best-effort cache of assistant bindings.
///
/// Shared across workers; safe because entries are only ever hints and the
/// assistant's async answer always wins for a given transaction.
#[derive(Default)]
pub struct AffinityCache(DashMap<String, String>);

impl AffinityCache {
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Cached host for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).map(|entry| entry.value().clone())
    }

    /// Record a binding observed from a lookup response or subscription.
    pub fn insert(&self, key: impl Into<String>, host: impl Into<String>) {
        self.0.insert(key.into(), host.into());
    }

    /// Drop a binding, typically after the bound host failed.
    pub fn remove(&self, key: &str) { self.0.remove(key); }

    /// Number of cached bindings.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether the cache holds no bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

/// Derive the affinity key for a message from the configured parameter.
///
/// The parameter is searched on the top route header first, then on the
/// request-URI. Messages without the parameter have no affinity and fall
/// through to plain load balancing.
#[must_use]
pub fn affinity_key(metadata: &MessageMetadata, param: &str) -> Option<String> {
    let sources = [metadata.top_route().ok(), metadata.request_uri().ok()];
    for source in sources.into_iter().flatten() {
        if let Some(value) = crate::codec::param_value(source, param) {
            return Some(value.to_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_taken_from_top_route_first() {
        let mut metadata = MessageMetadata::default();
        metadata.set_top_route("<sip:proxy;lskpmc=S1P1>");
        metadata.set_request_uri("sip:alice@a.example.com;lskpmc=OTHER");
        assert_eq!(affinity_key(&metadata, "lskpmc"), Some("S1P1".into()));
    }

    #[test]
    fn key_falls_back_to_request_uri() {
        let mut metadata = MessageMetadata::default();
        metadata.set_request_uri("sip:alice@a.example.com;lskpmc=S1P1");
        assert_eq!(affinity_key(&metadata, "lskpmc"), Some("S1P1".into()));
    }

    #[test]
    fn absent_parameter_yields_no_key() {
        let mut metadata = MessageMetadata::default();
        metadata.set_request_uri("sip:alice@a.example.com");
        assert_eq!(affinity_key(&metadata, "lskpmc"), None);
    }

    #[test]
    fn parameter_name_must_match_whole_token() {
        let mut metadata = MessageMetadata::default();
        metadata.set_request_uri("sip:alice@a.example.com;xlskpmc=WRONG");
        assert_eq!(affinity_key(&metadata, "lskpmc"), None);
    }

    #[test]
    fn cache_round_trip_and_remove() {
        let cache = AffinityCache::new();
        cache.insert("S1P1", "10.0.0.5:5060");
        assert_eq!(cache.get("S1P1"), Some("10.0.0.5:5060".into()));
        cache.remove("S1P1");
        assert!(cache.get("S1P1").is_none());
        assert!(cache.is_empty());
    }
}
