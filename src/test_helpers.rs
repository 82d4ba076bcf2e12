#![cfg(any(test, feature = "test-helpers"))]
//! Test-only mock collaborators and message builders.
//!
//! Provides scripted stand-ins for the engine's external collaborators
//! (a connection pool, a load balancer, and an in-memory sticky assistant)
//! plus helpers for building decoded messages and capturing downstream
//! output.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::{
    affinity::{AffinityUpdate, AssistantError, StickyAssistant},
    cluster::{LoadBalancer, PickError},
    codec::{MessageDecoder, SignalingCodec},
    downstream::{DownstreamCommand, DownstreamHandle},
    error::PoolFailure,
    message::MessageMetadata,
    upstream::{ConnectionPool, UpstreamConnection},
};

/// Raw request text with the given branch and request-URI domain.
#[must_use]
pub fn raw_invite(branch: &str, domain: &str) -> String {
    format!(
        "INVITE sip:alice@{domain} SIP/2.0\r\n\
         Via: SIP/2.0/TCP 10.0.0.1:5060;branch={branch}\r\n\
         CSeq: 1 INVITE\r\n\
         \r\n"
    )
}

/// Raw ACK text with the given branch and request-URI domain.
#[must_use]
pub fn raw_ack(branch: &str, domain: &str) -> String {
    format!(
        "ACK sip:alice@{domain} SIP/2.0\r\n\
         Via: SIP/2.0/TCP 10.0.0.1:5060;branch={branch}\r\n\
         CSeq: 1 ACK\r\n\
         \r\n"
    )
}

/// Raw response text answering the given branch.
#[must_use]
pub fn raw_response(branch: &str, status: u16, reason: &str) -> String {
    format!(
        "SIP/2.0 {status} {reason}\r\n\
         Via: SIP/2.0/TCP 10.0.0.1:5060;branch={branch}\r\n\
         CSeq: 1 INVITE\r\n\
         \r\n"
    )
}

/// Decoded request metadata for the given branch and domain.
///
/// # Panics
///
/// Panics if the builder text fails to decode; test input is static.
#[must_use]
pub fn request_metadata(branch: &str, domain: &str) -> MessageMetadata {
    let mut codec = SignalingCodec::default();
    let mut buf = BytesMut::from(raw_invite(branch, domain).as_str());
    codec
        .decode(&mut buf)
        .expect("builder text decodes")
        .expect("builder text is complete")
}

/// A downstream handle whose commands are drained and discarded.
#[must_use]
pub fn sink_handle() -> DownstreamHandle {
    let (handle, mut rx) = DownstreamHandle::channel(64);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    handle
}

/// Collect every command currently queued on a downstream receiver.
pub fn drain_commands(rx: &mut mpsc::Receiver<DownstreamCommand>) -> Vec<DownstreamCommand> {
    let mut commands = Vec::new();
    while let Ok(command) = rx.try_recv() {
        commands.push(command);
    }
    commands
}

type SharedWrites = Arc<Mutex<Vec<(Bytes, bool)>>>;

/// Upstream connection recording writes and close calls.
pub struct RecordingConnection {
    writes: SharedWrites,
    closed: Arc<AtomicBool>,
}

impl RecordingConnection {
    /// Create a connection plus a shared view of its writes.
    #[must_use]
    pub fn new() -> (Self, SharedWrites) {
        let writes: SharedWrites = Arc::default();
        let conn = Self {
            writes: Arc::clone(&writes),
            closed: Arc::default(),
        };
        (conn, writes)
    }

    /// Flag raised when `close` is called.
    #[must_use]
    pub fn closed_flag(&self) -> Arc<AtomicBool> { Arc::clone(&self.closed) }
}

#[async_trait]
impl UpstreamConnection for RecordingConnection {
    async fn write(&mut self, data: Bytes, end_stream: bool) -> std::io::Result<()> {
        self.writes.lock().unwrap().push((data, end_stream));
        Ok(())
    }

    async fn close(&mut self) { self.closed.store(true, Ordering::Relaxed); }
}

/// A connection granted by [`MockPool`], with inspection handles.
#[derive(Clone)]
pub struct GrantedConnection {
    pub host: String,
    pub writes: SharedWrites,
    pub closed: Arc<AtomicBool>,
}

/// Scripted upstream connection pool.
///
/// Hosts acquire successfully by default; individual hosts can be set to
/// fail with a specific reason.
#[derive(Default)]
pub struct MockPool {
    failures: DashMap<String, PoolFailure>,
    acquires: AtomicUsize,
    granted: Mutex<Vec<GrantedConnection>>,
}

impl MockPool {
    /// Script `host` to fail acquisition with `reason`.
    pub fn fail_host(&self, host: &str, reason: PoolFailure) {
        self.failures.insert(host.to_owned(), reason);
    }

    /// Total acquisition attempts observed.
    #[must_use]
    pub fn acquires(&self) -> usize { self.acquires.load(Ordering::Relaxed) }

    /// Connections granted so far, in grant order.
    #[must_use]
    pub fn granted(&self) -> Vec<GrantedConnection> { self.granted.lock().unwrap().clone() }
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn acquire(
        &self,
        host: &str,
    ) -> std::result::Result<Box<dyn UpstreamConnection>, PoolFailure> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = self.failures.get(host) {
            return Err(*reason);
        }
        let (conn, writes) = RecordingConnection::new();
        self.granted.lock().unwrap().push(GrantedConnection {
            host: host.to_owned(),
            writes,
            closed: conn.closed_flag(),
        });
        Ok(Box::new(conn))
    }
}

/// Load balancer over fixed host lists, counting picks.
#[derive(Default)]
pub struct StaticLoadBalancer {
    clusters: DashMap<String, Vec<String>>,
    maintenance: DashMap<String, ()>,
    picks: AtomicUsize,
    cursor: AtomicUsize,
}

impl StaticLoadBalancer {
    /// Register a cluster with its host list.
    pub fn add_cluster(&self, name: &str, hosts: &[&str]) {
        self.clusters.insert(
            name.to_owned(),
            hosts.iter().map(|host| (*host).to_owned()).collect(),
        );
    }

    /// Put a cluster into maintenance mode.
    pub fn set_maintenance(&self, name: &str) { self.maintenance.insert(name.to_owned(), ()); }

    /// Number of successful and failed picks requested.
    #[must_use]
    pub fn picks(&self) -> usize { self.picks.load(Ordering::Relaxed) }
}

impl LoadBalancer for StaticLoadBalancer {
    fn pick_host(
        &self,
        cluster: &str,
        _metadata: &MessageMetadata,
    ) -> std::result::Result<String, PickError> {
        self.picks.fetch_add(1, Ordering::Relaxed);
        if self.maintenance.contains_key(cluster) {
            return Err(PickError::MaintenanceMode);
        }
        let Some(hosts) = self.clusters.get(cluster) else {
            return Err(PickError::UnknownCluster);
        };
        if hosts.is_empty() {
            return Err(PickError::NoHealthyUpstream);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Ok(hosts[index].clone())
    }
}

/// In-memory sticky assistant with observable traffic.
#[derive(Default)]
pub struct MockAssistant {
    bindings: DashMap<String, String>,
    lookups: AtomicUsize,
    binds: Mutex<Vec<(String, String)>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AffinityUpdate>>>,
}

impl MockAssistant {
    /// Pre-seed a binding as if a previous proxy instance stored it.
    pub fn seed(&self, key: &str, host: &str) {
        self.bindings.insert(key.to_owned(), host.to_owned());
    }

    /// Number of lookups served.
    #[must_use]
    pub fn lookups(&self) -> usize { self.lookups.load(Ordering::Relaxed) }

    /// Bind calls observed, in order.
    #[must_use]
    pub fn binds(&self) -> Vec<(String, String)> { self.binds.lock().unwrap().clone() }

    /// Push a subscription update to every subscriber.
    pub fn push_update(&self, key: &str, host: &str) {
        self.bindings.insert(key.to_owned(), host.to_owned());
        let update = AffinityUpdate {
            key: key.to_owned(),
            host: host.to_owned(),
        };
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }
}

#[async_trait]
impl StickyAssistant for MockAssistant {
    async fn lookup(&self, key: &str) -> Result<Option<String>, AssistantError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.bindings.get(key).map(|entry| entry.value().clone()))
    }

    async fn bind(&self, key: &str, host: &str) -> Result<(), AssistantError> {
        self.binds
            .lock()
            .unwrap()
            .push((key.to_owned(), host.to_owned()));
        self.bindings.insert(key.to_owned(), host.to_owned());
        Ok(())
    }

    fn subscribe(&self, _prefix: &str) -> BoxStream<'static, AffinityUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        }))
    }
}
