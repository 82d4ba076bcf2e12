//! Per-partition proxy worker.
//!
//! A `ProxyWorker` owns one partition's transaction registry and router
//! and mutates them only from its own event loop, so no locking exists
//! between those components. Asynchronous collaborators (the upstream
//! pool, the sticky-session assistant, downstream transports) complete
//! by sending a [`WorkerEvent`] into the worker's channel. Completions
//! that reference a transaction or upstream request that has already been
//! torn down are discarded silently.

use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    affinity::{AffinityCache, AffinityUpdate, StickyAssistant},
    cluster::LoadBalancer,
    codec::{MessageDecoder, MessageEncoder, SignalingCodec, SignalingEncoder},
    config::{ConfigError, ProxySettings, RouteConfig},
    downstream::{CloseMode, DownstreamHandle, DownstreamId},
    error::{PoolFailure, ProxyError},
    filter::{FilterChain, FilterChainFactory},
    message::MessageMetadata,
    metrics,
    registry::TransactionRegistry,
    reply::LocalReply,
    router::{RouteOutcome, Router, RouteTable},
    transaction::{ActiveTransaction, RequestPhase, TransactionState},
    upstream::{ConnectionPool, ConnState, UpstreamConnection, UpstreamRequest},
};

/// Completion delivered into the worker's event loop.
pub enum WorkerEvent {
    /// Bytes received from a downstream connection.
    DownstreamData {
        id: DownstreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// A downstream connection went away.
    DownstreamClosed { id: DownstreamId },
    /// The pool granted a connection for `host`.
    PoolReady {
        host: String,
        conn: Box<dyn UpstreamConnection>,
    },
    /// The pool could not provide a connection for `host`.
    PoolFailure { host: String, reason: PoolFailure },
    /// Bytes received on the pooled connection to `host`.
    UpstreamData { host: String, data: Bytes },
    /// The pooled connection to `host` closed.
    UpstreamClosed { host: String },
    /// The assistant answered a lookup for `key`.
    AffinityResolved { key: String, host: Option<String> },
    /// The assistant pushed a binding update.
    AffinityUpdate(AffinityUpdate),
}

/// Cloneable sender used by transports and pool implementations to feed
/// the worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerHandle {
    /// Deliver one event, awaiting channel capacity.
    ///
    /// Returns `false` when the worker is gone.
    pub async fn send(&self, event: WorkerEvent) -> bool { self.tx.send(event).await.is_ok() }

    /// Deliver downstream bytes.
    pub async fn downstream_data(&self, id: DownstreamId, data: Bytes, end_stream: bool) -> bool {
        self.send(WorkerEvent::DownstreamData {
            id,
            data,
            end_stream,
        })
        .await
    }

    /// Report a downstream connection close.
    pub async fn downstream_closed(&self, id: DownstreamId) -> bool {
        self.send(WorkerEvent::DownstreamClosed { id }).await
    }

    /// Deliver bytes read from a pooled upstream connection.
    pub async fn upstream_data(&self, host: impl Into<String>, data: Bytes) -> bool {
        self.send(WorkerEvent::UpstreamData {
            host: host.into(),
            data,
        })
        .await
    }

    /// Report a pooled upstream connection close.
    pub async fn upstream_closed(&self, host: impl Into<String>) -> bool {
        self.send(WorkerEvent::UpstreamClosed { host: host.into() }).await
    }
}

struct DownstreamConn {
    handle: DownstreamHandle,
    decoder: SignalingCodec,
    buffer: BytesMut,
}

/// Builder for [`ProxyWorker`].
pub struct ProxyBuilder {
    settings: ProxySettings,
    routes: RouteConfig,
    pool: Option<Arc<dyn ConnectionPool>>,
    load_balancer: Option<Arc<dyn LoadBalancer>>,
    assistant: Option<Arc<dyn StickyAssistant>>,
    cache: Option<Arc<AffinityCache>>,
    filter_factory: Arc<FilterChainFactory>,
    shutdown: CancellationToken,
}

impl ProxyBuilder {
    #[must_use]
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            routes: RouteConfig::default(),
            pool: None,
            load_balancer: None,
            assistant: None,
            cache: None,
            filter_factory: Arc::new(FilterChain::default),
            shutdown: CancellationToken::new(),
        }
    }

    /// Install the route configuration.
    #[must_use]
    pub fn routes(mut self, routes: RouteConfig) -> Self {
        self.routes = routes;
        self
    }

    /// Install the upstream connection pool.
    #[must_use]
    pub fn pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Install the cluster load balancer.
    #[must_use]
    pub fn load_balancer(mut self, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        self.load_balancer = Some(load_balancer);
        self
    }

    /// Install the sticky-session assistant client.
    #[must_use]
    pub fn assistant(mut self, assistant: Arc<dyn StickyAssistant>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    /// Share an affinity cache across workers.
    #[must_use]
    pub fn affinity_cache(mut self, cache: Arc<AffinityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Install the per-transaction filter chain factory.
    #[must_use]
    pub fn filter_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> FilterChain + Send + Sync + 'static,
    {
        self.filter_factory = Arc::new(factory);
        self
    }

    /// Use an externally owned shutdown token.
    #[must_use]
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Validate configuration and assemble the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for invalid settings or routes, or when a
    /// required collaborator was not installed.
    pub fn build(self) -> Result<ProxyWorker, ConfigError> {
        self.settings.validate()?;
        let table = Arc::new(RouteTable::from_config(&self.routes)?);

        let pool = self.pool.ok_or(ConfigError::MissingCollaborator("pool"))?;
        let load_balancer = self
            .load_balancer
            .ok_or(ConfigError::MissingCollaborator("load balancer"))?;
        let cache = self.cache.unwrap_or_else(AffinityCache::new);

        let router = Router::new(
            table,
            load_balancer,
            Arc::clone(&cache),
            self.assistant.is_some(),
        );
        let (tx, rx) = mpsc::channel(self.settings.event_capacity);
        let codec = SignalingCodec::new(self.settings.domain_match_param.clone());
        let registry = TransactionRegistry::new(self.settings.transaction_timeout());

        Ok(ProxyWorker {
            settings: self.settings,
            registry,
            router,
            codec,
            pool,
            assistant: self.assistant,
            cache,
            filter_factory: self.filter_factory,
            downstream: HashMap::new(),
            next_downstream_id: 1,
            events_tx: tx,
            events_rx: rx,
            shutdown: self.shutdown,
        })
    }
}

/// One worker partition's event loop and state.
pub struct ProxyWorker {
    settings: ProxySettings,
    registry: TransactionRegistry,
    router: Router,
    codec: SignalingCodec,
    pool: Arc<dyn ConnectionPool>,
    assistant: Option<Arc<dyn StickyAssistant>>,
    cache: Arc<AffinityCache>,
    filter_factory: Arc<FilterChainFactory>,
    downstream: HashMap<DownstreamId, DownstreamConn>,
    next_downstream_id: u64,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    shutdown: CancellationToken,
}

impl ProxyWorker {
    /// Start building a worker.
    #[must_use]
    pub fn builder(settings: ProxySettings) -> ProxyBuilder { ProxyBuilder::new(settings) }

    /// Handle for feeding events from transports and pool tasks.
    #[must_use]
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Registry accessor for assertions and draining.
    #[must_use]
    pub fn registry(&self) -> &TransactionRegistry { &self.registry }

    /// Shared affinity cache.
    #[must_use]
    pub fn affinity_cache(&self) -> &Arc<AffinityCache> { &self.cache }

    /// Register a downstream connection and return its identifier.
    pub fn attach_downstream(&mut self, handle: DownstreamHandle) -> DownstreamId {
        let id = DownstreamId::new(self.next_downstream_id);
        self.next_downstream_id += 1;
        self.downstream.insert(
            id,
            DownstreamConn {
                handle,
                decoder: self.codec.clone(),
                buffer: BytesMut::new(),
            },
        );
        debug!(%id, "downstream attached");
        id
    }

    /// Drive the worker until shutdown.
    ///
    /// Starts the assistant subscription (when configured) and the
    /// periodic registry sweep, then processes events as they arrive.
    pub async fn run(&mut self) {
        self.start_subscription();

        let mut sweep = tokio::time::interval(self.settings.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    info!("worker shutting down");
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep();
                }

                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
            }
        }
    }

    /// Receive and process a single event. Used by tests to drive the
    /// worker deterministically.
    pub async fn process_next_event(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Run one sweep pass over the registry.
    pub fn sweep(&mut self) {
        let stats = self.registry.sweep(tokio::time::Instant::now());
        if stats.erased > 0 || stats.reset > 0 {
            debug!(erased = stats.erased, reset = stats.reset, "registry sweep");
        }
    }

    /// Process one event.
    pub async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::DownstreamData {
                id,
                data,
                end_stream,
            } => self.on_downstream_data(id, &data, end_stream).await,
            WorkerEvent::DownstreamClosed { id } => self.on_downstream_closed(id),
            WorkerEvent::PoolReady { host, conn } => self.on_pool_ready(&host, conn).await,
            WorkerEvent::PoolFailure { host, reason } => self.on_pool_failure(&host, reason),
            WorkerEvent::UpstreamData { host, data } => self.on_upstream_data(&host, &data).await,
            WorkerEvent::UpstreamClosed { host } => self.on_upstream_closed(&host),
            WorkerEvent::AffinityResolved { key, host } => {
                self.on_affinity_resolved(&key, host).await;
            }
            WorkerEvent::AffinityUpdate(update) => {
                debug!(key = %update.key, host = %update.host, "affinity update");
                self.cache.insert(update.key, update.host);
            }
        }
    }

    fn start_subscription(&self) {
        let Some(assistant) = &self.assistant else {
            return;
        };
        let mut stream = assistant.subscribe("");
        let tx = self.events_tx.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            use futures::StreamExt;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    update = stream.next() => match update {
                        Some(update) => {
                            if tx.send(WorkerEvent::AffinityUpdate(update)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    async fn on_downstream_data(&mut self, id: DownstreamId, data: &[u8], end_stream: bool) {
        let Some(conn) = self.downstream.get_mut(&id) else {
            debug!(%id, "data for unknown downstream discarded");
            return;
        };
        conn.buffer.extend_from_slice(data);

        loop {
            let decoded = {
                let Some(conn) = self.downstream.get_mut(&id) else {
                    return;
                };
                conn.decoder.decode(&mut conn.buffer)
            };
            match decoded {
                Ok(Some(metadata)) => self.dispatch(id, metadata).await,
                Ok(None) => break,
                Err(error) => {
                    // Undecodable bytes leave no metadata to answer with;
                    // abort the connection.
                    error!(%id, %error, "downstream decode failure");
                    self.abort_downstream(id, CloseMode::NoFlush);
                    return;
                }
            }
        }

        if end_stream {
            info!(%id, "downstream half-closed");
            self.abort_downstream(id, CloseMode::FlushWrite);
        }
    }

    fn abort_downstream(&mut self, id: DownstreamId, mode: CloseMode) {
        let aborted = self.registry.reset_downstream(id);
        if aborted > 0 {
            metrics::inc_cx_destroy_with_active();
            debug!(%id, aborted, "reset transactions on closing downstream");
        }
        if let Some(conn) = self.downstream.remove(&id) {
            conn.handle.close(mode);
        }
    }

    fn on_downstream_closed(&mut self, id: DownstreamId) {
        let aborted = self.registry.reset_downstream(id);
        if aborted > 0 {
            metrics::inc_cx_destroy_with_active();
        }
        self.downstream.remove(&id);
        debug!(%id, aborted, "downstream closed");
    }

    async fn dispatch(&mut self, id: DownstreamId, metadata: MessageMetadata) {
        metrics::inc_requests();

        let Some(conn) = self.downstream.get(&id) else {
            return;
        };
        let handle = conn.handle.clone();

        let transaction_id = match metadata.transaction_id() {
            Ok(tid) => tid.to_owned(),
            Err(unset) => {
                // Undispatchable without a branch: answer directly, no
                // transaction is registered.
                let error = ProxyError::from(unset);
                warn!(%id, %error, "message dropped");
                let reply = LocalReply::from_error(&error);
                if !handle.is_closed() {
                    handle.write(reply.encode(&metadata, &self.settings.own_endpoint), false);
                }
                metrics::inc_local_replies(metrics::ReplyLabel::Error);
                return;
            }
        };

        let is_ack = metadata.method() == Ok(crate::message::Method::Ack);
        let factory = Arc::clone(&self.filter_factory);
        let own_ep = self.settings.own_endpoint.clone();

        let (entry, _resolved) = self.registry.resolve(
            &transaction_id,
            is_ack,
            metadata,
            |metadata| {
                ActiveTransaction::new(transaction_id.as_str(), id, handle, metadata, factory())
            },
            tokio::time::Instant::now(),
        );

        match entry.transaction_mut().run_request_boundaries() {
            RequestPhase::Continue => self.route_and_forward(&transaction_id).await,
            RequestPhase::LocalReply(reply) => {
                entry.transaction_mut().send_local_reply(&reply, &own_ep, false);
                entry.mark_deleted();
            }
            RequestPhase::Stopped => {
                debug!(transaction = %transaction_id, "filter took over the exchange");
            }
        }
    }

    async fn route_and_forward(&mut self, transaction_id: &str) {
        enum Decision {
            Forward(String),
            Pending { key: String },
            Fail(ProxyError),
        }

        let decision = {
            let Some(entry) = self.registry.lookup(transaction_id) else {
                return;
            };
            let trans = entry.transaction_mut();

            if let Some(host) = trans.upstream_host().map(ToOwned::to_owned) {
                // Follow-up message on an already-dispatched transaction.
                Decision::Forward(host)
            } else {
                let cached = trans.cached_route();
                match self.router.resolve(cached, trans.metadata_mut()) {
                    Ok(RouteOutcome::Destination { host, route }) => {
                        trans.cache_route(route);
                        Decision::Forward(host)
                    }
                    Ok(RouteOutcome::PendingAffinity { key, route }) => {
                        trans.cache_route(Some(route));
                        trans.set_state(TransactionState::AwaitingAffinity {
                            key: key.clone(),
                            route,
                        });
                        Decision::Pending { key }
                    }
                    Err(error) => Decision::Fail(error),
                }
            }
        };

        match decision {
            Decision::Forward(host) => self.forward(transaction_id, &host).await,
            Decision::Pending { key } => self.spawn_affinity_lookup(key),
            Decision::Fail(error) => self.fail_transaction(transaction_id, &error),
        }
    }

    fn spawn_affinity_lookup(&self, key: String) {
        let Some(assistant) = self.assistant.clone() else {
            return;
        };
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let host = match assistant.lookup(&key).await {
                Ok(host) => host,
                Err(error) => {
                    warn!(key = %key, %error, "affinity lookup failed, treating as miss");
                    None
                }
            };
            let _ = tx.send(WorkerEvent::AffinityResolved { key, host }).await;
        });
    }

    fn spawn_bind(&self, key: String, host: String) {
        let Some(assistant) = self.assistant.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(error) = assistant.bind(&key, &host).await {
                warn!(key = %key, host = %host, %error, "affinity bind failed");
            }
        });
    }

    async fn forward(&mut self, transaction_id: &str, host: &str) {
        let payload = {
            let Some(entry) = self.registry.lookup(transaction_id) else {
                return;
            };
            let trans = entry.transaction_mut();
            trans.associate_upstream(host);
            trans.set_state(TransactionState::Dispatched);
            SignalingEncoder.encode(trans.metadata())
        };

        if self.registry.upstream_mut(host).is_none() {
            let mut request =
                UpstreamRequest::new(host, transaction_id, self.codec.clone());
            if request.begin_connect() {
                self.spawn_acquire(host.to_owned());
            }
            self.registry.insert_upstream(request);
        }

        let write_result = self
            .registry
            .upstream_mut(host)
            .expect("upstream request was just ensured")
            .write(payload, false)
            .await;

        if let Err(error) = write_result {
            warn!(transaction = %transaction_id, host, %error, "upstream write failed");
            let error = ProxyError::Io(error);
            self.fail_transaction(transaction_id, &error);
        }
    }

    fn spawn_acquire(&self, host: String) {
        let pool = Arc::clone(&self.pool);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match pool.acquire(&host).await {
                Ok(conn) => WorkerEvent::PoolReady { host, conn },
                Err(reason) => WorkerEvent::PoolFailure { host, reason },
            };
            let _ = tx.send(event).await;
        });
    }

    async fn on_pool_ready(&mut self, host: &str, mut conn: Box<dyn UpstreamConnection>) {
        match self.registry.upstream_mut(host) {
            Some(request) if request.state() == ConnState::Connecting => {
                if request.on_pool_ready(conn).await.is_err() {
                    let error = ProxyError::UpstreamConnect(PoolFailure::RemoteConnectFailure);
                    self.teardown_upstream(host, &error, true).await;
                }
            }
            _ => {
                // The interested transactions are gone; do not leak the
                // granted connection.
                debug!(host, "orphaned pool grant closed");
                conn.close().await;
            }
        }
    }

    fn on_pool_failure(&mut self, host: &str, reason: PoolFailure) {
        if let Some(mut request) = self.registry.remove_upstream(host) {
            request.on_pool_failure(reason);
        }
        let error = ProxyError::UpstreamConnect(reason);
        for transaction_id in self.transactions_on_host(host) {
            self.fail_transaction(&transaction_id, &error);
        }
    }

    async fn on_upstream_data(&mut self, host: &str, data: &[u8]) {
        let responses = match self.registry.upstream_mut(host) {
            Some(request) => request.decode_responses(data),
            None => {
                debug!(host, "bytes from unknown upstream discarded");
                return;
            }
        };

        let responses = match responses {
            Ok(responses) => responses,
            Err(error) => {
                let error = ProxyError::UpstreamProtocol(error.to_string());
                self.teardown_upstream(host, &error, true).await;
                return;
            }
        };

        let own_ep = self.settings.own_endpoint.clone();
        for response in responses {
            let transaction_id = match response.transaction_id() {
                Ok(tid) => tid.to_owned(),
                Err(_) => {
                    warn!(host, "upstream response without branch discarded");
                    continue;
                }
            };
            match self.registry.lookup(&transaction_id) {
                Some(entry) => {
                    if entry
                        .transaction_mut()
                        .relay_upstream_response(response, &own_ep)
                        .is_err()
                    {
                        entry.force_reset();
                    } else {
                        entry.mark_deleted();
                    }
                }
                None => {
                    // Transaction already reclaimed (for example by the
                    // sweep); late responses are discarded.
                    debug!(transaction = %transaction_id, "late upstream response discarded");
                }
            }
        }
    }

    fn on_upstream_closed(&mut self, host: &str) {
        let outstanding = match self.registry.remove_upstream(host) {
            Some(mut request) => request.on_peer_closed(),
            None => return,
        };
        info!(host, outstanding, "upstream connection closed");
        if outstanding {
            for transaction_id in self.transactions_on_host(host) {
                if let Some(entry) = self.registry.lookup(&transaction_id) {
                    entry.force_reset();
                }
            }
        }
    }

    async fn on_affinity_resolved(&mut self, key: &str, host: Option<String>) {
        let waiting = self.registry.awaiting_affinity(key);
        if waiting.is_empty() {
            // All interested transactions were torn down while the lookup
            // was in flight.
            debug!(key, "affinity answer with no waiting transaction discarded");
            return;
        }

        for transaction_id in waiting {
            enum Resume {
                Forward { host: String, bind: Option<String> },
                Fail(ProxyError),
            }

            let resume = {
                let Some(entry) = self.registry.lookup(&transaction_id) else {
                    continue;
                };
                let trans = entry.transaction_mut();
                let route = match trans.state() {
                    TransactionState::AwaitingAffinity { route, .. } => *route,
                    _ => continue,
                };
                match self.router.resolve_after_affinity(
                    key,
                    route,
                    host.clone(),
                    trans.metadata_mut(),
                ) {
                    Ok(resolution) => {
                        trans.set_state(TransactionState::TransportEnd);
                        let bind = resolution.needs_bind.then(|| resolution.host.clone());
                        Resume::Forward {
                            host: resolution.host,
                            bind,
                        }
                    }
                    Err(error) => Resume::Fail(error),
                }
            };

            match resume {
                Resume::Forward { host, bind } => {
                    if let Some(bound_host) = bind {
                        // Fire-and-forget: the message proceeds without
                        // waiting for the registration.
                        self.spawn_bind(key.to_owned(), bound_host);
                    }
                    self.forward(&transaction_id, &host).await;
                }
                Resume::Fail(error) => self.fail_transaction(&transaction_id, &error),
            }
        }
    }

    /// Answer a failed transaction and flag it for reclamation.
    fn fail_transaction(&mut self, transaction_id: &str, error: &ProxyError) {
        let own_ep = self.settings.own_endpoint.clone();
        let Some(entry) = self.registry.lookup(transaction_id) else {
            return;
        };

        warn!(transaction = %transaction_id, %error, "transaction failed");
        if error.wants_local_reply() && !entry.transaction().local_reply_sent() {
            let reply = LocalReply::from_error(error);
            entry.transaction_mut().send_local_reply(&reply, &own_ep, false);
            entry.mark_deleted();
        } else {
            entry.force_reset();
        }
    }

    /// Tear down an upstream request, failing every transaction bound to
    /// its host.
    async fn teardown_upstream(&mut self, host: &str, error: &ProxyError, close: bool) {
        if let Some(mut request) = self.registry.remove_upstream(host) {
            request.release(close).await;
        }
        for transaction_id in self.transactions_on_host(host) {
            self.fail_transaction(&transaction_id, error);
        }
    }

    fn transactions_on_host(&self, host: &str) -> Vec<String> {
        self.registry.transactions_on_host(host)
    }
}
