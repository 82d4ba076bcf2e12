//! Per-worker transaction registry.
//!
//! The registry is the single owner of both transaction entries and the
//! per-host upstream requests; other components reference them only
//! through its lookup API, never through owning references of their own.
//! Entries are reclaimed in two phases: completion or reset merely flags
//! an entry `deleted`, and the periodic sweep physically erases flagged
//! entries on its next pass. The sweep also force-resets entries that
//! outlived the transaction timeout; those are erased one interval later,
//! once the reset path has flagged them.

use std::collections::{HashMap, hash_map::Entry};

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    message::MessageMetadata,
    metrics,
    transaction::{ActiveTransaction, TransactionState},
    upstream::UpstreamRequest,
};

/// Whether `resolve` found an existing transaction or created one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Created,
    Existing,
}

/// One registered transaction plus its bookkeeping.
pub struct TransactionEntry {
    transaction: ActiveTransaction,
    created_at: Instant,
    deleted: bool,
    messages: Vec<MessageMetadata>,
}

impl TransactionEntry {
    fn new(transaction: ActiveTransaction, now: Instant) -> Self {
        metrics::inc_transactions();
        Self {
            transaction,
            created_at: now,
            deleted: false,
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn transaction(&self) -> &ActiveTransaction { &self.transaction }

    #[must_use]
    pub fn transaction_mut(&mut self) -> &mut ActiveTransaction { &mut self.transaction }

    #[must_use]
    pub fn deleted(&self) -> bool { self.deleted }

    #[must_use]
    pub fn created_at(&self) -> Instant { self.created_at }

    /// Messages observed for this transaction beyond the current one.
    #[must_use]
    pub fn messages(&self) -> &[MessageMetadata] { &self.messages }

    /// Flag the entry for erasure on the next sweep.
    pub fn mark_deleted(&mut self) {
        if !self.deleted {
            self.deleted = true;
            metrics::dec_transactions();
        }
    }

    /// Force-reset the transaction and flag the entry.
    pub fn force_reset(&mut self) {
        self.transaction.on_reset();
        self.mark_deleted();
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries physically erased.
    pub erased: usize,
    /// Entries force-reset for exceeding the transaction timeout.
    pub reset: usize,
}

/// Map of in-flight transactions and pooled upstream requests for one
/// worker partition.
pub struct TransactionRegistry {
    transactions: HashMap<String, TransactionEntry>,
    upstream: HashMap<String, UpstreamRequest>,
    timeout: std::time::Duration,
}

impl TransactionRegistry {
    #[must_use]
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            transactions: HashMap::new(),
            upstream: HashMap::new(),
            timeout,
        }
    }

    /// Total entries, including those flagged deleted.
    #[must_use]
    pub fn len(&self) -> usize { self.transactions.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.transactions.is_empty() }

    /// Entries not yet flagged deleted.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.transactions
            .values()
            .filter(|entry| !entry.deleted)
            .count()
    }

    /// Resolve a wire message to its transaction.
    ///
    /// An ACK matching a registered transaction (however complete) maps to
    /// that same transaction, the one case where two wire messages share
    /// a transaction object. A retransmission of a live transaction is
    /// folded in the same way. Otherwise a fresh transaction is built via
    /// `make`, registered, and returned.
    pub fn resolve(
        &mut self,
        id: &str,
        is_ack: bool,
        metadata: MessageMetadata,
        make: impl FnOnce(MessageMetadata) -> ActiveTransaction,
        now: Instant,
    ) -> (&mut TransactionEntry, Resolved) {
        let resolved = match self.transactions.entry(id.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if is_ack || !occupied.get().deleted {
                    trace!(transaction = %id, "message folded into existing transaction");
                    let entry = occupied.into_mut();
                    let previous = entry.transaction.begin_message(metadata);
                    entry.messages.push(previous);
                    Resolved::Existing
                } else {
                    debug!(transaction = %id, "replacing deleted entry with fresh transaction");
                    occupied.insert(TransactionEntry::new(make(metadata), now));
                    Resolved::Created
                }
            }
            Entry::Vacant(vacant) => {
                trace!(transaction = %id, "new transaction registered");
                vacant.insert(TransactionEntry::new(make(metadata), now));
                Resolved::Created
            }
        };

        let entry = self
            .transactions
            .get_mut(id)
            .expect("entry was just inserted or found");
        (entry, resolved)
    }

    /// Look up a transaction entry by identifier.
    #[must_use]
    pub fn lookup(&mut self, id: &str) -> Option<&mut TransactionEntry> {
        self.transactions.get_mut(id)
    }

    /// Flag a transaction for deferred deletion.
    ///
    /// Callers must only reference transactions they created or resolved;
    /// an unknown identifier here is a programming error.
    pub fn mark_deleted(&mut self, id: &str) {
        match self.transactions.get_mut(id) {
            Some(entry) => entry.mark_deleted(),
            None => debug_assert!(false, "mark_deleted for unknown transaction {id}"),
        }
    }

    /// Identifiers of transactions suspended on an affinity lookup for
    /// `key`.
    #[must_use]
    pub fn awaiting_affinity(&self, key: &str) -> Vec<String> {
        self.transactions
            .iter()
            .filter(|(_, entry)| {
                !entry.deleted
                    && matches!(
                        entry.transaction.state(),
                        TransactionState::AwaitingAffinity { key: k, .. } if k == key
                    )
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Identifiers of live transactions associated with an upstream host.
    #[must_use]
    pub fn transactions_on_host(&self, host: &str) -> Vec<String> {
        self.transactions
            .iter()
            .filter(|(_, entry)| {
                !entry.deleted && entry.transaction.upstream_host() == Some(host)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Reset every live transaction bound to a downstream connection.
    ///
    /// Returns how many transactions were aborted.
    pub fn reset_downstream(&mut self, downstream: crate::downstream::DownstreamId) -> usize {
        let mut aborted = 0;
        for entry in self.transactions.values_mut() {
            if !entry.deleted && entry.transaction.downstream_id() == downstream {
                entry.force_reset();
                aborted += 1;
            }
        }
        aborted
    }

    /// One sweep pass over the registry.
    ///
    /// Flagged entries are erased; live entries older than the timeout
    /// are force-reset, which flags them for the next pass. An entry is
    /// never reset and erased within the same pass.
    pub fn sweep(&mut self, now: Instant) -> SweepStats {
        let mut stats = SweepStats::default();
        let timeout = self.timeout;

        self.transactions.retain(|id, entry| {
            if entry.deleted {
                trace!(transaction = %id, "erasing deleted entry");
                stats.erased += 1;
                return false;
            }
            if now.saturating_duration_since(entry.created_at) >= timeout {
                warn!(transaction = %id, "transaction timed out, force reset");
                entry.force_reset();
                stats.reset += 1;
            }
            true
        });

        stats
    }

    /// Register an upstream request under its destination host.
    pub fn insert_upstream(&mut self, request: UpstreamRequest) {
        self.upstream.insert(request.host().to_owned(), request);
    }

    /// Upstream request for `host`, if one exists. Absence is an ordinary
    /// outcome, not an error.
    #[must_use]
    pub fn upstream_mut(&mut self, host: &str) -> Option<&mut UpstreamRequest> {
        self.upstream.get_mut(host)
    }

    /// Remove and return the upstream request for `host`.
    pub fn remove_upstream(&mut self, host: &str) -> Option<UpstreamRequest> {
        self.upstream.remove(host)
    }

    /// Number of pooled upstream requests.
    #[must_use]
    pub fn upstream_count(&self) -> usize { self.upstream.len() }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        codec::SignalingCodec,
        downstream::DownstreamId,
        filter::FilterChain,
        test_helpers::{request_metadata, sink_handle},
    };

    fn make_transaction(id: &str) -> impl FnOnce(MessageMetadata) -> ActiveTransaction + '_ {
        move |metadata| {
            ActiveTransaction::new(
                id,
                DownstreamId::new(1),
                sink_handle(),
                metadata,
                FilterChain::default(),
            )
        }
    }

    fn registry() -> TransactionRegistry { TransactionRegistry::new(Duration::from_secs(32)) }

    #[tokio::test]
    async fn resolve_creates_then_folds_ack() {
        let mut registry = registry();
        let now = Instant::now();

        let (_, resolved) = registry.resolve(
            "t1",
            false,
            request_metadata("t1", "a.example.com"),
            make_transaction("t1"),
            now,
        );
        assert_eq!(resolved, Resolved::Created);

        registry.mark_deleted("t1");

        let (entry, resolved) = registry.resolve(
            "t1",
            true,
            request_metadata("t1", "a.example.com"),
            make_transaction("t1"),
            now,
        );
        assert_eq!(resolved, Resolved::Existing);
        assert_eq!(entry.messages().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn at_most_one_live_entry_per_id() {
        let mut registry = registry();
        let now = Instant::now();

        registry.resolve(
            "t1",
            false,
            request_metadata("t1", "a.example.com"),
            make_transaction("t1"),
            now,
        );
        // A retransmission folds instead of duplicating.
        let (_, resolved) = registry.resolve(
            "t1",
            false,
            request_metadata("t1", "a.example.com"),
            make_transaction("t1"),
            now,
        );
        assert_eq!(resolved, Resolved::Existing);
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test]
    async fn sweep_without_changes_is_idempotent() {
        let mut registry = registry();
        let now = Instant::now();
        registry.resolve(
            "t1",
            false,
            request_metadata("t1", "a.example.com"),
            make_transaction("t1"),
            now,
        );

        let stats = registry.sweep(now);
        assert_eq!(stats, SweepStats::default());
        assert_eq!(registry.live_count(), 1);

        let stats = registry.sweep(now);
        assert_eq!(stats, SweepStats::default());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_entry_is_reset_then_erased_next_pass() {
        let mut registry = TransactionRegistry::new(Duration::from_secs(4));
        registry.resolve(
            "t1",
            false,
            request_metadata("t1", "a.example.com"),
            make_transaction("t1"),
            Instant::now(),
        );

        tokio::time::advance(Duration::from_secs(5)).await;

        let stats = registry.sweep(Instant::now());
        assert_eq!(stats.reset, 1);
        assert_eq!(stats.erased, 0);
        assert_eq!(registry.len(), 1, "reset entry survives the resetting pass");

        let stats = registry.sweep(Instant::now());
        assert_eq!(stats.erased, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn deleted_entry_is_erased_on_next_sweep() {
        let mut registry = registry();
        let now = Instant::now();
        registry.resolve(
            "t1",
            false,
            request_metadata("t1", "a.example.com"),
            make_transaction("t1"),
            now,
        );
        registry.mark_deleted("t1");
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.len(), 1);

        let stats = registry.sweep(now);
        assert_eq!(stats.erased, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn upstream_map_round_trip() {
        let mut registry = registry();
        let request = UpstreamRequest::new("10.0.0.5:5060", "t1", SignalingCodec::default());
        registry.insert_upstream(request);

        assert!(registry.upstream_mut("10.0.0.5:5060").is_some());
        assert!(registry.upstream_mut("10.0.0.6:5060").is_none());

        let removed = registry.remove_upstream("10.0.0.5:5060");
        assert!(removed.is_some());
        assert_eq!(registry.upstream_count(), 0);
    }

    #[tokio::test]
    async fn downstream_close_resets_only_that_connection() {
        let mut registry = registry();
        let now = Instant::now();
        registry.resolve(
            "t1",
            false,
            request_metadata("t1", "a.example.com"),
            make_transaction("t1"),
            now,
        );
        registry.resolve(
            "t2",
            false,
            request_metadata("t2", "a.example.com"),
            |metadata| {
                ActiveTransaction::new(
                    "t2",
                    DownstreamId::new(9),
                    sink_handle(),
                    metadata,
                    FilterChain::default(),
                )
            },
            now,
        );

        let aborted = registry.reset_downstream(DownstreamId::new(1));
        assert_eq!(aborted, 1);
        assert_eq!(registry.live_count(), 1);
    }
}
