//! Agora transaction ingestion pipeline.
//!
//! Transactions reach us only as answers to our own fetch requests. Transfers
//! go straight to the validators; contract calls wait in a bounded queue that
//! is drained a few at a time, so a flood of expensive calls cannot starve
//! plain payments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use agora_common::peer::{NetworkEventSender, PeerId};
use agora_common::{ChainError, Transaction, TxHash, TxKind};
use agora_module_chain_coordinator::SharedChain;
use agora_module_propagation::PropagationService;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub mod configuration;
pub mod recent;
pub mod validator;

use crate::configuration::TxIngestConfig;
use crate::recent::RecentTransactions;
use crate::validator::{drain_contracts, Submission, Validator};

/// What happened to one incoming batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub transfers: usize,
    pub dropped_transfers: usize,
    pub queued_contracts: usize,
    pub dropped_contracts: usize,
    pub duplicates: usize,
}

pub struct TxIngestPipeline {
    /// Transaction ids we asked each peer for and have not received
    outstanding: HashMap<PeerId, HashSet<TxHash>>,
    recent: RecentTransactions,
    contract_queue: mpsc::Sender<Submission>,
    validator: Validator,
}

impl TxIngestPipeline {
    /// Build the pipeline and start its contract-queue drain task. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: &TxIngestConfig,
        chain: SharedChain,
        propagation: Arc<PropagationService>,
        events: NetworkEventSender,
    ) -> Self {
        let validator = Validator::spawn(
            chain,
            propagation,
            events,
            config.validation_workers,
            config.validation_queue_capacity,
        );
        let (contract_queue, queue) = mpsc::channel(config.contract_queue_capacity.max(1));
        tokio::spawn(drain_contracts(
            queue,
            validator.clone(),
            config.contract_drain_interval(),
            config.contract_drain_batch,
        ));
        Self {
            outstanding: HashMap::new(),
            recent: RecentTransactions::new(
                config.recent_cache_capacity,
                config.recent_cache_expiry(),
            ),
            contract_queue,
            validator,
        }
    }

    /// Of the announced ids, those worth fetching: not recently seen and not
    /// already requested from any peer
    pub fn unseen(&self, ids: &[TxHash], now: Instant) -> Vec<TxHash> {
        ids.iter()
            .filter(|id| !self.recent.contains(id, now))
            .filter(|id| !self.outstanding.values().any(|requested| requested.contains(id)))
            .copied()
            .collect()
    }

    /// Announced ids to fetch now. Nothing while the validators are backed
    /// up, so a flood of announcements cannot queue unbounded work.
    pub fn fetchable(&self, ids: &[TxHash], now: Instant) -> Vec<TxHash> {
        if self.is_busy() {
            return Vec::new();
        }
        self.unseen(ids, now)
    }

    pub fn is_busy(&self) -> bool {
        self.validator.is_busy()
    }

    /// Note that we sent `peer` a fetch request for `ids`
    pub fn record_request(&mut self, peer: PeerId, ids: &[TxHash]) {
        self.outstanding.entry(peer).or_default().extend(ids.iter().copied());
    }

    pub fn outstanding(&self, peer: PeerId) -> usize {
        self.outstanding.get(&peer).map_or(0, HashSet::len)
    }

    /// Accept a batch of transactions from `peer`.
    ///
    /// The whole batch is refused with nothing changed if any transaction in
    /// it was not requested from that peer.
    pub fn on_transactions(
        &mut self,
        peer: PeerId,
        transactions: Vec<Transaction>,
        now: Instant,
    ) -> Result<IngestReport, ChainError> {
        let requested = self.outstanding.get_mut(&peer);
        let ids: Vec<TxHash> = transactions.iter().map(Transaction::id).collect();
        let Some(requested) = requested.filter(|r| ids.iter().all(|id| r.contains(id))) else {
            return Err(ChainError::BadMessage(format!(
                "unsolicited transactions from {peer}"
            )));
        };
        for id in &ids {
            requested.remove(id);
        }
        if requested.is_empty() {
            self.outstanding.remove(&peer);
        }

        let mut report = IngestReport::default();
        for tx in transactions {
            self.ingest(Some(peer), tx, now, &mut report);
        }
        debug!(%peer, ?report, "Ingested transactions");
        Ok(report)
    }

    /// Accept a transaction submitted by this node
    pub fn submit(&mut self, tx: Transaction, now: Instant) -> IngestReport {
        let mut report = IngestReport::default();
        self.ingest(None, tx, now, &mut report);
        report
    }

    pub fn on_disconnect(&mut self, peer: PeerId) {
        self.outstanding.remove(&peer);
    }

    fn ingest(
        &mut self,
        origin: Option<PeerId>,
        tx: Transaction,
        now: Instant,
        report: &mut IngestReport,
    ) {
        let id = tx.id();
        if self.recent.contains(&id, now) {
            report.duplicates += 1;
            return;
        }
        // Only what made it into a queue counts as seen; a dropped
        // transaction may be offered again later
        let kind = tx.kind;
        let sent = match kind {
            TxKind::Transfer => self.validator.try_dispatch((origin, tx)),
            TxKind::ContractCall => self.contract_queue.try_send((origin, tx)),
        };
        match sent {
            Ok(()) => {
                self.recent.insert(id, now);
                match kind {
                    TxKind::Transfer => report.transfers += 1,
                    TxKind::ContractCall => report.queued_contracts += 1,
                }
                return;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(tx = %id.short(), ?kind, "Queue full, dropping transaction");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(tx = %id.short(), ?kind, "Transaction queue has stopped");
            }
        }
        match kind {
            TxKind::Transfer => report.dropped_transfers += 1,
            TxKind::ContractCall => report.dropped_contracts += 1,
        }
    }
}
