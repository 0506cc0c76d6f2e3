//! Validation workers: dry-run transactions through the chain lock, then
//! announce the accepted ones or report the sender.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agora_common::peer::{NetworkEvent, NetworkEventSender, PeerId};
use agora_common::Transaction;
use agora_module_chain_coordinator::{SharedChain, TxOutcome};
use agora_module_propagation::PropagationService;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, warn};

/// A transaction and the peer it came from; `None` when submitted locally
pub type Submission = (Option<PeerId>, Transaction);

/// Handle to the validation workers. Submissions wait in a bounded queue;
/// a fixed number of workers take them off it.
#[derive(Clone)]
pub struct Validator {
    queue: mpsc::Sender<Submission>,
}

impl Validator {
    /// Start the worker pool. Must be called from within a tokio runtime.
    pub fn spawn(
        chain: SharedChain,
        propagation: Arc<PropagationService>,
        events: NetworkEventSender,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let (queue, submissions) = mpsc::channel(queue_capacity.max(1));
        let worker = Worker {
            chain,
            propagation,
            events,
        };
        tokio::spawn(run_workers(submissions, worker, workers.max(1)));
        Self { queue }
    }

    /// Queue a transaction without waiting; hands it back when the queue is
    /// full or the workers have stopped
    pub fn try_dispatch(&self, submission: Submission) -> Result<(), TrySendError<Submission>> {
        self.queue.try_send(submission)
    }

    /// Queue a transaction, waiting for room. False once the workers stopped.
    pub async fn dispatch(&self, submission: Submission) -> bool {
        self.queue.send(submission).await.is_ok()
    }

    /// No room left in the validation queue
    pub fn is_busy(&self) -> bool {
        self.queue.capacity() == 0
    }
}

/// Take submissions off the queue, starting a validation only once a worker
/// permit is free, so at most `workers` validations exist at any time
async fn run_workers(mut submissions: mpsc::Receiver<Submission>, worker: Worker, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers));
    while let Some((origin, tx)) = submissions.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };
        let worker = worker.clone();
        tokio::spawn(async move {
            worker.validate(origin, tx).await;
            drop(permit);
        });
    }
    debug!("Validation queue closed");
}

#[derive(Clone)]
struct Worker {
    chain: SharedChain,
    propagation: Arc<PropagationService>,
    events: NetworkEventSender,
}

impl Worker {
    async fn validate(&self, origin: Option<PeerId>, tx: Transaction) {
        let id = tx.id();
        let result = self.chain.lock().await.validate_transaction(tx.clone());
        match result {
            Ok(TxOutcome::Queued(receipt)) => {
                debug!(tx = %id.short(), cost = receipt.cost, "Transaction accepted");
                self.propagation.broadcast_transaction(&tx, origin, Instant::now());
            }
            Ok(TxOutcome::Duplicate) => debug!(tx = %id.short(), "Transaction already known"),
            Ok(TxOutcome::PoolFull) => {
                warn!(tx = %id.short(), "Pending pool full, dropping transaction")
            }
            Err(error) if error.penalises_peer() => {
                warn!(tx = %id.short(), "Transaction refused: {error}");
                let Some(peer) = origin else {
                    return;
                };
                let event = NetworkEvent::Penalise {
                    peer,
                    reason: error.disconnect_reason(),
                };
                if let Err(error) = self.events.write(event).await {
                    debug!("could not report {peer}: {error:#}");
                }
            }
            Err(error) => error!(tx = %id.short(), "Could not validate transaction: {error}"),
        }
    }
}

/// Hand queued contract calls to the validators, at most `batch` per
/// `period`. Returns once the queue's sender is gone and the queue is empty.
pub async fn drain_contracts(
    mut queue: mpsc::Receiver<Submission>,
    validator: Validator,
    period: Duration,
    batch: usize,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for _ in 0..batch {
            match queue.try_recv() {
                Ok(submission) => {
                    if !validator.dispatch(submission).await {
                        debug!("Validators stopped, contract drain exiting");
                        return;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("Contract queue closed");
                    return;
                }
            }
        }
    }
}
