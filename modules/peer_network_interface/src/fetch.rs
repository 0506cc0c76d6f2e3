//! Single-slot block fetch scheduling.
//!
//! One block is fetched at a time, from the holder with the lowest estimated
//! latency. An in-flight request is handed to a faster peer when that peer
//! would finish well inside what the current assignee still has left.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use agora_common::peer::PeerId;
use agora_common::BlockId;
use tracing::{debug, warn};

use crate::configuration::FetchConfig;
use crate::latency::LatencyTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub id: BlockId,
    pub peer: PeerId,
    pub started: Instant,
}

/// Ask `peer` for block `id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub id: BlockId,
    pub peer: PeerId,
    /// The peer this request takes over from, after a pre-emption or timeout
    pub replaces: Option<PeerId>,
}

pub struct FetchScheduler {
    timeout: Duration,
    preemption_factor: u32,
    latency: LatencyTracker,
    slot: Option<Assignment>,
    /// Requests we stopped waiting for; the peer counts as busy until it
    /// answers or the timeout passes
    cancelled: HashMap<PeerId, Assignment>,
}

impl FetchScheduler {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            timeout: config.timeout(),
            preemption_factor: config.preemption_factor,
            latency: LatencyTracker::new(
                config.latency_window,
                config.percentile,
                config.initial_estimate(),
            ),
            slot: None,
            cancelled: HashMap::new(),
        }
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        self.slot.as_ref()
    }

    pub fn estimate(&self, peer: PeerId) -> Duration {
        self.latency.estimate(peer)
    }

    pub fn record_latency(&mut self, peer: PeerId, sample: Duration) {
        self.latency.record(peer, sample);
    }

    /// Re-evaluate the slot against the block currently needed and the peers
    /// holding it. Returns a request to send, if the slot was (re)assigned.
    pub fn tick(
        &mut self,
        needed: Option<(BlockId, &[PeerId])>,
        now: Instant,
    ) -> Option<FetchRequest> {
        let timeout = self.timeout;
        self.cancelled
            .retain(|_, assignment| now.saturating_duration_since(assignment.started) <= timeout);

        let current = self.slot.take();
        let Some((id, holders)) = needed else {
            if let Some(current) = current {
                self.cancel(current);
            }
            return None;
        };
        let current = match current {
            Some(stale) if stale.id != id => {
                self.cancel(stale);
                None
            }
            current => current,
        };
        let Some(current) = current else {
            return self.assign(id, holders, None, now);
        };

        let elapsed = now.saturating_duration_since(current.started);
        if elapsed > timeout {
            warn!(peer = %current.peer, block = %current.id, "Block fetch timed out");
            self.latency.record(current.peer, timeout);
            self.cancel(current);
            return self.assign(id, holders, Some(current.peer), now);
        }

        let budget = self.latency.estimate(current.peer).saturating_sub(elapsed);
        match self.best_candidate(holders, Some(current.peer)) {
            Some((candidate, estimate)) if estimate * self.preemption_factor < budget => {
                debug!(
                    block = %id,
                    from = %current.peer,
                    to = %candidate,
                    ?estimate,
                    ?budget,
                    "Pre-empting block fetch"
                );
                self.cancel(current);
                Some(self.start(id, candidate, Some(current.peer), now))
            }
            _ => {
                self.slot = Some(current);
                None
            }
        }
    }

    /// A block arrived from `peer`. True when it answered the live
    /// assignment.
    pub fn on_delivered(&mut self, peer: PeerId, id: BlockId, now: Instant) -> bool {
        if let Some(current) = self.slot.filter(|a| a.id == id) {
            self.slot = None;
            if current.peer == peer {
                self.latency.record(peer, now.saturating_duration_since(current.started));
                return true;
            }
            self.cancel(current);
        }
        if let Some(late) = self.cancelled.get(&peer).filter(|a| a.id == id).copied() {
            self.cancelled.remove(&peer);
            self.latency.record(peer, now.saturating_duration_since(late.started));
        }
        false
    }

    pub fn on_disconnect(&mut self, peer: PeerId) {
        self.latency.remove(peer);
        self.cancelled.remove(&peer);
        if self.slot.is_some_and(|a| a.peer == peer) {
            self.slot = None;
        }
    }

    fn cancel(&mut self, assignment: Assignment) {
        self.cancelled.insert(assignment.peer, assignment);
    }

    fn assign(
        &mut self,
        id: BlockId,
        holders: &[PeerId],
        replaces: Option<PeerId>,
        now: Instant,
    ) -> Option<FetchRequest> {
        let (peer, _) = self.best_candidate(holders, None)?;
        Some(self.start(id, peer, replaces, now))
    }

    fn start(
        &mut self,
        id: BlockId,
        peer: PeerId,
        replaces: Option<PeerId>,
        now: Instant,
    ) -> FetchRequest {
        self.slot = Some(Assignment {
            id,
            peer,
            started: now,
        });
        FetchRequest { id, peer, replaces }
    }

    /// Fastest eligible holder, ties to the lower peer id
    fn best_candidate(
        &self,
        holders: &[PeerId],
        exclude: Option<PeerId>,
    ) -> Option<(PeerId, Duration)> {
        holders
            .iter()
            .filter(|peer| Some(**peer) != exclude && !self.cancelled.contains_key(peer))
            .map(|peer| (*peer, self.latency.estimate(*peer)))
            .filter(|(_, estimate)| *estimate <= self.timeout)
            .min_by_key(|(peer, estimate)| (*estimate, *peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::BlockHash;

    fn config() -> FetchConfig {
        FetchConfig {
            timeout: 500,
            latency_window: 8,
            initial_estimate: 200,
            percentile: 75,
            preemption_factor: 2,
        }
    }

    fn block(n: u8) -> BlockId {
        BlockId::new(BlockHash::new([n; 32]), n as u64)
    }

    fn needed(id: BlockId, holders: &[PeerId]) -> Option<(BlockId, &[PeerId])> {
        Some((id, holders))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn picks_the_fastest_holder() {
        let mut fetch = FetchScheduler::new(&config());
        fetch.record_latency(PeerId(1), ms(300));
        fetch.record_latency(PeerId(2), ms(50));
        let request = fetch.tick(needed(block(1), &[PeerId(1), PeerId(2)]), Instant::now());
        assert_eq!(
            request,
            Some(FetchRequest {
                id: block(1),
                peer: PeerId(2),
                replaces: None
            })
        );
    }

    #[test]
    fn ties_go_to_the_lower_peer_id() {
        let mut fetch = FetchScheduler::new(&config());
        let request = fetch.tick(needed(block(1), &[PeerId(7), PeerId(3)]), Instant::now());
        assert_eq!(request.map(|r| r.peer), Some(PeerId(3)));
    }

    #[test]
    fn peers_slower_than_the_timeout_are_ineligible() {
        let mut fetch = FetchScheduler::new(&config());
        fetch.record_latency(PeerId(1), ms(900));
        assert_eq!(fetch.tick(needed(block(1), &[PeerId(1)]), Instant::now()), None);
    }

    #[test]
    fn in_flight_request_is_not_repeated() {
        let mut fetch = FetchScheduler::new(&config());
        let start = Instant::now();
        let holders = [PeerId(1)];
        assert!(fetch.tick(needed(block(1), &holders), start).is_some());
        assert_eq!(fetch.tick(needed(block(1), &holders), start + ms(10)), None);
        assert_eq!(fetch.assignment().map(|a| a.peer), Some(PeerId(1)));
    }

    #[test]
    fn delivery_clears_slot_and_records_latency() {
        let mut fetch = FetchScheduler::new(&config());
        let start = Instant::now();
        fetch.tick(needed(block(1), &[PeerId(1)]), start);
        assert!(fetch.on_delivered(PeerId(1), block(1), start + ms(40)));
        assert!(fetch.assignment().is_none());
        assert_eq!(fetch.estimate(PeerId(1)), ms(40));
    }

    #[test]
    fn timeout_reassigns_to_another_holder() {
        let mut fetch = FetchScheduler::new(&config());
        let start = Instant::now();
        let holders = [PeerId(1), PeerId(2)];
        fetch.record_latency(PeerId(2), ms(300));
        fetch.tick(needed(block(1), &holders), start);
        assert_eq!(fetch.assignment().map(|a| a.peer), Some(PeerId(1)));

        let request = fetch.tick(needed(block(1), &holders), start + ms(501)).unwrap();
        assert_eq!(request.peer, PeerId(2));
        assert_eq!(request.replaces, Some(PeerId(1)));
        // The slow peer got a timeout-length sample
        assert_eq!(fetch.estimate(PeerId(1)), ms(500));
    }

    #[test]
    fn timeout_without_replacement_empties_the_slot() {
        let mut fetch = FetchScheduler::new(&config());
        let start = Instant::now();
        fetch.tick(needed(block(1), &[PeerId(1)]), start);
        assert_eq!(fetch.tick(needed(block(1), &[PeerId(1)]), start + ms(501)), None);
        assert!(fetch.assignment().is_none());
    }

    #[test]
    fn late_delivery_from_preempted_peer_is_not_live() {
        let mut fetch = FetchScheduler::new(&config());
        let start = Instant::now();
        fetch.record_latency(PeerId(1), ms(400));
        fetch.tick(needed(block(1), &[PeerId(1)]), start);
        fetch.record_latency(PeerId(2), ms(10));
        let request = fetch.tick(needed(block(1), &[PeerId(1), PeerId(2)]), start + ms(5));
        assert_eq!(request.map(|r| r.peer), Some(PeerId(2)));

        assert!(!fetch.on_delivered(PeerId(1), block(1), start + ms(20)));
        // The block is in, so the new assignment is moot too
        assert!(fetch.assignment().is_none());
    }

    #[test]
    fn disconnect_forgets_the_peer() {
        let mut fetch = FetchScheduler::new(&config());
        fetch.record_latency(PeerId(1), ms(10));
        fetch.tick(needed(block(1), &[PeerId(1)]), Instant::now());
        fetch.on_disconnect(PeerId(1));
        assert!(fetch.assignment().is_none());
        assert_eq!(fetch.estimate(PeerId(1)), ms(200));
    }

    #[test]
    fn nothing_needed_cancels_the_slot() {
        let mut fetch = FetchScheduler::new(&config());
        let start = Instant::now();
        fetch.tick(needed(block(1), &[PeerId(1)]), start);
        assert_eq!(fetch.tick(None, start + ms(1)), None);
        assert!(fetch.assignment().is_none());
        // Still busy with the abandoned request
        assert_eq!(fetch.tick(needed(block(2), &[PeerId(1)]), start + ms(2)), None);
    }
}
