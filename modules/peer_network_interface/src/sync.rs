//! Per-peer chain-summary negotiation.
//!
//! Each peer moves `Idle → SummaryRequested → BacklogReady → Idle`. A round
//! sends our chain summary, validates the reply and turns it into a backlog:
//! the contiguous run of block ids the peer has and we do not.

use std::collections::{BTreeMap, VecDeque};

use agora_common::peer::PeerId;
use agora_common::{BlockId, BlockNumber, ChainError};
use thiserror::Error;
use tracing::{debug, info};

use crate::chain_summary::{build_summary, reply_for, validate_reply};
use crate::chain_view::ChainView;
use crate::configuration::SyncConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Peer runs genesis {theirs}, ours is {ours}")]
    GenesisMismatch { ours: BlockId, theirs: BlockId },

    #[error("Handshake received twice")]
    DuplicateHandshake,

    #[error("Message received before handshake")]
    NoHandshake,

    #[error("Chain summary reply without an outstanding request")]
    Unsolicited,

    #[error("Empty chain summary reply")]
    EmptyReply,

    #[error("Reply of {len} ids exceeds the batch size {batch_size}")]
    OversizedReply { len: usize, batch_size: usize },

    #[error("Reply ids are not contiguous at {at}")]
    NotContiguous { at: BlockId },

    #[error("Reply starts at {0}, which is not in our summary")]
    UnknownStart(BlockId),

    #[error("Reply has {len} ids with {remaining} remaining; a full batch is {batch_size}")]
    ShortBatch {
        len: usize,
        remaining: u64,
        batch_size: usize,
    },

    #[error("Chain summary is empty, unordered or too long")]
    MalformedSummary,

    #[error("Chain summary shares no block with our chain")]
    NoSharedBlock,
}

impl From<SyncError> for ChainError {
    fn from(error: SyncError) -> Self {
        ChainError::BadMessage(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    SummaryRequested,
    BacklogReady,
}

#[derive(Debug, Clone)]
pub struct PeerSyncState {
    pub state: SyncState,
    /// Head the peer last told us about
    pub head: BlockId,
    pub we_need_sync_from_peer: bool,
    pub peer_needs_sync_from_us: bool,
    backlog: VecDeque<BlockId>,
    sent_summary: Option<Vec<BlockId>>,
    remaining: u64,
}

impl PeerSyncState {
    fn new(head: BlockId) -> Self {
        Self {
            state: SyncState::Idle,
            head,
            we_need_sync_from_peer: false,
            peer_needs_sync_from_us: false,
            backlog: VecDeque::new(),
            sent_summary: None,
            remaining: 0,
        }
    }

    pub fn backlog(&self) -> &VecDeque<BlockId> {
        &self.backlog
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn has(&self, id: &BlockId) -> bool {
        let Some(front) = self.backlog.front() else {
            return false;
        };
        id.number
            .checked_sub(front.number)
            .and_then(|offset| self.backlog.get(offset as usize))
            .is_some_and(|queued| queued == id)
    }

    /// Fold newly learned ids into the backlog, keeping it contiguous. An
    /// overlap that disagrees with the queued ids truncates the backlog at
    /// the first disagreement; a reply that does not join up replaces it.
    fn merge(&mut self, new_ids: Vec<BlockId>) {
        let Some(first) = new_ids.first() else {
            return;
        };
        let joins = match (self.backlog.front(), self.backlog.back()) {
            (Some(front), Some(back)) => {
                first.number >= front.number && first.number <= back.number + 1
            }
            _ => false,
        };
        if !joins {
            self.backlog = new_ids.into();
            return;
        }

        let start = (first.number - self.backlog[0].number) as usize;
        let mut skip = 0;
        for (offset, id) in new_ids.iter().enumerate() {
            match self.backlog.get(start + offset) {
                Some(queued) if queued == id => skip += 1,
                Some(_) => {
                    self.backlog.truncate(start + offset);
                    break;
                }
                None => break,
            }
        }
        self.backlog.extend(new_ids.into_iter().skip(skip));
    }
}

/// What to do after a chain summary reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    /// The backlog has blocks worth fetching
    Fetch,
    /// Send this summary to the peer for the next batch
    RequestSummary(Vec<BlockId>),
    /// The peer has nothing we lack
    InSync,
}

pub struct SyncNegotiator {
    config: SyncConfig,
    peers: BTreeMap<PeerId, PeerSyncState>,
}

impl SyncNegotiator {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            peers: BTreeMap::new(),
        }
    }

    pub fn peer(&self, peer: PeerId) -> Option<&PeerSyncState> {
        self.peers.get(&peer)
    }

    pub fn state(&self, peer: PeerId) -> Option<SyncState> {
        self.peers.get(&peer).map(|p| p.state)
    }

    pub fn backlog(&self, peer: PeerId) -> Option<&VecDeque<BlockId>> {
        self.peers.get(&peer).map(|p| &p.backlog)
    }

    pub fn is_known(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Start tracking a peer. Returns a summary to send when the peer holds a
    /// head we do not know.
    pub fn on_handshake(
        &mut self,
        peer: PeerId,
        chain: &impl ChainView,
        genesis: BlockId,
        head: BlockId,
    ) -> Result<Option<Vec<BlockId>>, SyncError> {
        if genesis != chain.genesis() {
            return Err(SyncError::GenesisMismatch {
                ours: chain.genesis(),
                theirs: genesis,
            });
        }
        if self.peers.contains_key(&peer) {
            return Err(SyncError::DuplicateHandshake);
        }
        let mut state = PeerSyncState::new(head);
        state.peer_needs_sync_from_us = head.number < chain.head().number;
        self.peers.insert(peer, state);
        info!(%peer, %head, "Peer joined");
        self.note_head(peer, chain, head)
    }

    /// A peer revealed a block at or beyond its previous head. Returns a
    /// summary to send when that leaves us behind it.
    pub fn note_head(
        &mut self,
        peer: PeerId,
        chain: &impl ChainView,
        head: BlockId,
    ) -> Result<Option<Vec<BlockId>>, SyncError> {
        let state = self.peers.get_mut(&peer).ok_or(SyncError::NoHandshake)?;
        if head.number >= state.head.number {
            state.head = head;
        }
        if chain.contains(&head) || state.has(&head) {
            return Ok(None);
        }
        state.we_need_sync_from_peer = true;
        Ok(self.request_summary(peer, chain))
    }

    /// Begin a round with `peer`, unless one is already outstanding
    pub fn request_summary(&mut self, peer: PeerId, chain: &impl ChainView) -> Option<Vec<BlockId>> {
        let state = self.peers.get_mut(&peer)?;
        if state.state == SyncState::SummaryRequested {
            return None;
        }
        let summary = build_summary(chain, &state.backlog);
        state.sent_summary = Some(summary.clone());
        state.state = SyncState::SummaryRequested;
        debug!(%peer, entries = summary.len(), "Requesting chain summary");
        Some(summary)
    }

    /// Take a reply to our summary. A reply that fails validation leaves the
    /// peer's state untouched.
    pub fn on_summary_reply(
        &mut self,
        peer: PeerId,
        chain: &impl ChainView,
        ids: Vec<BlockId>,
        remaining: u64,
    ) -> Result<SyncStep, SyncError> {
        let batch_size = self.config.batch_size;
        let threshold = self.config.backlog_threshold;
        let state = self.peers.get_mut(&peer).ok_or(SyncError::NoHandshake)?;
        let sent = match (&state.state, &state.sent_summary) {
            (SyncState::SummaryRequested, Some(sent)) => sent,
            _ => return Err(SyncError::Unsolicited),
        };
        validate_reply(sent, &ids, remaining, batch_size)?;

        let new_ids: Vec<BlockId> = ids.into_iter().skip_while(|id| chain.contains(id)).collect();
        state.merge(new_ids);
        while state.backlog.front().is_some_and(|id| chain.contains(id)) {
            state.backlog.pop_front();
        }
        state.sent_summary = None;
        state.remaining = remaining;
        if let Some(last) = state.backlog.back() {
            if last.number > state.head.number {
                state.head = *last;
            }
        }
        debug!(
            %peer,
            backlog = state.backlog.len(),
            remaining,
            "Accepted chain summary reply"
        );

        if remaining > 0 && state.backlog.len() < threshold {
            state.state = SyncState::Idle;
            let summary = self.request_summary(peer, chain);
            return Ok(summary.map_or(SyncStep::Fetch, SyncStep::RequestSummary));
        }
        if !state.backlog.is_empty() {
            state.state = SyncState::BacklogReady;
            return Ok(SyncStep::Fetch);
        }
        state.state = SyncState::Idle;
        state.we_need_sync_from_peer = false;
        Ok(SyncStep::InSync)
    }

    /// Serve a peer's summary from our chain
    pub fn on_summary_request(
        &mut self,
        peer: PeerId,
        chain: &impl ChainView,
        summary: &[BlockId],
    ) -> Result<(Vec<BlockId>, u64), SyncError> {
        let state = self.peers.get_mut(&peer).ok_or(SyncError::NoHandshake)?;
        let (ids, remaining) = reply_for(chain, summary, self.config.batch_size)?;
        state.peer_needs_sync_from_us = remaining > 0;
        Ok((ids, remaining))
    }

    /// The chain moved on: drop backlog entries we now hold. Returns summary
    /// requests for peers whose backlog drained while they still have more.
    pub fn on_chain_advanced(&mut self, chain: &impl ChainView) -> Vec<(PeerId, Vec<BlockId>)> {
        let solid = chain.solid().number;
        let mut drained = Vec::new();
        for (peer, state) in self.peers.iter_mut() {
            while state
                .backlog
                .front()
                .is_some_and(|id| id.number <= solid || chain.contains(id))
            {
                state.backlog.pop_front();
            }
            if state.state == SyncState::BacklogReady && state.backlog.is_empty() {
                state.state = SyncState::Idle;
                if state.remaining > 0 {
                    drained.push(*peer);
                } else {
                    state.we_need_sync_from_peer = false;
                }
            }
        }
        drained
            .into_iter()
            .filter_map(|peer| self.request_summary(peer, chain).map(|summary| (peer, summary)))
            .collect()
    }

    /// The lowest backlog entry we still lack, and the peers holding it
    pub fn next_needed(&self, chain: &impl ChainView) -> Option<(BlockId, Vec<PeerId>)> {
        let next = self
            .peers
            .values()
            .filter_map(|state| state.backlog.iter().find(|id| !chain.contains(id)))
            .min()
            .copied()?;
        let holders = self
            .peers
            .iter()
            .filter(|(_, state)| state.has(&next))
            .map(|(peer, _)| *peer)
            .collect();
        Some((next, holders))
    }

    /// Some peer still has blocks past `number` for us: queued in its
    /// backlog, or reported as remaining beyond it
    pub fn is_behind(&self, number: BlockNumber) -> bool {
        self.peers.values().any(|state| {
            state.remaining > 0 || state.backlog.back().is_some_and(|last| last.number > number)
        })
    }

    pub fn on_disconnect(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::BlockHash;

    /// Canonical ids `0..=head`; ids with any other salt are unknown
    struct FakeChain {
        head: u64,
        solid: u64,
        salt: u8,
    }

    fn id_on(salt: u8, number: u64) -> BlockId {
        let mut bytes = [salt; 32];
        bytes[..8].copy_from_slice(&number.to_be_bytes());
        BlockId::new(BlockHash::new(bytes), number)
    }

    fn id(number: u64) -> BlockId {
        id_on(0, number)
    }

    impl ChainView for FakeChain {
        fn genesis(&self) -> BlockId {
            id(0)
        }
        fn head(&self) -> BlockId {
            id_on(self.salt, self.head)
        }
        fn solid(&self) -> BlockId {
            id(self.solid)
        }
        fn contains(&self, block: &BlockId) -> bool {
            block.number <= self.head && self.is_canonical(block)
        }
        fn is_canonical(&self, block: &BlockId) -> bool {
            self.canonical_id_at(block.number) == Some(*block)
        }
        fn canonical_id_at(&self, number: u64) -> Option<BlockId> {
            if number > self.head {
                None
            } else if number <= self.solid {
                Some(id(number))
            } else {
                Some(id_on(self.salt, number))
            }
        }
    }

    fn chain(head: u64) -> FakeChain {
        FakeChain {
            head,
            solid: 0,
            salt: 0,
        }
    }

    fn negotiator(batch_size: usize, backlog_threshold: usize) -> SyncNegotiator {
        SyncNegotiator::new(SyncConfig {
            batch_size,
            backlog_threshold,
        })
    }

    fn ids(range: std::ops::RangeInclusive<u64>) -> Vec<BlockId> {
        range.map(id).collect()
    }

    #[test]
    fn handshake_with_unknown_head_requests_summary() {
        let mut sync = negotiator(10, 5);
        let ours = chain(3);
        let summary = sync.on_handshake(PeerId(1), &ours, id(0), id(20)).unwrap();
        assert_eq!(summary, Some(vec![id(0), id(2), id(3)]));
        assert_eq!(sync.state(PeerId(1)), Some(SyncState::SummaryRequested));
        assert!(sync.peer(PeerId(1)).unwrap().we_need_sync_from_peer);

        let behind = sync.on_handshake(PeerId(2), &ours, id(0), id(1)).unwrap();
        assert_eq!(behind, None);
        assert!(sync.peer(PeerId(2)).unwrap().peer_needs_sync_from_us);
    }

    #[test]
    fn different_genesis_is_refused() {
        let mut sync = negotiator(10, 5);
        let result = sync.on_handshake(PeerId(1), &chain(3), id_on(9, 0), id(5));
        assert!(matches!(result, Err(SyncError::GenesisMismatch { .. })));
        assert!(!sync.is_known(PeerId(1)));
    }

    #[test]
    fn reply_without_request_is_unsolicited() {
        let mut sync = negotiator(10, 5);
        let ours = chain(3);
        sync.on_handshake(PeerId(1), &ours, id(0), id(2)).unwrap();
        assert_eq!(
            sync.on_summary_reply(PeerId(1), &ours, ids(3..=5), 0),
            Err(SyncError::Unsolicited)
        );
    }

    #[test]
    fn final_reply_fills_backlog_with_unknown_ids() {
        let mut sync = negotiator(10, 5);
        let ours = chain(3);
        sync.on_handshake(PeerId(1), &ours, id(0), id(7)).unwrap();

        let step = sync.on_summary_reply(PeerId(1), &ours, ids(3..=7), 0).unwrap();
        assert_eq!(step, SyncStep::Fetch);
        assert_eq!(sync.backlog(PeerId(1)).unwrap(), &ids(4..=7));
        assert_eq!(sync.state(PeerId(1)), Some(SyncState::BacklogReady));
    }

    #[test]
    fn small_backlog_with_more_remaining_asks_again() {
        let mut sync = negotiator(4, 10);
        let ours = chain(3);
        sync.on_handshake(PeerId(1), &ours, id(0), id(50)).unwrap();

        let step = sync.on_summary_reply(PeerId(1), &ours, ids(3..=6), 44).unwrap();
        // The next summary reaches through the backlog tip
        match step {
            SyncStep::RequestSummary(summary) => assert_eq!(summary.last(), Some(&id(6))),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sync.state(PeerId(1)), Some(SyncState::SummaryRequested));

        sync.on_summary_reply(PeerId(1), &ours, ids(6..=9), 41).unwrap();
        assert_eq!(sync.backlog(PeerId(1)).unwrap(), &ids(4..=9));
    }

    #[test]
    fn peer_with_nothing_new_is_in_sync() {
        let mut sync = negotiator(10, 5);
        let ours = chain(5);
        sync.on_handshake(PeerId(1), &ours, id(0), id_on(7, 5)).unwrap();
        let step = sync.on_summary_reply(PeerId(1), &ours, vec![id(5)], 0).unwrap();
        assert_eq!(step, SyncStep::InSync);
        assert_eq!(sync.state(PeerId(1)), Some(SyncState::Idle));
        assert!(!sync.peer(PeerId(1)).unwrap().we_need_sync_from_peer);
    }

    #[test]
    fn diverging_overlap_truncates_backlog() {
        let mut state = PeerSyncState::new(id(0));
        state.merge(ids(4..=9));
        let fork: Vec<_> = [id(6), id_on(3, 7), id_on(3, 8)].into();
        state.merge(fork);
        let expected: Vec<_> = [id(4), id(5), id(6), id_on(3, 7), id_on(3, 8)].into();
        assert_eq!(state.backlog, VecDeque::from(expected));
    }

    #[test]
    fn gap_replaces_backlog() {
        let mut state = PeerSyncState::new(id(0));
        state.merge(ids(4..=6));
        state.merge(ids(9..=10));
        assert_eq!(state.backlog, VecDeque::from(ids(9..=10)));
    }

    #[test]
    fn chain_progress_drains_backlog_and_reopens_round() {
        let mut sync = negotiator(4, 2);
        let mut ours = chain(3);
        sync.on_handshake(PeerId(1), &ours, id(0), id(40)).unwrap();
        sync.on_summary_reply(PeerId(1), &ours, ids(3..=6), 30).unwrap();
        assert_eq!(sync.state(PeerId(1)), Some(SyncState::BacklogReady));
        assert_eq!(sync.next_needed(&ours), Some((id(4), vec![PeerId(1)])));

        ours.head = 5;
        assert!(sync.on_chain_advanced(&ours).is_empty());
        assert_eq!(sync.backlog(PeerId(1)).unwrap(), &ids(6..=6));

        ours.head = 6;
        let requests = sync.on_chain_advanced(&ours);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, PeerId(1));
        assert_eq!(sync.state(PeerId(1)), Some(SyncState::SummaryRequested));
    }

    #[test]
    fn next_needed_lists_every_holder() {
        let mut sync = negotiator(10, 1);
        let ours = chain(2);
        for peer in [PeerId(1), PeerId(2)] {
            sync.on_handshake(peer, &ours, id(0), id(6)).unwrap();
        }
        sync.on_summary_reply(PeerId(1), &ours, ids(2..=6), 0).unwrap();
        sync.on_summary_reply(PeerId(2), &ours, ids(2..=4), 0).unwrap();
        assert_eq!(sync.next_needed(&ours), Some((id(3), vec![PeerId(1), PeerId(2)])));

        sync.on_disconnect(PeerId(1));
        assert_eq!(sync.next_needed(&ours), Some((id(3), vec![PeerId(2)])));
    }

    #[test]
    fn serving_side_replies_from_highest_shared_id() {
        let mut sync = negotiator(3, 1);
        let ours = chain(10);
        sync.on_handshake(PeerId(1), &ours, id(0), id(2)).unwrap();
        let (reply, remaining) =
            sync.on_summary_request(PeerId(1), &ours, &[id(0), id(2)]).unwrap();
        assert_eq!(reply, ids(2..=4));
        assert_eq!(remaining, 6);
        assert!(sync.peer(PeerId(1)).unwrap().peer_needs_sync_from_us);

        let foreign = [id_on(5, 0)];
        assert_eq!(
            sync.on_summary_request(PeerId(1), &ours, &foreign),
            Err(SyncError::NoSharedBlock)
        );
    }

    #[test]
    fn behind_until_the_backlog_tip() {
        let mut sync = negotiator(10, 1);
        let mut ours = chain(2);
        sync.on_handshake(PeerId(1), &ours, id(0), id(6)).unwrap();
        assert!(!sync.is_behind(2));

        sync.on_summary_reply(PeerId(1), &ours, ids(2..=6), 0).unwrap();
        assert!(sync.is_behind(3));
        assert!(sync.is_behind(5));
        assert!(!sync.is_behind(6));

        ours.head = 6;
        sync.on_chain_advanced(&ours);
        assert!(!sync.is_behind(6));
    }

    #[test]
    fn remaining_ids_keep_us_behind() {
        let mut sync = negotiator(4, 2);
        let ours = chain(3);
        sync.on_handshake(PeerId(1), &ours, id(0), id(40)).unwrap();
        sync.on_summary_reply(PeerId(1), &ours, ids(3..=6), 30).unwrap();
        assert!(sync.is_behind(6));
    }
}
