//! Chain summaries: sparse samples of a chain that let two peers find their
//! most recent shared block in one round trip.

use std::collections::VecDeque;

use agora_common::{BlockId, BlockNumber};

use crate::chain_view::ChainView;
use crate::sync::SyncError;

/// A summary spans at most this many entries. Halving the gap each step
/// keeps any u64 range well inside it.
pub const MAX_SUMMARY_LEN: usize = 128;

/// Numbers from `low` to `high` inclusive, ascending, each step halving the
/// distance left to `high`
pub fn summary_numbers(low: BlockNumber, high: BlockNumber) -> Vec<BlockNumber> {
    let mut numbers = Vec::new();
    let mut number = low;
    loop {
        numbers.push(number);
        if number >= high {
            break;
        }
        number += (high - number).div_ceil(2);
    }
    numbers
}

/// Summary of our canonical chain from the solid block, continued through
/// `backlog` when it extends past what we hold
pub fn build_summary(chain: &impl ChainView, backlog: &VecDeque<BlockId>) -> Vec<BlockId> {
    let solid = chain.solid().number;
    let tip = backlog.back().map_or(chain.head().number, |id| id.number);
    let backlog_start = backlog.front().map(|id| id.number);
    summary_numbers(solid, tip)
        .into_iter()
        .filter_map(|number| match backlog_start {
            Some(start) if number >= start => backlog.get((number - start) as usize).copied(),
            _ => chain.canonical_id_at(number),
        })
        .collect()
}

/// Check a reply against the summary it answers
pub fn validate_reply(
    sent: &[BlockId],
    ids: &[BlockId],
    remaining: u64,
    batch_size: usize,
) -> Result<(), SyncError> {
    let Some(first) = ids.first() else {
        return Err(SyncError::EmptyReply);
    };
    if ids.len() > batch_size {
        return Err(SyncError::OversizedReply {
            len: ids.len(),
            batch_size,
        });
    }
    if let Some(pair) = ids.windows(2).find(|pair| pair[1].number != pair[0].number + 1) {
        return Err(SyncError::NotContiguous { at: pair[1] });
    }
    if !sent.contains(first) {
        return Err(SyncError::UnknownStart(*first));
    }
    if remaining > 0 && ids.len() != batch_size {
        return Err(SyncError::ShortBatch {
            len: ids.len(),
            remaining,
            batch_size,
        });
    }
    Ok(())
}

/// Answer a peer's summary: our canonical ids from the highest shared entry,
/// at most `batch_size` of them, and how many more we hold past the last
pub fn reply_for(
    chain: &impl ChainView,
    summary: &[BlockId],
    batch_size: usize,
) -> Result<(Vec<BlockId>, u64), SyncError> {
    let ascending = summary.windows(2).all(|pair| pair[0].number < pair[1].number);
    if summary.is_empty() || summary.len() > MAX_SUMMARY_LEN || !ascending {
        return Err(SyncError::MalformedSummary);
    }
    let shared = summary
        .iter()
        .rev()
        .find(|id| chain.is_canonical(id))
        .ok_or(SyncError::NoSharedBlock)?;

    let head = chain.head().number;
    let last = head.min(shared.number + batch_size.saturating_sub(1) as u64);
    let mut ids = Vec::with_capacity((last - shared.number + 1) as usize);
    for number in shared.number..=last {
        match chain.canonical_id_at(number) {
            Some(id) => ids.push(id),
            None => break,
        }
    }
    let served = ids.last().map_or(shared.number, |id| id.number);
    Ok((ids, head - served))
}
