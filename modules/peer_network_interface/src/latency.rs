//! Rolling per-peer delivery latency

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use agora_common::peer::PeerId;

pub struct LatencyTracker {
    window: usize,
    percentile: u8,
    initial: Duration,
    samples: HashMap<PeerId, VecDeque<Duration>>,
}

impl LatencyTracker {
    pub fn new(window: usize, percentile: u8, initial: Duration) -> Self {
        Self {
            window: window.max(1),
            percentile: percentile.clamp(1, 100),
            initial,
            samples: HashMap::new(),
        }
    }

    pub fn record(&mut self, peer: PeerId, sample: Duration) {
        let samples = self.samples.entry(peer).or_default();
        samples.push_back(sample);
        while samples.len() > self.window {
            samples.pop_front();
        }
    }

    /// Nearest-rank percentile of the peer's window, or the initial estimate
    /// for a peer without samples
    pub fn estimate(&self, peer: PeerId) -> Duration {
        let Some(samples) = self.samples.get(&peer).filter(|s| !s.is_empty()) else {
            return self.initial;
        };
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (usize::from(self.percentile) * sorted.len()).div_ceil(100);
        sorted[rank.max(1) - 1]
    }

    pub fn remove(&mut self, peer: PeerId) {
        self.samples.remove(&peer);
    }
}
