//! Peer scoring.

use dashmap::DashMap;
use tracing::debug;

use super::peer::PeerId;

/// Records misbehaviour against a peer.
///
/// The rate limiter only ever calls [`PeerScorer::increment`]; how the
/// score is interpreted is up to the implementation.
pub trait PeerScorer: Send + Sync {
    /// Record one bad response from `peer`.
    fn increment(&self, peer: &PeerId);
}

/// Counts bad responses per peer and flags peers past a threshold.
pub struct BadResponsesScorer {
    counts: DashMap<PeerId, u64>,
    threshold: u64,
}

impl BadResponsesScorer {
    pub fn new(threshold: u64) -> Self {
        Self {
            counts: DashMap::new(),
            threshold,
        }
    }

    /// Current bad response count for `peer`.
    pub fn count(&self, peer: &PeerId) -> u64 {
        self.counts.get(peer).map(|c| *c).unwrap_or(0)
    }

    /// Whether `peer` has reached the threshold.
    pub fn is_bad_peer(&self, peer: &PeerId) -> bool {
        self.count(peer) >= self.threshold
    }

    /// Reduce every count by one, forgetting peers that reach zero.
    pub fn decay(&self) {
        self.counts.retain(|_, count| {
            *count = count.saturating_sub(1);
            *count > 0
        });
    }

    /// Number of peers with a non-zero count.
    pub fn tracked_peers(&self) -> usize {
        self.counts.len()
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl PeerScorer for BadResponsesScorer {
    fn increment(&self, peer: &PeerId) {
        let mut count = self.counts.entry(peer.clone()).or_insert(0);
        *count += 1;
        if *count == self.threshold {
            debug!(peer = %peer, count = *count, "Peer reached bad response threshold");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_threshold() {
        let scorer = BadResponsesScorer::new(2);
        let peer = PeerId::new("peer-a");

        assert_eq!(scorer.count(&peer), 0);
        scorer.increment(&peer);
        assert!(!scorer.is_bad_peer(&peer));
        scorer.increment(&peer);
        assert_eq!(scorer.count(&peer), 2);
        assert!(scorer.is_bad_peer(&peer));
    }

    #[test]
    fn test_peers_scored_independently() {
        let scorer = BadResponsesScorer::new(1);
        scorer.increment(&PeerId::new("peer-a"));

        assert!(scorer.is_bad_peer(&PeerId::new("peer-a")));
        assert!(!scorer.is_bad_peer(&PeerId::new("peer-b")));
    }

    #[test]
    fn test_decay_forgets_recovered_peers() {
        let scorer = BadResponsesScorer::new(3);
        let a = PeerId::new("peer-a");
        let b = PeerId::new("peer-b");
        scorer.increment(&a);
        scorer.increment(&b);
        scorer.increment(&b);

        scorer.decay();

        assert_eq!(scorer.count(&a), 0);
        assert_eq!(scorer.count(&b), 1);
        assert_eq!(scorer.tracked_peers(), 1);
    }
}
