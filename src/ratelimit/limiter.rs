//! Multi-topic rate limiter for inbound request/response streams.
//!
//! Every topic resolves to a leaky bucket [`Collector`]. Several topics may
//! resolve to the same collector: all bulk requests draw from one pool,
//! while cheap control topics keep independent budgets so they cannot
//! starve each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use super::collector::Collector;
use super::response::{write_error_response_to_stream, RESPONSE_CODE_INVALID_REQUEST};
use crate::error::{NodeError, Result};
use crate::p2p::topics::{
    with_suffix, RPC_BLOCKS_BY_RANGE_TOPIC, RPC_BLOCKS_BY_ROOT_TOPIC, RPC_GOODBYE_TOPIC,
    RPC_METADATA_TOPIC, RPC_PING_TOPIC, RPC_STATUS_TOPIC,
};
use crate::p2p::{Encoding, PeerId, PeerScorer, RpcStream};

/// Burst size most topic budgets are derived from.
pub const DEFAULT_BURST_LIMIT: i64 = 5;

/// Catch-all topic every inbound stream is metered against.
pub const RPC_LIMITER_TOPIC: &str = "rpc-limiter-topic";

/// Topic to collector assignment.
///
/// Each distinct collector is stored once; topics hold indices into
/// `collectors`, so aliasing never produces a second owner. The registry
/// lives inside the limiter's lock and is never handed out, so every
/// lookup happens under the guard.
#[derive(Default)]
struct TopicRegistry {
    collectors: Vec<Collector>,
    topics: HashMap<String, usize>,
}

impl TopicRegistry {
    /// Register `collector` under every topic in `topics`.
    fn register(&mut self, topics: &[String], collector: Collector) {
        debug!(
            topics = ?topics,
            capacity = collector.capacity(),
            rate = collector.rate(),
            "Registering rate limit collector"
        );
        let index = self.collectors.len();
        self.collectors.push(collector);
        for topic in topics {
            self.topics.insert(topic.clone(), index);
        }
    }

    fn retrieve_collector(&self, topic: &str) -> Result<&Collector> {
        self.topics
            .get(topic)
            .map(|&index| &self.collectors[index])
            .ok_or_else(|| NodeError::UnconfiguredTopic(topic.to_string()))
    }

    fn retrieve_collector_mut(&mut self, topic: &str) -> Result<&mut Collector> {
        match self.topics.get(topic) {
            Some(&index) => Ok(&mut self.collectors[index]),
            None => Err(NodeError::UnconfiguredTopic(topic.to_string())),
        }
    }

    /// Free every distinct collector once and drop all topics.
    ///
    /// Returns the freed collectors.
    fn free(&mut self) -> Vec<Collector> {
        self.topics.clear();
        let mut freed: Vec<Collector> = self.collectors.drain(..).collect();
        for collector in &mut freed {
            collector.free();
        }
        freed
    }
}

/// Per-topic, per-peer rate limiter.
///
/// Admission is split in two: `validate_*` only reads the budget, `add*`
/// charges it once the request has been served. The two calls are not
/// atomic, so concurrent requests from one peer can each pass validation
/// before any of them is charged. The overshoot is bounded by the number
/// of requests the peer has in flight on a topic; callers that need a hard
/// bound must serialise requests per peer.
pub struct Limiter {
    registry: RwLock<TopicRegistry>,
    scorer: Arc<dyn PeerScorer>,
    encoding: Arc<dyn Encoding>,
}

impl Limiter {
    /// Build a limiter with a collector for every served topic.
    pub fn new(
        encoding: Arc<dyn Encoding>,
        scorer: Arc<dyn PeerScorer>,
        default_burst_limit: i64,
    ) -> Self {
        let add_encoding = |topic: &str| with_suffix(topic, encoding.protocol_suffix());
        let mut registry = TopicRegistry::default();

        // Goodbye message
        registry.register(&[add_encoding(RPC_GOODBYE_TOPIC)], Collector::new(1.0, 1));
        // Metadata message
        registry.register(
            &[add_encoding(RPC_METADATA_TOPIC)],
            Collector::new(1.0, default_burst_limit),
        );
        // Ping message
        registry.register(
            &[add_encoding(RPC_PING_TOPIC)],
            Collector::new(1.0, default_burst_limit),
        );
        // Status message
        registry.register(
            &[add_encoding(RPC_STATUS_TOPIC)],
            Collector::new(1.0, default_burst_limit),
        );
        // Bulk requests share a single collector.
        registry.register(
            &[
                add_encoding(RPC_BLOCKS_BY_RANGE_TOPIC),
                add_encoding(RPC_BLOCKS_BY_ROOT_TOPIC),
            ],
            Collector::new(1.0, default_burst_limit.saturating_mul(20)),
        );
        // General topic for all rpc requests.
        registry.register(
            &[RPC_LIMITER_TOPIC.to_string()],
            Collector::new(5.0, default_burst_limit.saturating_mul(2)),
        );

        debug!(
            topics = registry.topics.len(),
            collectors = registry.collectors.len(),
            "Rate limiter initialized"
        );

        Self {
            registry: RwLock::new(registry),
            scorer,
            encoding,
        }
    }

    /// Validate a request of `amount` units against the stream's topic.
    ///
    /// A zero amount counts as one. The budget is not charged; call
    /// [`Limiter::add`] after the request has been served. On rejection the
    /// peer is penalised and an error response is written to the stream.
    pub async fn validate_request<S>(&self, stream: &mut S, amount: u64) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let topic = stream.protocol().to_string();
        self.validate(stream, &topic, amount.max(1)).await
    }

    /// Validate any inbound stream against the general topic at a cost of one.
    pub async fn validate_raw_rpc_request<S>(&self, stream: &mut S) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        self.validate(stream, RPC_LIMITER_TOPIC, 1).await
    }

    /// Charge `amount` units to the stream's topic for its peer.
    ///
    /// An unregistered topic is logged and otherwise ignored.
    pub fn add<S>(&self, stream: &S, amount: i64)
    where
        S: RpcStream + ?Sized,
    {
        self.add_to(stream.protocol(), stream.remote_peer(), amount);
    }

    /// Charge one unit to the general topic for the stream's peer.
    pub fn add_raw_stream<S>(&self, stream: &S)
    where
        S: RpcStream + ?Sized,
    {
        self.add_to(RPC_LIMITER_TOPIC, stream.remote_peer(), 1);
    }

    /// Tokens left for `peer` on `topic`.
    pub fn topic_remaining(&self, topic: &str, peer: &PeerId) -> Result<i64> {
        let registry = self.registry.read();
        let collector = registry.retrieve_collector(topic)?;
        Ok(collector.remaining(peer.as_str()))
    }

    /// Number of registered topics.
    pub fn topic_count(&self) -> usize {
        self.registry.read().topics.len()
    }

    /// Drop fully replenished peer buckets from every collector.
    pub fn prune(&self) -> usize {
        let mut registry = self.registry.write();
        let pruned: usize = registry.collectors.iter_mut().map(Collector::prune).sum();
        trace!(pruned, "Pruned idle rate limit buckets");
        pruned
    }

    /// Free all collectors and remove them, returning how many were freed.
    ///
    /// Shared collectors are freed once regardless of how many topics
    /// alias them. Streams must no longer be accepted when this is called;
    /// afterwards every topic is unconfigured.
    pub fn free(&self) -> usize {
        let mut registry = self.registry.write();
        let freed = registry.free().len();
        debug!(freed, "Rate limiter freed");
        freed
    }

    async fn validate<S>(&self, stream: &mut S, topic: &str, amount: u64) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let remaining = {
            let registry = self.registry.read();
            let collector = registry.retrieve_collector(topic).map_err(|e| {
                error!(topic = %topic, "Collector does not exist for topic");
                e
            })?;
            collector.remaining(stream.remote_peer().as_str())
        };

        trace!(
            topic = %topic,
            peer = %stream.remote_peer(),
            amount,
            remaining,
            "Validating request"
        );

        if i128::from(amount) > i128::from(remaining) {
            warn!(
                topic = %topic,
                peer = %stream.remote_peer(),
                amount,
                remaining,
                "Peer exceeded rate limit"
            );
            self.scorer.increment(stream.remote_peer());
            write_error_response_to_stream(
                RESPONSE_CODE_INVALID_REQUEST,
                &NodeError::RateLimited.to_string(),
                stream,
                self.encoding.as_ref(),
            )
            .await;
            return Err(NodeError::RateLimited);
        }
        Ok(())
    }

    fn add_to(&self, topic: &str, peer: &PeerId, amount: i64) {
        let mut registry = self.registry.write();
        match registry.retrieve_collector_mut(topic) {
            Ok(collector) => {
                let left = collector.add(peer.as_str(), amount);
                trace!(topic = %topic, peer = %peer, amount, remaining = left, "Charged rate limit");
            }
            Err(_) => {
                error!(topic = %topic, "Collector does not exist for topic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::testing::MockStream;
    use crate::p2p::{BadResponsesScorer, ProtoEncoding};
    use std::time::Duration;

    fn test_limiter() -> (Arc<Limiter>, Arc<BadResponsesScorer>) {
        let scorer = Arc::new(BadResponsesScorer::new(100));
        let limiter = Limiter::new(Arc::new(ProtoEncoding), scorer.clone(), DEFAULT_BURST_LIMIT);
        (Arc::new(limiter), scorer)
    }

    fn stream(topic: &str, peer: &str) -> MockStream {
        MockStream::new(with_suffix(topic, "/proto"), peer)
    }

    fn topic(base: &str) -> String {
        with_suffix(base, "/proto")
    }

    #[test]
    fn test_limiter_wiring() {
        let (limiter, _) = test_limiter();
        let peer = PeerId::new("peer");

        assert_eq!(limiter.topic_count(), 7);
        assert_eq!(limiter.topic_remaining(&topic(RPC_GOODBYE_TOPIC), &peer).unwrap(), 1);
        assert_eq!(limiter.topic_remaining(&topic(RPC_PING_TOPIC), &peer).unwrap(), 5);
        assert_eq!(limiter.topic_remaining(&topic(RPC_BLOCKS_BY_ROOT_TOPIC), &peer).unwrap(), 100);
        assert_eq!(limiter.topic_remaining(RPC_LIMITER_TOPIC, &peer).unwrap(), 10);
    }

    #[tokio::test]
    async fn test_goodbye_limit_and_refill() {
        let (limiter, scorer) = test_limiter();
        let mut s = stream(RPC_GOODBYE_TOPIC, "P");

        assert!(limiter.validate_request(&mut s, 1).await.is_ok());
        limiter.add(&s, 1);

        let err = limiter.validate_request(&mut s, 1).await.unwrap_err();
        assert!(matches!(err, NodeError::RateLimited));
        assert_eq!(scorer.count(&PeerId::new("P")), 1);
        assert_eq!(s.written.len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.validate_request(&mut s, 1).await.is_ok());
        assert_eq!(s.written.len(), 1);
    }

    #[tokio::test]
    async fn test_validate_does_not_charge() {
        let (limiter, _) = test_limiter();
        let mut s = stream(RPC_GOODBYE_TOPIC, "P");

        for _ in 0..3 {
            assert!(limiter.validate_request(&mut s, 1).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_zero_amount_counts_as_one() {
        let (limiter, scorer) = test_limiter();
        let mut s = stream(RPC_GOODBYE_TOPIC, "P");

        assert!(limiter.validate_request(&mut s, 0).await.is_ok());
        limiter.add(&s, 1);

        let zero = limiter.validate_request(&mut s, 0).await;
        let one = limiter.validate_request(&mut s, 1).await;
        assert!(matches!(zero, Err(NodeError::RateLimited)));
        assert!(matches!(one, Err(NodeError::RateLimited)));
        assert_eq!(scorer.count(&PeerId::new("P")), 2);
    }

    #[tokio::test]
    async fn test_admission_until_exhausted() {
        let (limiter, scorer) = test_limiter();
        let mut s = stream(RPC_METADATA_TOPIC, "P");

        for _ in 0..DEFAULT_BURST_LIMIT {
            assert!(limiter.validate_request(&mut s, 1).await.is_ok());
            limiter.add(&s, 1);
        }
        assert!(s.written.is_empty());

        let err = limiter.validate_request(&mut s, 1).await.unwrap_err();
        assert!(matches!(err, NodeError::RateLimited));
        assert_eq!(scorer.count(&PeerId::new("P")), 1);
        assert_eq!(s.written.len(), 1);
        assert_eq!(s.written[0][0], RESPONSE_CODE_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_amount_above_capacity_rejected() {
        let (limiter, _) = test_limiter();
        let mut s = stream(RPC_BLOCKS_BY_RANGE_TOPIC, "P");

        assert!(limiter.validate_request(&mut s, 100).await.is_ok());
        let err = limiter.validate_request(&mut s, 101).await.unwrap_err();
        assert!(matches!(err, NodeError::RateLimited));
    }

    #[tokio::test]
    async fn test_aliased_topics_share_budget() {
        let (limiter, _) = test_limiter();
        let by_range = stream(RPC_BLOCKS_BY_RANGE_TOPIC, "P");
        let mut by_root = stream(RPC_BLOCKS_BY_ROOT_TOPIC, "P");

        limiter.add(&by_range, 95);

        let peer = PeerId::new("P");
        assert_eq!(limiter.topic_remaining(&topic(RPC_BLOCKS_BY_ROOT_TOPIC), &peer).unwrap(), 5);
        assert_eq!(
            limiter.topic_remaining(&topic(RPC_BLOCKS_BY_ROOT_TOPIC), &PeerId::new("Q")).unwrap(),
            100
        );
        let err = limiter.validate_request(&mut by_root, 10).await.unwrap_err();
        assert!(matches!(err, NodeError::RateLimited));
    }

    #[tokio::test]
    async fn test_independent_topics_do_not_starve() {
        let (limiter, _) = test_limiter();
        let ping = stream(RPC_PING_TOPIC, "P");
        let mut status = stream(RPC_STATUS_TOPIC, "P");

        limiter.add(&ping, DEFAULT_BURST_LIMIT);

        assert!(limiter.validate_request(&mut status, 1).await.is_ok());
        assert_eq!(
            limiter.topic_remaining(&topic(RPC_STATUS_TOPIC), &PeerId::new("P")).unwrap(),
            DEFAULT_BURST_LIMIT
        );
    }

    #[tokio::test]
    async fn test_general_gate_rejects_eleventh_stream() {
        let (limiter, _) = test_limiter();
        let topics = [RPC_PING_TOPIC, RPC_STATUS_TOPIC, RPC_METADATA_TOPIC, RPC_BLOCKS_BY_RANGE_TOPIC];

        for i in 0..10 {
            let mut s = stream(topics[i % topics.len()], "P");
            assert!(limiter.validate_raw_rpc_request(&mut s).await.is_ok());
            limiter.add_raw_stream(&s);
        }

        let mut s = stream(RPC_PING_TOPIC, "P");
        let err = limiter.validate_raw_rpc_request(&mut s).await.unwrap_err();
        assert!(matches!(err, NodeError::RateLimited));
        // The ping budget itself still has room.
        assert!(limiter.validate_request(&mut s, 1).await.is_ok());

        let mut other = stream(RPC_PING_TOPIC, "Q");
        assert!(limiter.validate_raw_rpc_request(&mut other).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_charges_are_all_recorded() {
        let (limiter, _) = test_limiter();

        let tasks = (0..10).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let s = stream(RPC_PING_TOPIC, "P");
                limiter.add_raw_stream(&s);
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        let remaining = limiter.topic_remaining(RPC_LIMITER_TOPIC, &PeerId::new("P")).unwrap();
        assert_eq!(remaining, 0);
        let mut s = stream(RPC_PING_TOPIC, "P");
        assert!(matches!(
            limiter.validate_raw_rpc_request(&mut s).await,
            Err(NodeError::RateLimited)
        ));
    }

    #[tokio::test]
    async fn test_failed_rejection_write_still_limits() {
        let (limiter, scorer) = test_limiter();
        let mut s = stream(RPC_GOODBYE_TOPIC, "P").failing_writes();
        limiter.add(&s, 1);

        let err = limiter.validate_request(&mut s, 1).await.unwrap_err();
        assert!(matches!(err, NodeError::RateLimited));
        assert_eq!(scorer.count(&PeerId::new("P")), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_topic() {
        let (limiter, scorer) = test_limiter();
        let mut s = MockStream::new("/tollgate/req/unknown/1/proto", "P");

        let err = limiter.validate_request(&mut s, 1).await.unwrap_err();
        assert!(matches!(err, NodeError::UnconfiguredTopic(_)));
        assert_eq!(scorer.count(&PeerId::new("P")), 0);
        assert!(s.written.is_empty());

        // Charging an unknown topic is only logged.
        limiter.add(&s, 1);
        assert_eq!(limiter.topic_count(), 7);
    }

    #[tokio::test]
    async fn test_free_releases_each_collector_once() {
        let (limiter, _) = test_limiter();
        let s = stream(RPC_BLOCKS_BY_RANGE_TOPIC, "P");
        limiter.add(&s, 1);

        assert_eq!(limiter.free(), 6);
        assert_eq!(limiter.topic_count(), 0);
        assert!(matches!(
            limiter.topic_remaining(&topic(RPC_BLOCKS_BY_RANGE_TOPIC), &PeerId::new("P")),
            Err(NodeError::UnconfiguredTopic(_))
        ));
        assert_eq!(limiter.free(), 0);
    }

    #[test]
    fn test_largest_burst_does_not_overflow() {
        let scorer = Arc::new(BadResponsesScorer::new(1));
        let limiter = Limiter::new(Arc::new(ProtoEncoding), scorer, crate::config::MAX_BURST_LIMIT);
        let peer = PeerId::new("peer");

        let bulk = limiter.topic_remaining(&topic(RPC_BLOCKS_BY_RANGE_TOPIC), &peer).unwrap();
        assert_eq!(bulk, crate::config::MAX_BURST_LIMIT * 20);
        assert!(limiter.topic_remaining(RPC_LIMITER_TOPIC, &peer).unwrap() > 0);
    }

    #[test]
    fn test_registry_frees_aliased_collector_once() {
        let mut registry = TopicRegistry::default();
        let mut shared = Collector::new(1.0, 10);
        shared.add("P", 3);
        shared.add("Q", 1);
        registry.register(&["/a".to_string(), "/b".to_string(), "/c".to_string()], shared);
        registry.register(&["/d".to_string()], Collector::new(1.0, 1));
        assert_eq!(registry.retrieve_collector("/b").unwrap().peer_count(), 2);

        let freed = registry.free();

        assert_eq!(freed.len(), 2);
        assert!(freed.iter().all(|c| c.is_freed() && c.peer_count() == 0));
        assert_eq!(freed[0].capacity(), 10);
        assert!(registry.topics.is_empty());
        assert!(registry.collectors.is_empty());
        assert!(matches!(
            registry.retrieve_collector("/a"),
            Err(NodeError::UnconfiguredTopic(_))
        ));
    }

    #[test]
    fn test_prune_keeps_drained_buckets() {
        let (limiter, _) = test_limiter();
        let s = stream(RPC_PING_TOPIC, "P");
        limiter.add(&s, DEFAULT_BURST_LIMIT);

        assert_eq!(limiter.prune(), 0);
        assert_eq!(limiter.topic_remaining(&topic(RPC_PING_TOPIC), &PeerId::new("P")).unwrap(), 0);
    }
}
