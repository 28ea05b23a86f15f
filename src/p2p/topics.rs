//! Request/response topic identifiers.

/// Goodbye message topic, sent before a peer disconnects.
pub const RPC_GOODBYE_TOPIC: &str = "/tollgate/req/goodbye/1";
/// Metadata exchange topic.
pub const RPC_METADATA_TOPIC: &str = "/tollgate/req/metadata/1";
/// Liveness ping topic.
pub const RPC_PING_TOPIC: &str = "/tollgate/req/ping/1";
/// Status exchange topic.
pub const RPC_STATUS_TOPIC: &str = "/tollgate/req/status/1";
/// Bulk request for a contiguous slot range.
pub const RPC_BLOCKS_BY_RANGE_TOPIC: &str = "/tollgate/req/blocks_by_range/1";
/// Bulk request for an explicit list of roots.
pub const RPC_BLOCKS_BY_ROOT_TOPIC: &str = "/tollgate/req/blocks_by_root/1";

/// Every request/response topic the node serves.
pub const RPC_TOPICS: [&str; 6] = [
    RPC_GOODBYE_TOPIC,
    RPC_METADATA_TOPIC,
    RPC_PING_TOPIC,
    RPC_STATUS_TOPIC,
    RPC_BLOCKS_BY_RANGE_TOPIC,
    RPC_BLOCKS_BY_ROOT_TOPIC,
];

/// Appends an encoding suffix to a base topic.
pub fn with_suffix(topic: &str, suffix: &str) -> String {
    format!("{}{}", topic, suffix)
}

/// Strips an encoding suffix and returns the base topic if it is a known one.
pub fn base_topic(protocol: &str, suffix: &str) -> Option<&'static str> {
    let base = protocol.strip_suffix(suffix)?;
    RPC_TOPICS.iter().copied().find(|t| *t == base)
}
