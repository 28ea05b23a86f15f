//! Request/response wire messages.

use prost::Message;

/// Goodbye reason: the client is shutting down.
pub const GOODBYE_CLIENT_SHUTDOWN: u64 = 1;

#[derive(Clone, PartialEq, Message)]
pub struct Goodbye {
    #[prost(uint64, tag = "1")]
    pub reason: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub seq_number: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct MetaData {
    #[prost(uint64, tag = "1")]
    pub seq_number: u64,
    #[prost(string, tag = "2")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Status {
    #[prost(uint64, tag = "1")]
    pub head_slot: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub head_root: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlocksByRangeRequest {
    #[prost(uint64, tag = "1")]
    pub start_slot: u64,
    #[prost(uint64, tag = "2")]
    pub count: u64,
    #[prost(uint64, tag = "3")]
    pub step: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlocksByRootRequest {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub roots: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Block {
    #[prost(uint64, tag = "1")]
    pub slot: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub root: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}
