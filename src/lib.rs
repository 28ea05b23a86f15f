//! Tollgate - admission control for request/response p2p streams
//!
//! Every inbound stream passes a general anti-flood gate and then a
//! per-topic, per-peer leaky bucket before its payload is handled. Peers
//! that exceed a budget are penalised and receive an error response on
//! the stream.

pub mod config;
pub mod error;
pub mod p2p;
pub mod ratelimit;
pub mod rpc;
