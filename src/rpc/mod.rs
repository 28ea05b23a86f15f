//! Request/response service and the node that serves it.

pub mod messages;
mod server;
mod service;

pub use server::Node;
pub use service::{BlockStore, RpcService, MAX_REQUEST_BLOCKS};
