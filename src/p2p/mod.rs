//! Peer-to-peer transport primitives.
//!
//! Everything the rate limiter needs from the network lives here: peer
//! identities, topic identifiers, the frame encoding, the stream
//! abstraction and the bad-response scorer.

mod encoding;
mod peer;
mod scorers;
mod stream;
pub mod topics;

pub use encoding::{encode_message, Encoding, ProtoEncoding, MAX_FRAME_LEN};
pub use peer::PeerId;
pub use scorers::{BadResponsesScorer, PeerScorer};
pub use stream::{RpcStream, StreamHeader, TcpRpcStream};

#[cfg(test)]
pub(crate) use stream::testing;
