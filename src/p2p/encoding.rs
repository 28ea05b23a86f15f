//! Frame encoding for request/response streams.

use prost::Message;

/// Largest frame body a peer may send or receive.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Wire encoding negotiated for a stream.
///
/// The encoding contributes a suffix to every protocol id, so the same base
/// topic carried under two encodings is metered as two distinct topics.
pub trait Encoding: Send + Sync {
    /// Suffix appended to every base topic served with this encoding.
    fn protocol_suffix(&self) -> &'static str;

    /// Wraps an encoded body into a frame.
    fn frame(&self, body: &[u8]) -> Vec<u8>;

    /// Largest accepted frame body.
    fn max_frame_len(&self) -> usize {
        MAX_FRAME_LEN
    }
}

/// Protobuf bodies behind an unsigned-varint length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoEncoding;

impl Encoding for ProtoEncoding {
    fn protocol_suffix(&self) -> &'static str {
        "/proto"
    }

    fn frame(&self, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(body.len() + prost::length_delimiter_len(body.len()));
        prost::encoding::encode_varint(body.len() as u64, &mut buf);
        buf.extend_from_slice(body);
        buf
    }
}

/// Encodes a message and frames it with `encoding`.
pub fn encode_message<M: Message>(encoding: &dyn Encoding, message: &M) -> Vec<u8> {
    encoding.frame(&message.encode_to_vec())
}
