//! Request/response service.
//!
//! Every inbound stream is admitted through the general rate limit topic,
//! then metered against its own topic before the handler runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message;
use tracing::{debug, instrument, trace};

use super::messages::{
    Block, BlocksByRangeRequest, BlocksByRootRequest, Goodbye, MetaData, Ping, Status,
};
use crate::error::{NodeError, Result};
use crate::p2p::topics::{
    base_topic, RPC_BLOCKS_BY_RANGE_TOPIC, RPC_BLOCKS_BY_ROOT_TOPIC, RPC_GOODBYE_TOPIC,
    RPC_METADATA_TOPIC, RPC_PING_TOPIC, RPC_STATUS_TOPIC,
};
use crate::p2p::{encode_message, Encoding, RpcStream};
use crate::ratelimit::{
    write_error_response_to_stream, Limiter, RESPONSE_CODE_INVALID_REQUEST,
    RESPONSE_CODE_SERVER_ERROR, RESPONSE_CODE_SUCCESS,
};

/// Most blocks a single bulk request may ask for.
pub const MAX_REQUEST_BLOCKS: u64 = 1024;

/// In-memory blocks indexed by slot and by root.
#[derive(Debug, Default)]
pub struct BlockStore {
    by_slot: BTreeMap<u64, Block>,
    by_root: HashMap<Vec<u8>, u64>,
}

impl BlockStore {
    pub fn insert(&mut self, block: Block) {
        if let Some(old) = self.by_slot.get(&block.slot) {
            self.by_root.remove(&old.root);
        }
        self.by_root.insert(block.root.clone(), block.slot);
        self.by_slot.insert(block.slot, block);
    }

    /// Blocks at `start_slot + i * step` for `i < count`, skipping empty slots.
    pub fn range(&self, start_slot: u64, count: u64, step: u64) -> Vec<Block> {
        let end = start_slot.saturating_add(count.saturating_mul(step));
        self.by_slot
            .range(start_slot..end)
            .filter(|(slot, _)| (*slot - start_slot) % step == 0)
            .map(|(_, block)| block.clone())
            .collect()
    }

    pub fn get_by_root(&self, root: &[u8]) -> Option<&Block> {
        self.by_root.get(root).and_then(|slot| self.by_slot.get(slot))
    }

    pub fn head(&self) -> Option<&Block> {
        self.by_slot.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.by_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }
}

/// Serves request/response streams behind the rate limiter.
pub struct RpcService {
    limiter: Arc<Limiter>,
    encoding: Arc<dyn Encoding>,
    metadata: RwLock<MetaData>,
    blocks: RwLock<BlockStore>,
}

impl RpcService {
    pub fn new(limiter: Arc<Limiter>, encoding: Arc<dyn Encoding>, node_id: String) -> Self {
        Self {
            limiter,
            encoding,
            metadata: RwLock::new(MetaData {
                seq_number: 0,
                node_id,
            }),
            blocks: RwLock::new(BlockStore::default()),
        }
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    /// Add a block to the store, bumping the metadata sequence number.
    pub fn insert_block(&self, block: Block) {
        self.blocks.write().insert(block);
        self.metadata.write().seq_number += 1;
    }

    pub fn metadata(&self) -> MetaData {
        self.metadata.read().clone()
    }

    /// Local status derived from the highest stored block.
    pub fn status(&self) -> Status {
        let blocks = self.blocks.read();
        match blocks.head() {
            Some(head) => Status {
                head_slot: head.slot,
                head_root: head.root.clone(),
            },
            None => Status::default(),
        }
    }

    /// Run one inbound stream to completion.
    ///
    /// Rejections have already been reported to the peer when this returns
    /// an error; the error is for local logging only.
    #[instrument(skip_all, fields(topic = %stream.protocol(), peer = %stream.remote_peer()))]
    pub async fn handle_stream<S>(&self, stream: &mut S) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let result = self.admit_and_dispatch(stream).await;

        if let Err(err) = &result {
            let response = match err {
                NodeError::Decode(_)
                | NodeError::InvalidRequest(_)
                | NodeError::UnsupportedProtocol(_) => {
                    Some((RESPONSE_CODE_INVALID_REQUEST, err.to_string()))
                }
                NodeError::UnconfiguredTopic(_) => {
                    Some((RESPONSE_CODE_SERVER_ERROR, "internal error".to_string()))
                }
                _ => None,
            };
            if let Some((code, reason)) = response {
                write_error_response_to_stream(code, &reason, stream, self.encoding.as_ref())
                    .await;
            }
        }

        if let Err(e) = stream.close().await {
            trace!(error = %e, "Could not close stream");
        }
        result
    }

    async fn admit_and_dispatch<S>(&self, stream: &mut S) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        self.limiter.validate_raw_rpc_request(stream).await?;
        self.limiter.add_raw_stream(stream);

        match base_topic(stream.protocol(), self.encoding.protocol_suffix()) {
            Some(topic) => self.dispatch(topic, stream).await,
            None => Err(NodeError::UnsupportedProtocol(stream.protocol().to_string())),
        }
    }

    async fn dispatch<S>(&self, topic: &'static str, stream: &mut S) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let payload = stream.read_frame().await?;
        match topic {
            RPC_GOODBYE_TOPIC => self.goodbye_handler(stream, &payload).await,
            RPC_PING_TOPIC => self.ping_handler(stream, &payload).await,
            RPC_METADATA_TOPIC => self.metadata_handler(stream).await,
            RPC_STATUS_TOPIC => self.status_handler(stream, &payload).await,
            RPC_BLOCKS_BY_RANGE_TOPIC => self.blocks_by_range_handler(stream, &payload).await,
            RPC_BLOCKS_BY_ROOT_TOPIC => self.blocks_by_root_handler(stream, &payload).await,
            other => Err(NodeError::UnsupportedProtocol(other.to_string())),
        }
    }

    async fn goodbye_handler<S>(&self, stream: &mut S, payload: &[u8]) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let msg = Goodbye::decode(payload)?;
        self.limiter.validate_request(stream, 1).await?;

        debug!(reason = msg.reason, "Peer said goodbye");
        self.limiter.add(stream, 1);
        Ok(())
    }

    async fn ping_handler<S>(&self, stream: &mut S, payload: &[u8]) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let msg = Ping::decode(payload)?;
        self.limiter.validate_request(stream, 1).await?;

        let resp = Ping {
            seq_number: self.metadata.read().seq_number,
        };
        trace!(peer_seq = msg.seq_number, seq = resp.seq_number, "Ping");
        self.write_chunk(stream, &resp).await?;
        self.limiter.add(stream, 1);
        Ok(())
    }

    async fn metadata_handler<S>(&self, stream: &mut S) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        self.limiter.validate_request(stream, 1).await?;

        let resp = self.metadata();
        self.write_chunk(stream, &resp).await?;
        self.limiter.add(stream, 1);
        Ok(())
    }

    async fn status_handler<S>(&self, stream: &mut S, payload: &[u8]) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let msg = Status::decode(payload)?;
        self.limiter.validate_request(stream, 1).await?;

        debug!(peer_head = msg.head_slot, "Received peer status");
        let resp = self.status();
        self.write_chunk(stream, &resp).await?;
        self.limiter.add(stream, 1);
        Ok(())
    }

    async fn blocks_by_range_handler<S>(&self, stream: &mut S, payload: &[u8]) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let req = BlocksByRangeRequest::decode(payload)?;
        if req.count == 0 || req.count > MAX_REQUEST_BLOCKS {
            return Err(NodeError::InvalidRequest(format!(
                "count must be between 1 and {}",
                MAX_REQUEST_BLOCKS
            )));
        }
        if req.step == 0 {
            return Err(NodeError::InvalidRequest("step must be at least 1".to_string()));
        }
        self.limiter.validate_request(stream, req.count).await?;

        let blocks = self.blocks.read().range(req.start_slot, req.count, req.step);
        self.send_blocks(stream, &blocks).await
    }

    async fn blocks_by_root_handler<S>(&self, stream: &mut S, payload: &[u8]) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        let req = BlocksByRootRequest::decode(payload)?;
        let count = req.roots.len() as u64;
        if count == 0 || count > MAX_REQUEST_BLOCKS {
            return Err(NodeError::InvalidRequest(format!(
                "root count must be between 1 and {}",
                MAX_REQUEST_BLOCKS
            )));
        }
        self.limiter.validate_request(stream, count).await?;

        let blocks: Vec<Block> = {
            let store = self.blocks.read();
            req.roots
                .iter()
                .filter_map(|root| store.get_by_root(root).cloned())
                .collect()
        };
        self.send_blocks(stream, &blocks).await
    }

    /// Write each block as a response chunk and charge what was served.
    async fn send_blocks<S>(&self, stream: &mut S, blocks: &[Block]) -> Result<()>
    where
        S: RpcStream + ?Sized,
    {
        for block in blocks {
            self.write_chunk(stream, block).await?;
        }
        debug!(served = blocks.len(), "Served blocks");
        self.limiter.add(stream, (blocks.len() as i64).max(1));
        Ok(())
    }

    async fn write_chunk<S, M>(&self, stream: &mut S, msg: &M) -> Result<()>
    where
        S: RpcStream + ?Sized,
        M: Message,
    {
        let mut chunk = vec![RESPONSE_CODE_SUCCESS];
        chunk.extend(encode_message(self.encoding.as_ref(), msg));
        stream.write_all(&chunk).await?;
        Ok(())
    }
}
