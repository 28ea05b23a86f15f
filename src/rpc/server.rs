//! Node: accepts inbound streams and owns the limiter's lifetime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use super::service::RpcService;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::p2p::{BadResponsesScorer, Encoding, PeerId, ProtoEncoding, TcpRpcStream};
use crate::ratelimit::Limiter;

/// A running Tollgate node.
pub struct Node {
    config: NodeConfig,
    service: Arc<RpcService>,
    scorer: Arc<BadResponsesScorer>,
    encoding: Arc<dyn Encoding>,
}

impl Node {
    /// Wire the limiter, scorer and service for `config`.
    pub fn new(config: NodeConfig, node_id: String) -> Self {
        let encoding: Arc<dyn Encoding> = Arc::new(ProtoEncoding);
        let scorer = Arc::new(BadResponsesScorer::new(
            config.peer_scoring.bad_response_threshold,
        ));
        let limiter = Arc::new(Limiter::new(
            encoding.clone(),
            scorer.clone(),
            config.rate_limiting.default_burst_limit,
        ));
        let service = Arc::new(RpcService::new(limiter, encoding.clone(), node_id));

        Self {
            config,
            service,
            scorer,
            encoding,
        }
    }

    pub fn service(&self) -> &Arc<RpcService> {
        &self.service
    }

    pub fn scorer(&self) -> &Arc<BadResponsesScorer> {
        &self.scorer
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.config.network.listen_addr).await?;
        self.serve_listener(listener, signal).await
    }

    /// Serve streams from `listener` until `signal` resolves.
    ///
    /// On shutdown the node stops accepting, aborts in-flight streams and
    /// maintenance, and only then frees the limiter.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(addr = %listener.local_addr()?, "Accepting streams");

        let maintenance = self.spawn_maintenance();
        let mut incoming = TcpListenerStream::new(listener);
        let mut streams = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested, no longer accepting streams");
                    break;
                }
                conn = incoming.next() => match conn {
                    Some(Ok(tcp)) => self.spawn_stream(&mut streams, tcp),
                    Some(Err(e)) => warn!(error = %e, "Failed to accept connection"),
                    None => break,
                },
                Some(joined) = streams.join_next(), if !streams.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Stream task failed");
                    }
                }
            }
        }

        streams.shutdown().await;
        for task in maintenance {
            task.abort();
        }

        let freed = self.service.limiter().free();
        info!(freed, "Node stopped");
        Ok(())
    }

    fn spawn_stream(&self, streams: &mut JoinSet<()>, tcp: TcpStream) {
        let addr = match tcp.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(error = %e, "Dropping connection without peer address");
                return;
            }
        };
        let peer = PeerId::from(addr.ip());
        if self.scorer.is_bad_peer(&peer) {
            debug!(peer = %peer, "Refusing stream from bad peer");
            return;
        }

        let service = self.service.clone();
        let encoding = self.encoding.clone();
        let io_timeout = self.config.network.stream_timeout();
        streams.spawn(async move {
            let mut stream = match TcpRpcStream::accept(tcp, encoding, io_timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Failed to open stream");
                    return;
                }
            };
            if let Err(e) = service.handle_stream(&mut stream).await {
                debug!(addr = %stream.remote_addr(), error = %e, "Stream ended with error");
            }
        });
    }

    fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let prune_secs = self.config.rate_limiting.prune_interval_secs;
        if prune_secs > 0 {
            let limiter = self.service.limiter().clone();
            tasks.push(spawn_every(Duration::from_secs(prune_secs), move || {
                let pruned = limiter.prune();
                trace!(pruned, "Pruned rate limit buckets");
            }));
        }

        let decay_secs = self.config.peer_scoring.decay_interval_secs;
        if decay_secs > 0 {
            let scorer = self.scorer.clone();
            tasks.push(spawn_every(Duration::from_secs(decay_secs), move || {
                scorer.decay();
                trace!(tracked = scorer.tracked_peers(), "Decayed peer scores");
            }));
        }

        tasks
    }
}

/// Run `f` every `period`, starting one period from now.
fn spawn_every<F>(period: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            f();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::topics::{with_suffix, RPC_PING_TOPIC};
    use crate::p2p::{encode_message, PeerScorer, StreamHeader};
    use crate::ratelimit::RESPONSE_CODE_SUCCESS;
    use crate::rpc::messages::Ping;
    use prost::Message;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    async fn start(node: Node) -> (std::net::SocketAddr, oneshot::Sender<()>, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(node.serve_listener(listener, async {
            let _ = rx.await;
        }));
        (addr, tx, handle)
    }

    async fn ping(addr: std::net::SocketAddr) -> Vec<u8> {
        let mut tcp = TcpStream::connect(addr).await.unwrap();
        let header = StreamHeader {
            protocol: with_suffix(RPC_PING_TOPIC, "/proto"),
        };
        // A refused connection may already be reset by the time we write.
        let _ = tcp.write_all(&encode_message(&ProtoEncoding, &header)).await;
        let _ = tcp
            .write_all(&encode_message(&ProtoEncoding, &Ping { seq_number: 1 }))
            .await;

        let mut resp = Vec::new();
        let _ = tcp.read_to_end(&mut resp).await;
        resp
    }

    #[tokio::test]
    async fn test_ping_over_tcp() {
        let node = Node::new(NodeConfig::default(), "node-1".to_string());
        let service = node.service().clone();
        let (addr, shutdown, handle) = start(node).await;

        let resp = ping(addr).await;
        assert_eq!(resp[0], RESPONSE_CODE_SUCCESS);
        let msg = Ping::decode_length_delimited(&resp[1..]).unwrap();
        assert_eq!(msg.seq_number, 0);

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(service.limiter().topic_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_peer_refused() {
        let node = Node::new(NodeConfig::default(), "node-1".to_string());
        let local = PeerId::new("127.0.0.1");
        for _ in 0..node.scorer().threshold() {
            node.scorer().increment(&local);
        }
        let (addr, shutdown, handle) = start(node).await;

        let resp = ping(addr).await;
        assert!(resp.is_empty());

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
