//! Stream abstraction and the TCP transport behind it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use super::encoding::Encoding;
use super::peer::PeerId;

/// Longest unsigned varint accepted as a frame length prefix.
const MAX_VARINT_LEN: usize = 10;

/// An inbound request/response stream.
///
/// The limiter needs only the protocol id and the remote peer; the
/// handlers additionally read frames and write responses.
#[async_trait]
pub trait RpcStream: Send {
    /// Protocol id of the stream, including the encoding suffix.
    fn protocol(&self) -> &str;

    /// Identity of the other end of the stream.
    fn remote_peer(&self) -> &PeerId;

    /// Read one length-prefixed frame body.
    async fn read_frame(&mut self) -> io::Result<Vec<u8>>;

    /// Write raw bytes to the stream.
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush and close the write side.
    async fn close(&mut self) -> io::Result<()>;
}

/// First frame on every connection, naming the protocol of the stream.
#[derive(Clone, PartialEq, Message)]
pub struct StreamHeader {
    #[prost(string, tag = "1")]
    pub protocol: String,
}

/// A stream carried by a single TCP connection.
///
/// The dialer opens with a framed [`StreamHeader`]. The peer identity is the
/// remote IP so that reconnecting from another port keeps the same budget.
pub struct TcpRpcStream {
    inner: TcpStream,
    protocol: String,
    peer: PeerId,
    addr: SocketAddr,
    max_frame_len: usize,
    io_timeout: Duration,
}

impl TcpRpcStream {
    /// Read the stream header from a freshly accepted connection.
    pub async fn accept(
        mut inner: TcpStream,
        encoding: Arc<dyn Encoding>,
        io_timeout: Duration,
    ) -> io::Result<Self> {
        let addr = inner.peer_addr()?;
        let max_frame_len = encoding.max_frame_len();

        let header = timeout(io_timeout, read_frame_from(&mut inner, max_frame_len))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "stream header timed out"))??;
        let header = StreamHeader::decode(header.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        trace!(addr = %addr, protocol = %header.protocol, "Accepted stream");

        Ok(Self {
            inner,
            protocol: header.protocol,
            peer: PeerId::from(addr.ip()),
            addr,
            max_frame_len,
            io_timeout,
        })
    }

    /// Socket address of the remote end.
    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl RpcStream for TcpRpcStream {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn remote_peer(&self) -> &PeerId {
        &self.peer
    }

    async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        timeout(self.io_timeout, read_frame_from(&mut self.inner, self.max_frame_len))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "frame read timed out"))?
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        timeout(self.io_timeout, self.inner.write_all(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Read one varint-length-prefixed frame body from `reader`.
pub(crate) async fn read_frame_from<R>(reader: &mut R, max_len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut prefix = Vec::with_capacity(MAX_VARINT_LEN);
    loop {
        let byte = reader.read_u8().await?;
        prefix.push(byte);
        if byte & 0x80 == 0 {
            break;
        }
        if prefix.len() == MAX_VARINT_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame length overflow"));
        }
    }

    let len = prost::decode_length_delimiter(prefix.as_slice())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, max_len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
