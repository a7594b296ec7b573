// SuperNova Lightning Network - Peer Transports
//
// Ordered, reliable byte streams. Framing is done by the peer on top of
// whatever chunks a transport delivers.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Duplex byte stream to a counterparty.
///
/// `recv` must be cancel-safe: the peer loop races it against its command
/// queue.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Next chunk of received bytes.
    async fn recv(&mut self) -> Result<Bytes, TransportError>;
}

/// In-process transport backed by a pair of queues
#[derive(Debug)]
pub struct MemoryTransport {
    outgoing: mpsc::UnboundedSender<Bytes>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                outgoing: a_tx,
                incoming: b_rx,
            },
            MemoryTransport {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.outgoing.send(data).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Closed)
    }
}

/// Transport over any tokio byte stream, e.g. a `TcpStream`
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: vec![0u8; READ_CHUNK],
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait::async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.stream
            .write_all(&data)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        let n = self
            .stream
            .read(&mut self.buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }
}
