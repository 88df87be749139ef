//! TCP connection management with line-delimited I/O.
//!
//! Stratum v1 uses newline-delimited JSON over TCP. [`Connection`] frames
//! the read side with [`LineFramer`] and writes one encoded message plus a
//! newline per call. The [`Transport`] trait abstracts message I/O, allowing
//! channel-based mocks for deterministic testing.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::FramedRead;

use super::error::{StratumError, StratumResult};
use super::framer::LineFramer;
use super::messages::{Message, decode, encode};
use crate::tracing::prelude::*;

/// Message-level I/O for Stratum protocol.
///
/// Abstracts reading and writing messages so the client can run over TCP
/// (production) or channels (tests).
#[async_trait]
pub trait Transport: Send {
    /// Read one complete message.
    ///
    /// Returns `None` on clean connection close (EOF). An undecodable frame
    /// yields `Err(StratumError::Decode(_))`; the connection stays usable.
    async fn read_message(&mut self) -> StratumResult<Option<Message>>;

    /// Write a message.
    async fn write_message(&mut self, msg: &Message) -> StratumResult<()>;
}

/// Strip the `stratum+tcp://` or `tcp://` scheme from a pool URL, leaving
/// `host:port`.
pub fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("stratum+tcp://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
}

/// Open a TCP connection, giving up after `timeout`.
pub async fn connect_with_timeout(addr: &str, timeout: Duration) -> StratumResult<TcpStream> {
    let addr = strip_scheme(addr);
    debug!(addr = %addr, "Connecting");

    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(StratumError::ConnectionFailed(format!("{}: {}", addr, e))),
        Err(_) => Err(StratumError::ConnectionFailed(format!(
            "{}: timed out after {:?}",
            addr, timeout
        ))),
    }
}

/// Write one frame followed by a newline and flush.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Encode `msg` and write it as one frame.
pub(crate) async fn write_message<W>(writer: &mut W, msg: &Message) -> StratumResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg)?;
    trace!(tx = %String::from_utf8_lossy(&frame), "Sending message");
    write_frame(writer, &frame).await?;
    Ok(())
}

/// Buffered TCP connection for Stratum protocol.
pub struct Connection {
    reader: FramedRead<OwnedReadHalf, LineFramer>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    /// Create a new connection from a TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();

        Self {
            reader: FramedRead::new(read_half, LineFramer::new()),
            writer: BufWriter::new(write_half),
        }
    }

    /// Connect to a Stratum endpoint.
    ///
    /// Supports `stratum+tcp://`, plain `tcp://`, and bare `host:port`.
    pub async fn connect(url: &str, timeout: Duration) -> StratumResult<Self> {
        let stream = connect_with_timeout(url, timeout).await?;
        debug!("Connected");
        Ok(Self::new(stream))
    }

    /// Flush and shut down the write side.
    pub async fn close(mut self) -> StratumResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> StratumResult<Option<Message>> {
        let Some(frame) = self.reader.next().await else {
            return Ok(None);
        };
        let frame = frame?;
        trace!(rx = %String::from_utf8_lossy(&frame), "Received message");

        Ok(Some(decode(&frame)?))
    }

    async fn write_message(&mut self, msg: &Message) -> StratumResult<()> {
        write_message(&mut self.writer, msg).await
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// client's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
}

/// Test-side handle for a [`MockTransport`].
///
/// Use `send()` to feed messages to the client and `recv()` to read
/// messages the client wrote.
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: client_rx,
            tx: client_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<Message>> {
        Ok(self.rx.recv().await)
    }

    async fn write_message(&mut self, msg: &Message) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the client.
    pub fn send(&self, msg: Message) {
        self.tx.send(msg).expect("transport dropped");
    }

    /// Receive a message the client wrote.
    pub async fn recv(&mut self) -> Message {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Take a message the client already wrote, if any.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_message_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo messages back
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(socket);
            while let Ok(Some(msg)) = conn.read_message().await {
                conn.write_message(&msg).await.unwrap();
            }
        });

        let mut conn = Connection::connect(&format!("stratum+tcp://{}", addr), Duration::from_secs(5))
            .await
            .unwrap();

        let request = Message::request(1, "test.method", json!(["param1", "param2"]));
        conn.write_message(&request).await.unwrap();

        let response = conn.read_message().await.unwrap().unwrap();
        assert_eq!(response, request);
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"not json\n{\"id\":1,\"result\":true,\"error\":null}\n")
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = socket.read_to_end(&mut sink).await;
        });

        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(StratumError::Decode(_))
        ));
        let msg = conn.read_message().await.unwrap().unwrap();
        assert_eq!(msg, Message::response(Some(1), json!(true)));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_address() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StratumError::ConnectionFailed(_)));
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("stratum+tcp://pool:3333"), "pool:3333");
        assert_eq!(strip_scheme("tcp://pool:3333"), "pool:3333");
        assert_eq!(strip_scheme("pool:3333"), "pool:3333");
    }
}
