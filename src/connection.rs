//! Connection abstraction over heterogeneous duplex transports.
//!
//! A [`Connection`] is a raw byte duplex owned by exactly one
//! [`ProtocolEngine`](crate::engine::ProtocolEngine). Concrete realizations:
//!
//! - [`StreamConnection`] - a single bidirectional stream: TCP socket,
//!   TLS stream, `tokio::io::duplex` in tests (anything `AsyncRead +
//!   AsyncWrite` fits);
//! - [`PairConnection`] - two unidirectional halves treated as one logical
//!   duplex, e.g. a subprocess's stdin/stdout.
//!
//! WebSocket tunneling is not a connection type; it is the engine's
//! framing mode layered on top of either realization.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A duplex byte stream owned by one protocol engine.
pub trait Connection: Send + 'static {
    /// Consume the connection, yielding independent read and write halves.
    fn split(self: Box<Self>) -> (BoxedReader, BoxedWriter);

    /// Idle read timeout; `Duration::ZERO` means no timeout.
    fn timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// Whether the transport is still usable. A connection is consumed by
    /// [`split`](Self::split); after that, liveness is the engine's
    /// [`ProtocolState`](crate::engine::ProtocolState). Transports that can
    /// die before hand-off (a subprocess's pipes, say) override this.
    fn is_active(&self) -> bool {
        true
    }

    /// Human-readable label for logs.
    fn label(&self) -> &str;
}

/// A single bidirectional stream treated as a connection.
pub struct StreamConnection<S> {
    stream: S,
    label: String,
    timeout: Duration,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a stream.
    pub fn new(stream: S, label: impl Into<String>) -> Self {
        Self {
            stream,
            label: label.into(),
            timeout: Duration::ZERO,
        }
    }

    /// Set the idle read timeout (0 disables).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl StreamConnection<tokio::net::TcpStream> {
    /// Wrap a connected TCP socket, labeled with its peer address.
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let label = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp".to_string());
        Self::new(stream, label)
    }
}

impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn split(self: Box<Self>) -> (BoxedReader, BoxedWriter) {
        let (r, w) = tokio::io::split(self.stream);
        (Box::new(r), Box::new(w))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Two unidirectional streams treated as one logical duplex.
///
/// This is the subprocess-stdio shape: the callee reads commands on stdin
/// and writes events to stdout; the caller holds the matching child pipe
/// ends.
pub struct PairConnection {
    reader: BoxedReader,
    writer: BoxedWriter,
    label: String,
    timeout: Duration,
}

impl PairConnection {
    /// Combine a read half and a write half.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        label: impl Into<String>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            label: label.into(),
            timeout: Duration::ZERO,
        }
    }

    /// Set the idle read timeout (0 disables).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connection for PairConnection {
    fn split(self: Box<Self>) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stream_connection_roundtrip() {
        let (near, far) = tokio::io::duplex(256);
        let conn: Box<dyn Connection> = Box::new(StreamConnection::new(near, "test"));
        let (mut reader, mut writer) = conn.split();

        let (mut far_reader, mut far_writer) = tokio::io::split(far);
        writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far_reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far_writer.write_all(b"pong").await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_pair_connection_combines_halves() {
        let (near_a, far_a) = tokio::io::duplex(64);
        let (near_b, far_b) = tokio::io::duplex(64);
        let (read_half, _keep_a) = tokio::io::split(near_a);
        let (_keep_b, write_half) = tokio::io::split(near_b);

        let conn = PairConnection::new(read_half, write_half, "pair")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(conn.timeout(), Duration::from_secs(5));
        assert_eq!(conn.label(), "pair");

        let (mut reader, mut writer) = Box::new(conn).split();

        let (_, mut far_a_write) = tokio::io::split(far_a);
        far_a_write.write_all(b"in").await.unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"in");

        writer.write_all(b"out").await.unwrap();
        let (mut far_b_read, _) = tokio::io::split(far_b);
        let mut buf = [0u8; 3];
        far_b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"out");
    }

    #[test]
    fn test_default_timeout_is_zero() {
        let (near, _far) = tokio::io::duplex(8);
        let conn = StreamConnection::new(near, "x");
        assert_eq!(conn.timeout(), Duration::ZERO);
        assert_eq!(conn.label(), "x");
    }

    #[test]
    fn test_unsplit_connection_is_active() {
        let (near, _far) = tokio::io::duplex(8);
        let stream: Box<dyn Connection> = Box::new(StreamConnection::new(near, "s"));
        assert!(stream.is_active());

        let (a, _keep_a) = tokio::io::duplex(8);
        let (b, _keep_b) = tokio::io::duplex(8);
        let (read_half, _) = tokio::io::split(a);
        let (_, write_half) = tokio::io::split(b);
        let pair: Box<dyn Connection> = Box::new(PairConnection::new(read_half, write_half, "p"));
        assert!(pair.is_active());
    }
}
