use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Default)]
pub struct TlsListenOptions {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TlsDialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub tls: TlsListenOptions,
    pub alpn: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub tls: TlsDialOptions,
    pub alpn: Vec<Vec<u8>>,
}

/// Outer-connection factory. Two interchangeable backends exist: a yamux
/// multiplexer over TLS-wrapped TCP, and QUIC where one connection is one
/// session with native streams. Higher layers must not assume either.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    #[allow(dead_code)]
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// One client↔server session carrying N multiplexed streams.
///
/// Streams are FIFO per-stream, unordered across streams, reliable, and
/// support half-close. Closing the session cancels all of its streams:
/// in-progress reads and writes return a terminal error.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "quic" => Ok(n),
        _ => anyhow::bail!("transport: unknown transport {name:?} (expected tcp|quic)"),
    }
}

pub fn default_alpn(next: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if !next.is_empty() {
        return next.to_vec();
    }
    vec![b"fxtunnel/1".to_vec()]
}

pub mod quic;
pub mod tcp;
pub mod tls;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpMuxTransport::new())),
        "quic" => Ok(Arc::new(quic::QuicTransport::new())),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_transport;

    #[test]
    fn parse_transport_normalizes() {
        assert_eq!(parse_transport(" TCP ").unwrap(), "tcp");
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport("quic").unwrap(), "quic");
        assert!(parse_transport("kcp").is_err());
    }
}
