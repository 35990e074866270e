use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig};
use tokio::sync::mpsc;

use crate::fxtunnel::net;
use crate::fxtunnel::transport::{
    BoxedStream, Transport, TransportDialOptions, TransportListenOptions, TransportListener,
    TransportSession, default_alpn, tls,
};

/// Liveness timers for the outer connection: keepalive fires at the protocol
/// ping interval and the transport gives up once the session idle limit
/// passes with no traffic.
const QUIC_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const QUIC_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

fn transport_config() -> anyhow::Result<TransportConfig> {
    let mut cfg = TransportConfig::default();
    cfg.max_idle_timeout(Some(QUIC_IDLE_TIMEOUT.try_into()?));
    cfg.keep_alive_interval(Some(QUIC_KEEPALIVE_INTERVAL));
    Ok(cfg)
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let addr: SocketAddr = bind_addr.parse()?;

        let alpn = default_alpn(&opts.alpn);
        let (cert_chain, key) = tls::load_or_generate_cert(&opts.tls.cert_file, &opts.tls.key_file)?;

        let server_crypto = tls::server_crypto_config(cert_chain, key, alpn)?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_cfg.transport_config(Arc::new(transport_config()?));

        let endpoint = Endpoint::server(server_cfg, addr)?;
        Ok(Box::new(QuicTransportListener { endpoint }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let alpn = default_alpn(&opts.alpn);

        let client_crypto = tls::client_crypto_config(opts.tls.insecure_skip_verify, alpn)?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(transport_config()?));

        let bind: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let name = if opts.tls.server_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            opts.tls.server_name
        };

        let remote = resolve_socket_addr(addr).await?;
        let connecting = endpoint.connect(remote, &name)?;
        let conn = connecting.await?;
        Ok(Arc::new(QuicSession::new(conn)))
    }
}

async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("transport: could not resolve {addr:?}"))
}

pub struct QuicTransportListener {
    endpoint: Endpoint,
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let incoming = self.endpoint.accept();
        let connecting = incoming
            .await
            .ok_or_else(|| anyhow::anyhow!("transport: quic endpoint closed"))?;
        let conn = connecting.await?;
        Ok(Arc::new(QuicSession::new(conn)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.endpoint.close(0u32.into(), b"");
        Ok(())
    }
}

struct QuicSession {
    conn: Connection,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(quinn::SendStream, quinn::RecvStream)>>,
    task: tokio::task::JoinHandle<()>,
}

impl QuicSession {
    fn new(conn: Connection) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let c = conn.clone();
        let task = tokio::spawn(async move {
            loop {
                match c.accept_bi().await {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        Self {
            conn,
            incoming: tokio::sync::Mutex::new(rx),
            task,
        }
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.open_bi().await?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let (send, recv) = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("transport: session closed"))?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn close(&self) {
        self.task.abort();
        self.conn.close(0u32.into(), b"");
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }
}

pin_project! {
    struct QuicBiStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl tokio::io::AsyncRead for QuicBiStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.project().recv.poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicBiStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        use std::task::Poll;
        match self.project().send.poll_write(cx, data) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::task::Poll;
        match self.project().send.poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::task::Poll;
        match self.project().send.poll_shutdown(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}
