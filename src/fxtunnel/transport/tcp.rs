use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::fxtunnel::net;
use crate::fxtunnel::transport::{
    BoxedStream, Transport, TransportDialOptions, TransportListenOptions, TransportListener,
    TransportSession, default_alpn, tls,
};

/// Per-stream receive window for the yamux multiplexer.
const STREAM_WINDOW_BYTES: u32 = 4 * 1024 * 1024;

fn mux_config() -> tokio_yamux::Config {
    tokio_yamux::Config {
        max_stream_window_size: STREAM_WINDOW_BYTES,
        ..tokio_yamux::Config::default()
    }
}

/// Classic multiplexer backend: one TLS-wrapped TCP connection per session,
/// yamux streams inside.
pub struct TcpMuxTransport;

impl TcpMuxTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpMuxTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref()).await?;

        let alpn = default_alpn(&opts.alpn);
        let (certs, key) = tls::load_or_generate_cert(&opts.tls.cert_file, &opts.tls.key_file)?;
        let server_cfg = tls::server_crypto_config(certs, key, alpn)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_cfg));

        Ok(Box::new(TcpMuxListener { ln, acceptor }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let alpn = default_alpn(&opts.alpn);
        let client_cfg = tls::client_crypto_config(opts.tls.insecure_skip_verify, alpn)?;
        let connector = TlsConnector::from(Arc::new(client_cfg));

        let c = TcpStream::connect(addr).await?;
        let remote = c.peer_addr().ok();

        let name = if opts.tls.server_name.trim().is_empty() {
            host_of(addr)
        } else {
            opts.tls.server_name.trim().to_string()
        };
        let server_name = rustls::pki_types::ServerName::try_from(name)?;
        let c = connector.connect(server_name, c).await?;

        let session = tokio_yamux::Session::new_client(c, mux_config());
        Ok(Arc::new(YamuxSession::from_session(session, remote)))
    }
}

fn host_of(addr: &str) -> String {
    let addr = addr.trim();
    match addr.rsplit_once(':') {
        Some((host, _port)) if !host.is_empty() => host.trim_matches(['[', ']']).to_string(),
        _ => addr.to_string(),
    }
}

pub struct TcpMuxListener {
    ln: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl TransportListener for TcpMuxListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (c, remote) = self.ln.accept().await?;
        let c = self.acceptor.accept(c).await?;
        let session = tokio_yamux::Session::new_server(c, mux_config());
        Ok(Arc::new(YamuxSession::from_session(session, Some(remote))))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // TcpListener has no async close; drop closes.
        Ok(())
    }
}

struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    closed: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    fn from_session<S>(mut session: tokio_yamux::Session<S>, remote: Option<SocketAddr>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let control = session.control();
        let closed = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let closed2 = closed.clone();
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            closed2.store(true, Ordering::Release);
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            remote,
            closed,
            task,
        }
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("transport: session closed"))?;
        Ok(Box::new(st))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.task.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::host_of;

    #[test]
    fn host_of_strips_port_and_brackets() {
        assert_eq!(host_of("tunnel.example.com:4443"), "tunnel.example.com");
        assert_eq!(host_of("[::1]:4443"), "::1");
        assert_eq!(host_of("plainhost"), "plainhost");
    }
}
