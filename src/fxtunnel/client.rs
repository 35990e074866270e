use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};

use crate::fxtunnel::{
    datagram,
    protocol::{self, ControlMessage, ProtocolError, TunnelKind},
    telemetry,
    transport::{BoxedStream, TlsDialOptions, TransportDialOptions, transport_by_name},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Sessions that lived at least this long earn one immediate reconnect.
const STABLE_SESSION: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Winner of the v4/v6 origin race is remembered this long.
const ORIGIN_CACHE_TTL: Duration = Duration::from_secs(300);

/// Errors that must not be retried by the reconnect loop.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("server requires client version >= {0}; self-update needed")]
    UpgradeRequired(String),
}

#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub kind: TunnelKind,
    pub name: String,
    pub subdomain: Option<String>,
    pub host_aliases: Vec<String>,
    pub local_port: u16,
    pub desired_public_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub transport: String,
    pub token: String,
    pub version: String,
    pub tunnels: Vec<TunnelSpec>,
    pub dial_timeout: Duration,
    pub tls: TlsDialOptions,
}

pub struct Client {
    opts: ClientOptions,
    origin_cache: Arc<OriginCache>,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("client: server address is required");
        }
        if opts.tunnels.is_empty() {
            anyhow::bail!("client: at least one tunnel is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        Ok(Self {
            opts,
            origin_cache: Arc::new(OriginCache::default()),
        })
    }

    /// Reconnect loop: exponential backoff with full jitter from 1 s to 30 s;
    /// a session that lived at least a minute earns one immediate retry.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut backoff = BACKOFF_MIN;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let started = Instant::now();
            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if err.downcast_ref::<ClientError>().is_some() {
                        return Err(err);
                    }
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        transport = %self.opts.transport,
                        err = %err,
                        "client: disconnected"
                    );
                }
            }

            if started.elapsed() >= STABLE_SESSION {
                backoff = BACKOFF_MIN;
                tracing::info!("client: prior session was stable; reconnecting now");
                continue;
            }

            let jitter_ms = rand::rng().random_range(0..=backoff.as_millis() as u64);
            let sleep = Duration::from_millis(jitter_ms);
            tracing::info!(backoff = %humantime::format_duration(sleep), "client: retrying");

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(sleep) => {}
            }

            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn run_once(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let tr = transport_by_name(&self.opts.transport)?;

        let dial = tr.dial(
            &self.opts.server_addr,
            TransportDialOptions {
                tls: self.opts.tls.clone(),
                alpn: vec![],
            },
        );
        let sess = tokio::time::timeout(self.opts.dial_timeout, dial).await??;

        // The first stream we open is the control channel.
        let control = sess.open_stream().await?;
        let (mut rd, wr) = tokio::io::split(control);
        let writer = ControlWriter::new(wr);

        writer
            .send(&ControlMessage::Hello {
                v: self.opts.version.clone(),
                caps: vec!["tunnels".into()],
                client_id: None,
            })
            .await?;

        let ack =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, protocol::read_message(&mut rd)).await??;
        let ControlMessage::HelloAck { v: server_v, min_v, .. } = ack else {
            sess.close().await;
            anyhow::bail!("client: expected hello_ack");
        };
        if protocol::version_lt(&self.opts.version, &min_v) {
            sess.close().await;
            return Err(ClientError::UpgradeRequired(min_v).into());
        }

        writer
            .send(&ControlMessage::Auth {
                token: self.opts.token.clone(),
            })
            .await?;

        let auth =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, protocol::read_message(&mut rd)).await??;
        let ControlMessage::AuthResult { ok, user_id, reason, .. } = auth else {
            sess.close().await;
            anyhow::bail!("client: expected auth_result");
        };
        if !ok {
            sess.close().await;
            return Err(ClientError::AuthRejected(
                reason.unwrap_or_else(|| protocol::CLOSE_UNAUTHENTICATED.into()),
            )
            .into());
        }

        tracing::info!(
            server = %self.opts.server_addr,
            server_version = %server_v,
            user = %user_id.unwrap_or_default(),
            transport = %tr.name(),
            "client: connected"
        );

        // Tunnel configs are re-sent on every fresh session.
        let mut pending: HashMap<String, TunnelSpec> = HashMap::new();
        for spec in &self.opts.tunnels {
            let req_id = uuid::Uuid::new_v4().to_string();
            writer
                .send(&ControlMessage::TunnelRequest {
                    req_id: req_id.clone(),
                    kind: spec.kind,
                    name: spec.name.clone(),
                    subdomain: spec.subdomain.clone(),
                    host_aliases: spec.host_aliases.clone(),
                    local_port: spec.local_port,
                    desired_public_port: spec.desired_public_port,
                })
                .await?;
            pending.insert(req_id, spec.clone());
        }

        let active: Arc<RwLock<HashMap<String, TunnelSpec>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let inflight = Arc::new(AtomicUsize::new(0));

        // Server-opened data streams.
        let acceptor = {
            let sess = sess.clone();
            let active = active.clone();
            let inflight = inflight.clone();
            let origin_cache = self.origin_cache.clone();
            tokio::spawn(async move {
                loop {
                    let st = match sess.accept_stream().await {
                        Ok(st) => st,
                        Err(_) => break,
                    };
                    let active = active.clone();
                    let inflight = inflight.clone();
                    let origin_cache = origin_cache.clone();
                    tokio::spawn(async move {
                        let _guard = InflightGuard::new(inflight);
                        if let Err(err) = handle_stream(active, origin_cache, st).await {
                            tracing::debug!(err = %err, "client: stream ended");
                        }
                    });
                }
            })
        };

        let res = self
            .control_loop(&writer, rd, &mut shutdown, &mut pending, &active)
            .await;

        match res {
            ControlOutcome::Shutdown => {
                // Graceful: no new streams, drain in-flight, then force-close.
                let _ = writer.send(&ControlMessage::Goodbye { reason: None }).await;
                acceptor.abort();
                let deadline = Instant::now() + DRAIN_TIMEOUT;
                while inflight.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                sess.close().await;
                Ok(())
            }
            ControlOutcome::Reconnect(err) => {
                acceptor.abort();
                sess.close().await;
                Err(err)
            }
            ControlOutcome::Fatal(err) => {
                acceptor.abort();
                sess.close().await;
                Err(err)
            }
        }
    }

    async fn control_loop(
        &self,
        writer: &ControlWriter,
        mut rd: ReadHalf<BoxedStream>,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
        pending: &mut HashMap<String, TunnelSpec>,
        active: &Arc<RwLock<HashMap<String, TunnelSpec>>>,
    ) -> ControlOutcome {
        let (msg_tx, mut msg_rx) = mpsc::channel::<Result<ControlMessage, ProtocolError>>(16);
        let reader = tokio::spawn(async move {
            loop {
                match protocol::read_message(&mut rd).await {
                    Ok(m) => {
                        if msg_tx.send(Ok(m)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = msg_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let last_recv = AtomicU64::new(telemetry::now_unix_ms());
        let mut last_ping_sent = telemetry::now_unix_ms();
        let mut tick = tokio::time::interval(Duration::from_secs(2));

        let out = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break ControlOutcome::Shutdown;
                    }
                }
                _ = tick.tick() => {
                    let now = telemetry::now_unix_ms();
                    let idle_for = now.saturating_sub(last_recv.load(Ordering::Relaxed));
                    if idle_for >= IDLE_TIMEOUT.as_millis() as u64 {
                        break ControlOutcome::Reconnect(anyhow::anyhow!("client: session idle"));
                    }
                    if idle_for >= KEEPALIVE_INTERVAL.as_millis() as u64
                        && now.saturating_sub(last_ping_sent) >= KEEPALIVE_INTERVAL.as_millis() as u64
                    {
                        last_ping_sent = now;
                        if writer.send(&ControlMessage::Ping { ts: protocol::rfc3339_now() }).await.is_err() {
                            break ControlOutcome::Reconnect(anyhow::anyhow!("client: control write failed"));
                        }
                    }
                }
                msg = msg_rx.recv() => {
                    let msg = match msg {
                        None => break ControlOutcome::Reconnect(anyhow::anyhow!("client: control channel closed")),
                        Some(Err(e)) => break ControlOutcome::Reconnect(e.into()),
                        Some(Ok(m)) => m,
                    };
                    last_recv.store(telemetry::now_unix_ms(), Ordering::Relaxed);

                    match msg {
                        ControlMessage::Ping { ts } => {
                            if writer.send(&ControlMessage::Pong { ts }).await.is_err() {
                                break ControlOutcome::Reconnect(anyhow::anyhow!("client: control write failed"));
                            }
                        }
                        ControlMessage::Pong { .. } => {}
                        ControlMessage::TunnelAccept { req_id, id, public_url, public_port } => {
                            if let Some(spec) = pending.remove(&req_id) {
                                match (&public_url, public_port) {
                                    (Some(url), _) => tracing::info!(tunnel = %id, name = %spec.name, url = %url, "client: tunnel up"),
                                    (None, Some(port)) => tracing::info!(tunnel = %id, name = %spec.name, public_port = port, "client: tunnel up"),
                                    (None, None) => tracing::info!(tunnel = %id, name = %spec.name, "client: tunnel up"),
                                }
                                active.write().await.insert(id, spec);
                            }
                        }
                        ControlMessage::TunnelReject { req_id, code, message } => {
                            // Echoed verbatim for the operator.
                            let name = pending.remove(&req_id).map(|s| s.name).unwrap_or_default();
                            tracing::error!(name = %name, code = %code, message = %message, "client: tunnel rejected");
                        }
                        ControlMessage::TunnelClose { id, reason } => {
                            active.write().await.remove(&id);
                            tracing::info!(tunnel = %id, reason = ?reason, "client: tunnel closed by server");
                        }
                        ControlMessage::Goodbye { reason } => {
                            let reason = reason.unwrap_or_default();
                            if reason == protocol::CLOSE_UPGRADE_REQUIRED {
                                break ControlOutcome::Fatal(ClientError::UpgradeRequired("server minimum".into()).into());
                            }
                            break ControlOutcome::Reconnect(anyhow::anyhow!("client: server said goodbye: {reason}"));
                        }
                        other => {
                            tracing::debug!(?other, "client: ignoring unexpected control message");
                        }
                    }
                }
            }
        };

        reader.abort();
        out
    }
}

enum ControlOutcome {
    Shutdown,
    Reconnect(anyhow::Error),
    Fatal(anyhow::Error),
}

#[derive(Clone)]
struct ControlWriter {
    wr: Arc<tokio::sync::Mutex<WriteHalf<BoxedStream>>>,
}

impl ControlWriter {
    fn new(wr: WriteHalf<BoxedStream>) -> Self {
        Self {
            wr: Arc::new(tokio::sync::Mutex::new(wr)),
        }
    }

    async fn send(&self, msg: &ControlMessage) -> Result<(), ProtocolError> {
        let mut wr = self.wr.lock().await;
        protocol::write_message(&mut *wr, msg).await
    }
}

struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl InflightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn handle_stream(
    active: Arc<RwLock<HashMap<String, TunnelSpec>>>,
    origin_cache: Arc<OriginCache>,
    mut st: BoxedStream,
) -> anyhow::Result<()> {
    let hdr = protocol::read_stream_header(&mut st).await?;

    let spec = active.read().await.get(&hdr.tunnel_id).cloned();
    let Some(spec) = spec else {
        tracing::warn!(tunnel = %hdr.tunnel_id, "client: stream for unknown tunnel");
        let _ = st.shutdown().await;
        return Ok(());
    };

    match spec.kind {
        TunnelKind::Http | TunnelKind::Tcp => {
            let mut origin = match origin_cache.dial(spec.local_port).await {
                Ok(o) => o,
                Err(err) => {
                    tracing::warn!(
                        tunnel = %hdr.tunnel_id,
                        port = spec.local_port,
                        code = protocol::CLOSE_ORIGIN_UNREACHABLE,
                        err = %err,
                        "client: origin dial failed"
                    );
                    let _ = st.shutdown().await;
                    return Ok(());
                }
            };

            let _ = tokio::io::copy_bidirectional(&mut st, &mut origin).await;
            let _ = origin.shutdown().await;
            let _ = st.shutdown().await;
        }
        TunnelKind::Udp => {
            pump_udp(spec.local_port, st).await?;
        }
    }
    Ok(())
}

/// Bridge framed datagrams on the stream to a local UDP socket.
async fn pump_udp(local_port: u16, st: BoxedStream) -> anyhow::Result<()> {
    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    sock.connect(("127.0.0.1", local_port)).await?;
    let sock = Arc::new(sock);

    let (mut rd, mut wr) = tokio::io::split(st);

    let sock_out = sock.clone();
    let to_origin = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match datagram::read_frame_into(&mut rd, &mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if sock_out.send(&buf[..n]).await.is_err() {
                break;
            }
        }
    });

    let from_origin = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match sock.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if n > datagram::MAX_DATAGRAM_BYTES {
                continue;
            }
            if datagram::write_frame(&mut wr, &buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let _ = tokio::join!(to_origin, from_origin);
    Ok(())
}

/// Local origin dialing with a v4/v6 race and a per-port winner cache.
#[derive(Default)]
struct OriginCache {
    winners: tokio::sync::Mutex<HashMap<u16, (SocketAddr, Instant)>>,
}

impl OriginCache {
    async fn dial(&self, port: u16) -> std::io::Result<TcpStream> {
        if let Some(addr) = self.cached(port).await {
            match TcpStream::connect(addr).await {
                Ok(s) => return Ok(s),
                Err(_) => self.forget(port).await,
            }
        }

        let (stream, winner) = race_dial(port).await?;
        self.remember(port, winner).await;
        Ok(stream)
    }

    async fn cached(&self, port: u16) -> Option<SocketAddr> {
        let winners = self.winners.lock().await;
        let (addr, at) = winners.get(&port)?;
        (at.elapsed() < ORIGIN_CACHE_TTL).then_some(*addr)
    }

    async fn remember(&self, port: u16, addr: SocketAddr) {
        self.winners.lock().await.insert(port, (addr, Instant::now()));
    }

    async fn forget(&self, port: u16) {
        self.winners.lock().await.remove(&port);
    }
}

/// Race IPv4 and IPv6 loopback in parallel; first successful connect wins and
/// the loser is cancelled.
async fn race_dial(port: u16) -> std::io::Result<(TcpStream, SocketAddr)> {
    let a4: SocketAddr = (Ipv4Addr::LOCALHOST, port).into();
    let a6: SocketAddr = (Ipv6Addr::LOCALHOST, port).into();

    let v4 = TcpStream::connect(a4);
    let v6 = TcpStream::connect(a6);
    tokio::pin!(v4, v6);

    let mut v4_err: Option<std::io::Error> = None;
    let mut v6_err: Option<std::io::Error> = None;

    loop {
        tokio::select! {
            r = &mut v4, if v4_err.is_none() => match r {
                Ok(s) => return Ok((s, a4)),
                Err(e) => {
                    v4_err = Some(e);
                    if let Some(e6) = v6_err.take() {
                        return Err(e6);
                    }
                }
            },
            r = &mut v6, if v6_err.is_none() => match r {
                Ok(s) => return Ok((s, a6)),
                Err(e) => {
                    v6_err = Some(e);
                    if let Some(e4) = v4_err.take() {
                        return Err(e4);
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn race_dial_prefers_whichever_answers() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();

        let (stream, winner) = race_dial(port).await.unwrap();
        assert_eq!(winner, SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        drop(stream);
    }

    #[tokio::test]
    async fn race_dial_fails_when_nothing_listens() {
        // Bind then drop to get a port that is very likely closed.
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        drop(ln);

        assert!(race_dial(port).await.is_err());
    }

    #[tokio::test]
    async fn origin_cache_remembers_winner() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();

        let cache = OriginCache::default();
        let s1 = cache.dial(port).await.unwrap();
        assert!(cache.cached(port).await.is_some());
        drop(s1);

        let s2 = cache.dial(port).await.unwrap();
        drop(s2);
    }

    #[test]
    fn client_requires_tunnels() {
        let err = Client::new(ClientOptions {
            server_addr: "127.0.0.1:4443".into(),
            transport: "tcp".into(),
            token: "t".into(),
            version: "0.1.0".into(),
            tunnels: vec![],
            dial_timeout: Duration::from_secs(5),
            tls: TlsDialOptions::default(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("tunnel"));
    }
}
