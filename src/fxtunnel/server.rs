use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{net::TcpListener, sync::mpsc};

use crate::fxtunnel::{
    auth::TokenVerifier,
    inspect::Inspector,
    limits::RateLimiter,
    net,
    protocol::{self, ControlMessage, ProtocolError, RejectCode, TunnelKind},
    registry::{AdmitRequest, Registry, Tunnel},
    telemetry,
    transport::{
        BoxedStream, TlsListenOptions, TransportListenOptions, TransportSession, transport_by_name,
    },
    udpproxy::{self, UdpTunnelOptions},
};

/// Control handshake (Hello + Auth) must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Send a Ping when the peer has been silent this long.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Absence of any frame for this long forces the session shut.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ControlEndpoint {
    pub listen_addr: String,
    pub transport: String,
}

pub struct ControlServerOptions {
    pub endpoints: Vec<ControlEndpoint>,
    pub tls: TlsListenOptions,
    pub registry: Arc<Registry>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub token_limiter: Arc<RateLimiter>,
    pub inspector: Arc<Inspector>,
    pub server_version: String,
    pub min_client_version: String,
    pub public_http_port: u16,
    pub public_scheme: String,
    pub udp_opts: UdpTunnelOptions,
}

/// Stop handles for the per-tunnel serving tasks (TCP accept loops, UDP
/// sockets). Keyed by tunnel id; closing a tunnel stops its task and pending
/// accepts return.
#[derive(Default)]
pub struct TunnelTasks {
    map: DashMap<String, tokio::sync::watch::Sender<bool>>,
}

impl TunnelTasks {
    pub fn insert(&self, tunnel_id: &str, stop: tokio::sync::watch::Sender<bool>) {
        self.map.insert(tunnel_id.to_string(), stop);
    }

    pub fn stop(&self, tunnel_id: &str) {
        if let Some((_k, tx)) = self.map.remove(tunnel_id) {
            let _ = tx.send(true);
        }
    }
}

pub struct ControlServer {
    opts: Arc<ControlServerOptions>,
    tasks: Arc<TunnelTasks>,
}

impl ControlServer {
    pub fn new(opts: ControlServerOptions) -> Self {
        Self {
            opts: Arc::new(opts),
            tasks: Arc::new(TunnelTasks::default()),
        }
    }

    /// Serve every configured control endpoint until shutdown.
    pub async fn listen_and_serve(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut joins = tokio::task::JoinSet::new();

        for ep in &self.opts.endpoints {
            let tr = transport_by_name(&ep.transport)?;
            let ln = tr
                .listen(
                    &ep.listen_addr,
                    TransportListenOptions {
                        tls: self.opts.tls.clone(),
                        alpn: vec![],
                    },
                )
                .await?;

            tracing::info!(addr = %ep.listen_addr, transport = %tr.name(), "control: listening");

            let opts = self.opts.clone();
            let tasks = self.tasks.clone();
            let mut shutdown = shutdown.clone();
            joins.spawn(async move {
                loop {
                    tokio::select! {
                        res = shutdown.changed() => {
                            if res.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        sess = ln.accept() => {
                            let sess = match sess {
                                Ok(s) => s,
                                Err(err) => {
                                    tracing::warn!(err = %err, "control: accept failed");
                                    break;
                                }
                            };
                            let opts = opts.clone();
                            let tasks = tasks.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                let remote = sess.remote_addr();
                                if let Err(err) = handle_session(opts, tasks, sess, shutdown).await {
                                    tracing::warn!(client = ?remote, err = %err, "control: session ended with error");
                                }
                            });
                        }
                    }
                }
                let _ = ln.close().await;
            });
        }

        while joins.join_next().await.is_some() {}
        Ok(())
    }
}

struct SessionCtx {
    opts: Arc<ControlServerOptions>,
    tasks: Arc<TunnelTasks>,
    client_id: String,
    user_id: String,
    admin: bool,
    plan: protocol::Plan,
    writer: ControlWriter,
    last_recv: Arc<AtomicU64>,
    /// Replay cache: identical req_id on this session yields the identical
    /// outcome.
    replies: HashMap<String, ControlMessage>,
    draining: bool,
}

#[derive(Clone)]
struct ControlWriter {
    wr: Arc<tokio::sync::Mutex<tokio::io::WriteHalf<BoxedStream>>>,
}

impl ControlWriter {
    fn new(wr: tokio::io::WriteHalf<BoxedStream>) -> Self {
        Self {
            wr: Arc::new(tokio::sync::Mutex::new(wr)),
        }
    }

    async fn send(&self, msg: &ControlMessage) -> Result<(), ProtocolError> {
        let mut wr = self.wr.lock().await;
        protocol::write_message(&mut *wr, msg).await
    }
}

async fn handle_session(
    opts: Arc<ControlServerOptions>,
    tasks: Arc<TunnelTasks>,
    sess: Arc<dyn TransportSession>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let remote = sess.remote_addr().map(|a| a.to_string()).unwrap_or_default();

    // The first stream the client opens carries the control channel for the
    // lifetime of the session.
    let control = tokio::time::timeout(HANDSHAKE_TIMEOUT, sess.accept_stream()).await??;
    let (mut rd, wr) = tokio::io::split(control);
    let writer = ControlWriter::new(wr);

    // HANDSHAKE: Hello / HelloAck.
    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, protocol::read_message(&mut rd)).await??;
    let ControlMessage::Hello {
        v: client_version,
        caps: _,
        client_id: id_hint,
    } = hello
    else {
        sess.close().await;
        anyhow::bail!("control: expected hello, got something else");
    };

    writer
        .send(&ControlMessage::HelloAck {
            v: opts.server_version.clone(),
            min_v: opts.min_client_version.clone(),
            caps: vec!["tunnels".into(), "quic".into(), "inspect".into()],
        })
        .await?;

    // Below the floor: finish the ack exchange so the client can fetch update
    // metadata, then part ways.
    if protocol::version_lt(&client_version, &opts.min_client_version) {
        tracing::info!(client = %remote, version = %client_version, "control: client below min version");
        let _ = writer
            .send(&ControlMessage::Goodbye {
                reason: Some(protocol::CLOSE_UPGRADE_REQUIRED.into()),
            })
            .await;
        sess.close().await;
        return Ok(());
    }

    // AUTH: delegated to the external verifier.
    let auth = tokio::time::timeout(HANDSHAKE_TIMEOUT, protocol::read_message(&mut rd)).await??;
    let ControlMessage::Auth { token } = auth else {
        sess.close().await;
        anyhow::bail!("control: expected auth, got something else");
    };

    let decision = match opts.verifier.verify(&token).await {
        Ok(d) => d,
        Err(err) => {
            tracing::warn!(client = %remote, err = %err, "control: auth service failed");
            let _ = writer
                .send(&ControlMessage::AuthResult {
                    ok: false,
                    user_id: None,
                    plan: None,
                    reason: Some(protocol::CLOSE_UNAUTHENTICATED.into()),
                })
                .await;
            sess.close().await;
            return Ok(());
        }
    };
    let Some(decision) = decision else {
        tracing::info!(client = %remote, "control: bad token");
        let _ = writer
            .send(&ControlMessage::AuthResult {
                ok: false,
                user_id: None,
                plan: None,
                reason: Some(protocol::CLOSE_UNAUTHENTICATED.into()),
            })
            .await;
        sess.close().await;
        return Ok(());
    };

    writer
        .send(&ControlMessage::AuthResult {
            ok: true,
            user_id: Some(decision.user_id.clone()),
            plan: Some(decision.plan.clone()),
            reason: None,
        })
        .await?;

    // READY.
    let last_recv = Arc::new(AtomicU64::new(telemetry::now_unix_ms()));
    let client_id = opts.registry.add_session(
        id_hint.as_deref(),
        &decision.user_id,
        &client_version,
        sess.clone(),
        last_recv.clone(),
    );

    tracing::info!(cid = %client_id, client = %remote, user = %decision.user_id, "control: client connected");

    let mut ctx = SessionCtx {
        opts: opts.clone(),
        tasks,
        client_id: client_id.clone(),
        user_id: decision.user_id,
        admin: decision.admin,
        plan: decision.plan,
        writer,
        last_recv,
        replies: HashMap::new(),
        draining: false,
    };

    let res = ready_loop(&mut ctx, rd, &mut shutdown).await;

    // Teardown: session death destroys every tunnel it owns.
    let removed = opts.registry.remove_session(&client_id);
    for t in &removed {
        ctx.tasks.stop(&t.id);
        opts.inspector.drop_tunnel(&t.id);
    }
    sess.close().await;
    tracing::info!(cid = %client_id, client = %remote, tunnels = removed.len(), "control: client disconnected");

    res
}

async fn ready_loop(
    ctx: &mut SessionCtx,
    mut rd: tokio::io::ReadHalf<BoxedStream>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // Frame reads run in their own task; a partially read frame must never be
    // cancelled by a timer tick.
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

    let mut tick = tokio::time::interval(Duration::from_secs(2));
    let mut last_ping_sent = telemetry::now_unix_ms();

    let res = loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    let _ = ctx.writer.send(&ControlMessage::Goodbye {
                        reason: Some("server shutting down".into()),
                    }).await;
                    break Ok(());
                }
            }
            _ = tick.tick() => {
                let now = telemetry::now_unix_ms();
                let idle_for = now.saturating_sub(ctx.last_recv.load(Ordering::Relaxed));
                if idle_for >= IDLE_TIMEOUT.as_millis() as u64 {
                    tracing::info!(cid = %ctx.client_id, "control: session idle; closing");
                    break Ok(());
                }
                if idle_for >= KEEPALIVE_INTERVAL.as_millis() as u64
                    && now.saturating_sub(last_ping_sent) >= KEEPALIVE_INTERVAL.as_millis() as u64
                {
                    last_ping_sent = now;
                    if ctx.writer.send(&ControlMessage::Ping { ts: protocol::rfc3339_now() }).await.is_err() {
                        break Ok(());
                    }
                }
            }
            msg = msg_rx.recv() => {
                match msg {
                    None => break Ok(()),
                    Some(Err(err)) => {
                        if err.is_fatal() {
                            let _ = ctx.writer.send(&ControlMessage::Goodbye {
                                reason: Some(protocol::CLOSE_PROTOCOL_ERROR.into()),
                            }).await;
                            break Err(err.into());
                        }
                        break Ok(());
                    }
                    Some(Ok(m)) => {
                        ctx.last_recv.store(telemetry::now_unix_ms(), Ordering::Relaxed);
                        match dispatch(ctx, m).await {
                            Ok(true) => {}
                            Ok(false) => break Ok(()),
                            Err(err) => break Err(err),
                        }
                    }
                }
            }
        }
    };

    reader.abort();
    res
}

/// Returns Ok(false) when the session should end cleanly.
async fn dispatch(ctx: &mut SessionCtx, msg: ControlMessage) -> anyhow::Result<bool> {
    match msg {
        ControlMessage::Ping { ts } => {
            ctx.writer.send(&ControlMessage::Pong { ts }).await?;
        }
        ControlMessage::Pong { .. } => {}
        ControlMessage::TunnelRequest {
            req_id,
            kind,
            name,
            subdomain,
            host_aliases,
            local_port,
            desired_public_port,
        } => {
            let reply = if let Some(prev) = ctx.replies.get(&req_id) {
                prev.clone()
            } else {
                let reply = handle_tunnel_request(
                    ctx,
                    req_id.clone(),
                    kind,
                    name,
                    subdomain,
                    host_aliases,
                    local_port,
                    desired_public_port,
                )
                .await;
                ctx.replies.insert(req_id, reply.clone());
                reply
            };
            ctx.writer.send(&reply).await?;
        }
        ControlMessage::TunnelClose { id, reason } => {
            match ctx.opts.registry.close_by_id(&id, &ctx.user_id, ctx.admin) {
                Ok(t) => {
                    ctx.tasks.stop(&t.id);
                    ctx.opts.inspector.drop_tunnel(&t.id);
                    tracing::info!(cid = %ctx.client_id, tunnel = %id, reason = ?reason, "control: tunnel closed");
                }
                Err(err) => {
                    tracing::debug!(cid = %ctx.client_id, tunnel = %id, err = %err, "control: close ignored");
                }
            }
        }
        ControlMessage::Goodbye { reason } => {
            // Graceful drain: tunnels stop answering, in-flight streams keep
            // running on the still-open transport until the client hangs up.
            tracing::info!(cid = %ctx.client_id, reason = ?reason, "control: goodbye");
            ctx.draining = true;
            ctx.opts.registry.mark_draining(&ctx.client_id);
            let removed = remove_client_tunnels(ctx);
            tracing::debug!(cid = %ctx.client_id, tunnels = removed, "control: drained tunnels");
        }
        ControlMessage::Hello { .. }
        | ControlMessage::HelloAck { .. }
        | ControlMessage::Auth { .. }
        | ControlMessage::AuthResult { .. }
        | ControlMessage::TunnelAccept { .. }
        | ControlMessage::TunnelReject { .. } => {
            // Valid kinds in the wrong phase/direction violate the state
            // machine.
            let _ = ctx
                .writer
                .send(&ControlMessage::Goodbye {
                    reason: Some(protocol::CLOSE_PROTOCOL_ERROR.into()),
                })
                .await;
            anyhow::bail!("control: handshake-phase message in ready state");
        }
    }
    Ok(true)
}

fn remove_client_tunnels(ctx: &SessionCtx) -> usize {
    let mut n = 0;
    for t in ctx.opts.registry.snapshot() {
        if t.client_id == ctx.client_id && ctx.opts.registry.remove_tunnel(&t.id).is_some() {
            ctx.tasks.stop(&t.id);
            ctx.opts.inspector.drop_tunnel(&t.id);
            n += 1;
        }
    }
    n
}

#[allow(clippy::too_many_arguments)]
async fn handle_tunnel_request(
    ctx: &mut SessionCtx,
    req_id: String,
    kind: TunnelKind,
    name: String,
    subdomain: Option<String>,
    host_aliases: Vec<String>,
    local_port: u16,
    desired_public_port: Option<u16>,
) -> ControlMessage {
    if ctx.draining {
        return reject(&req_id, RejectCode::Invalid, "session is draining");
    }

    if !ctx.opts.token_limiter.allow(&ctx.user_id) {
        telemetry::count_rejection(protocol::CLOSE_RATE_LIMITED);
        return reject(&req_id, RejectCode::Limit, protocol::CLOSE_RATE_LIMITED);
    }

    let admitted = match ctx.opts.registry.admit(
        AdmitRequest {
            client_id: ctx.client_id.clone(),
            kind,
            name,
            subdomain,
            host_aliases,
            local_port,
            desired_public_port,
        },
        &ctx.plan,
    ) {
        Ok(a) => a,
        Err(err) => {
            let code = err.code();
            telemetry::count_rejection(&code.to_string());
            tracing::info!(cid = %ctx.client_id, code = %code, err = %err, "control: tunnel rejected");
            return reject(&req_id, code, &err.to_string());
        }
    };

    if let Some(evicted) = &admitted.evicted {
        ctx.tasks.stop(&evicted.id);
        ctx.opts.inspector.drop_tunnel(&evicted.id);
    }

    let tunnel = admitted.tunnel;
    match start_serving(ctx, &tunnel).await {
        Ok(()) => {}
        Err(err) => {
            // Roll back the registration; the port returns through cool-down.
            ctx.opts.registry.remove_tunnel(&tunnel.id);
            tracing::warn!(cid = %ctx.client_id, tunnel = %tunnel.id, err = %err, "control: listener start failed");
            telemetry::count_rejection(&RejectCode::Conflict.to_string());
            return reject(&req_id, RejectCode::Conflict, "public port bind failed");
        }
    }

    tracing::info!(
        cid = %ctx.client_id,
        tunnel = %tunnel.id,
        kind = %tunnel.kind,
        subdomain = %tunnel.subdomain,
        port = tunnel.public_port,
        "control: tunnel accepted"
    );

    ControlMessage::TunnelAccept {
        req_id,
        id: tunnel.id.clone(),
        public_url: (tunnel.kind == TunnelKind::Http).then(|| public_url(ctx, &tunnel)),
        public_port: (tunnel.kind != TunnelKind::Http).then_some(tunnel.public_port),
    }
}

async fn start_serving(ctx: &SessionCtx, tunnel: &Arc<Tunnel>) -> anyhow::Result<()> {
    match tunnel.kind {
        TunnelKind::Http => Ok(()),
        TunnelKind::Tcp => {
            let addr = net::normalize_bind_addr(&format!(":{}", tunnel.public_port)).into_owned();
            let ln = TcpListener::bind(&addr).await?;
            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            ctx.tasks.insert(&tunnel.id, stop_tx);

            let registry = ctx.opts.registry.clone();
            let id = tunnel.id.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    crate::fxtunnel::tcpproxy::run_tcp_listener(registry, id.clone(), ln, stop_rx)
                        .await
                {
                    tracing::warn!(tunnel = %id, err = %err, "tcp: listener stopped with error");
                }
            });
            Ok(())
        }
        TunnelKind::Udp => {
            let addr = net::normalize_bind_addr(&format!(":{}", tunnel.public_port)).into_owned();
            let sock = tokio::net::UdpSocket::bind(&addr).await?;
            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            ctx.tasks.insert(&tunnel.id, stop_tx);

            let registry = ctx.opts.registry.clone();
            let id = tunnel.id.clone();
            let opts = ctx.opts.udp_opts.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    udpproxy::run_udp_listener(registry, id.clone(), sock, opts, stop_rx).await
                {
                    tracing::warn!(tunnel = %id, err = %err, "udp: socket stopped with error");
                }
            });
            Ok(())
        }
    }
}

fn public_url(ctx: &SessionCtx, tunnel: &Tunnel) -> String {
    let scheme = &ctx.opts.public_scheme;
    let base = ctx.opts.registry.base_domain();
    let port = ctx.opts.public_http_port;
    let default_port = match scheme.as_str() {
        "https" => 443,
        _ => 80,
    };
    if port == default_port {
        format!("{scheme}://{}.{base}", tunnel.subdomain)
    } else {
        format!("{scheme}://{}.{base}:{port}", tunnel.subdomain)
    }
}

fn reject(req_id: &str, code: RejectCode, message: &str) -> ControlMessage {
    ControlMessage::TunnelReject {
        req_id: req_id.to_string(),
        code,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fxtunnel::{
        auth,
        ports::PortAllocator,
        registry::test_support::pipe_session_pair,
        transport::BoxedStream,
    };

    fn test_registry() -> Arc<Registry> {
        Arc::new(Registry::new(
            "t.ex",
            PortAllocator::new(42000, 42001),
            PortAllocator::new(43000, 43001),
        ))
    }

    fn test_opts(registry: Arc<Registry>) -> Arc<ControlServerOptions> {
        let mut tokens = HashMap::new();
        tokens.insert(
            "sk_T".to_string(),
            auth::AuthDecision {
                user_id: "user1".into(),
                plan: protocol::Plan::default(),
                admin: false,
            },
        );
        Arc::new(ControlServerOptions {
            endpoints: vec![],
            tls: TlsListenOptions::default(),
            registry,
            verifier: Arc::new(auth::StaticVerifier::new(tokens)),
            token_limiter: Arc::new(RateLimiter::new(0.0, 1.0)),
            inspector: Arc::new(Inspector::new(false, 16, 1024, None)),
            server_version: "0.4.0".into(),
            min_client_version: "0.1.0".into(),
            public_http_port: 8080,
            public_scheme: "http".into(),
            udp_opts: UdpTunnelOptions::default(),
        })
    }

    struct TestClient {
        rd: tokio::io::ReadHalf<BoxedStream>,
        writer: ControlWriter,
        _shutdown_tx: tokio::sync::watch::Sender<bool>,
    }

    impl TestClient {
        async fn send(&self, msg: ControlMessage) {
            self.writer.send(&msg).await.unwrap();
        }

        async fn recv(&mut self) -> ControlMessage {
            tokio::time::timeout(Duration::from_secs(5), protocol::read_message(&mut self.rd))
                .await
                .unwrap()
                .unwrap()
        }
    }

    async fn connect_and_auth(opts: Arc<ControlServerOptions>) -> TestClient {
        let (srv, cli) = pipe_session_pair();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            let _ = handle_session(opts, Arc::new(TunnelTasks::default()), srv, shutdown_rx).await;
        });

        let control = cli.open_stream().await.unwrap();
        let (rd, wr) = tokio::io::split(control);
        let mut c = TestClient {
            rd,
            writer: ControlWriter::new(wr),
            _shutdown_tx: shutdown_tx,
        };

        c.send(ControlMessage::Hello {
            v: "0.4.0".into(),
            caps: vec![],
            client_id: None,
        })
        .await;
        let ack = c.recv().await;
        assert!(matches!(ack, ControlMessage::HelloAck { .. }));

        c.send(ControlMessage::Auth {
            token: "sk_T".into(),
        })
        .await;
        let res = c.recv().await;
        assert!(matches!(res, ControlMessage::AuthResult { ok: true, .. }));

        c
    }

    fn http_request(req_id: &str, subdomain: &str) -> ControlMessage {
        ControlMessage::TunnelRequest {
            req_id: req_id.into(),
            kind: TunnelKind::Http,
            name: "web".into(),
            subdomain: Some(subdomain.into()),
            host_aliases: vec![],
            local_port: 3000,
            desired_public_port: None,
        }
    }

    #[tokio::test]
    async fn handshake_then_http_tunnel_accept() {
        let registry = test_registry();
        let mut c = connect_and_auth(test_opts(registry.clone())).await;

        c.send(http_request("r-1", "app")).await;
        let reply = c.recv().await;
        let ControlMessage::TunnelAccept { req_id, public_url, .. } = reply else {
            panic!("expected accept, got {reply:?}");
        };
        assert_eq!(req_id, "r-1");
        assert_eq!(public_url.as_deref(), Some("http://app.t.ex:8080"));
        assert!(registry.lookup_label("app").is_some());
    }

    #[tokio::test]
    async fn same_req_id_replays_the_same_outcome() {
        let registry = test_registry();
        let mut c = connect_and_auth(test_opts(registry.clone())).await;

        c.send(http_request("r-1", "app")).await;
        let first = c.recv().await;
        c.send(http_request("r-1", "app")).await;
        let second = c.recv().await;
        assert_eq!(first, second);

        // Only one tunnel was registered.
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn bad_token_gets_auth_result_not_ok() {
        let registry = test_registry();
        let opts = test_opts(registry);
        let (srv, cli) = pipe_session_pair();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            let _ = handle_session(opts, Arc::new(TunnelTasks::default()), srv, shutdown_rx).await;
        });

        let control = cli.open_stream().await.unwrap();
        let (mut rd, wr) = tokio::io::split(control);
        let writer = ControlWriter::new(wr);

        writer
            .send(&ControlMessage::Hello {
                v: "0.4.0".into(),
                caps: vec![],
                client_id: None,
            })
            .await
            .unwrap();
        let _ack = protocol::read_message(&mut rd).await.unwrap();

        writer
            .send(&ControlMessage::Auth {
                token: "sk_wrong".into(),
            })
            .await
            .unwrap();
        let res = protocol::read_message(&mut rd).await.unwrap();
        let ControlMessage::AuthResult { ok, reason, .. } = res else {
            panic!("expected auth_result");
        };
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some(protocol::CLOSE_UNAUTHENTICATED));
    }

    #[tokio::test]
    async fn stale_client_gets_goodbye_with_upgrade_required() {
        let registry = test_registry();
        let mut opts = (*test_opts(registry)).clone_for_test();
        opts.min_client_version = "0.4.0".into();
        let opts = Arc::new(opts);

        let (srv, cli) = pipe_session_pair();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _ = handle_session(opts, Arc::new(TunnelTasks::default()), srv, shutdown_rx).await;
        });

        let control = cli.open_stream().await.unwrap();
        let (mut rd, wr) = tokio::io::split(control);
        let writer = ControlWriter::new(wr);

        writer
            .send(&ControlMessage::Hello {
                v: "0.3.0".into(),
                caps: vec![],
                client_id: None,
            })
            .await
            .unwrap();

        let ack = protocol::read_message(&mut rd).await.unwrap();
        assert!(matches!(ack, ControlMessage::HelloAck { .. }));
        let bye = protocol::read_message(&mut rd).await.unwrap();
        assert_eq!(
            bye,
            ControlMessage::Goodbye {
                reason: Some(protocol::CLOSE_UPGRADE_REQUIRED.into())
            }
        );
    }

    #[tokio::test]
    async fn goodbye_drains_tunnels() {
        let registry = test_registry();
        let mut c = connect_and_auth(test_opts(registry.clone())).await;

        c.send(http_request("r-1", "app")).await;
        let _ = c.recv().await;
        assert!(registry.lookup_label("app").is_some());

        c.send(ControlMessage::Goodbye { reason: None }).await;

        // The drain is applied by the session loop; poll until it lands.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if registry.lookup_label("app").is_none() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "tunnel was not drained");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    impl ControlServerOptions {
        fn clone_for_test(&self) -> ControlServerOptions {
            ControlServerOptions {
                endpoints: self.endpoints.clone(),
                tls: self.tls.clone(),
                registry: self.registry.clone(),
                verifier: self.verifier.clone(),
                token_limiter: self.token_limiter.clone(),
                inspector: self.inspector.clone(),
                server_version: self.server_version.clone(),
                min_client_version: self.min_client_version.clone(),
                public_http_port: self.public_http_port,
                public_scheme: self.public_scheme.clone(),
                udp_opts: self.udp_opts.clone(),
            }
        }
    }
}
