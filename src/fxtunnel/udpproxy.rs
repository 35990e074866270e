use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{net::UdpSocket, sync::Mutex};

use crate::fxtunnel::{
    datagram,
    protocol::{self, StreamHeader},
    registry::Registry,
    telemetry,
    transport::BoxedStream,
};

/// A peer with no traffic for this long is reaped: stream closed, map entry
/// removed. The next datagram from the same address opens a fresh stream.
pub const UDP_FLOW_IDLE: Duration = Duration::from_secs(60);

/// Bound on concurrent peer keys per tunnel; the oldest flow is evicted on
/// overflow.
pub const UDP_MAX_FLOWS: usize = 1024;

#[derive(Debug, Clone)]
pub struct UdpTunnelOptions {
    pub flow_idle: Duration,
    pub max_flows: usize,
}

impl Default for UdpTunnelOptions {
    fn default() -> Self {
        Self {
            flow_idle: UDP_FLOW_IDLE,
            max_flows: UDP_MAX_FLOWS,
        }
    }
}

struct UdpFlow {
    wr: Mutex<tokio::io::WriteHalf<BoxedStream>>,
    task: tokio::task::JoinHandle<()>,
    started: Instant,
    last: Instant,
}

/// Datagram loop for one UDP tunnel's public socket. Each source address gets
/// its own stream to the owning client; datagram boundaries are preserved with
/// 2-byte length frames in both directions.
pub async fn run_udp_listener(
    registry: Arc<Registry>,
    tunnel_id: String,
    sock: UdpSocket,
    opts: UdpTunnelOptions,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local = sock.local_addr().ok();
    tracing::info!(tunnel = %tunnel_id, local = ?local, "udp: tunnel socket ready");

    let sock = Arc::new(sock);
    let mut flows: HashMap<SocketAddr, UdpFlow> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                let dead: Vec<SocketAddr> = flows
                    .iter()
                    .filter_map(|(k, v)| {
                        (now.duration_since(v.last) > opts.flow_idle).then_some(*k)
                    })
                    .collect();
                for k in dead {
                    if let Some(f) = flows.remove(&k) {
                        f.task.abort();
                        tracing::debug!(tunnel = %tunnel_id, peer = %k, "udp: flow reaped");
                    }
                }
            }
            res = sock.recv_from(&mut buf) => {
                let (n, peer) = res?;
                if n > datagram::MAX_DATAGRAM_BYTES {
                    continue;
                }
                let payload = &buf[..n];

                if !flows.contains_key(&peer) {
                    if flows.len() >= opts.max_flows {
                        evict_oldest(&mut flows);
                    }
                    match open_flow(&registry, &tunnel_id, &sock, peer).await {
                        Ok(flow) => {
                            flows.insert(peer, flow);
                            tracing::debug!(tunnel = %tunnel_id, peer = %peer, "udp: flow created");
                        }
                        Err(err) => {
                            tracing::warn!(tunnel = %tunnel_id, peer = %peer, err = %err, "udp: open flow failed");
                            continue;
                        }
                    }
                }

                if let Some(flow) = flows.get_mut(&peer) {
                    flow.last = Instant::now();
                    let mut wr = flow.wr.lock().await;
                    if datagram::write_frame(&mut *wr, payload).await.is_err() {
                        drop(wr);
                        if let Some(f) = flows.remove(&peer) {
                            f.task.abort();
                        }
                        continue;
                    }
                    telemetry::count_bytes_in(&tunnel_id, n as u64);
                }
            }
        }
    }

    for (_k, f) in flows.drain() {
        f.task.abort();
    }

    tracing::info!(tunnel = %tunnel_id, "udp: tunnel socket stopped");
    Ok(())
}

async fn open_flow(
    registry: &Arc<Registry>,
    tunnel_id: &str,
    sock: &Arc<UdpSocket>,
    peer: SocketAddr,
) -> anyhow::Result<UdpFlow> {
    let Some((_tunnel, sess)) = registry.session_for_tunnel(tunnel_id) else {
        anyhow::bail!("tunnel is gone");
    };

    let mut stream = sess.open_stream().await?;
    let hdr = StreamHeader {
        tunnel_id: tunnel_id.to_string(),
        remote_addr: Some(peer.to_string()),
        meta: [("proto".to_string(), "udp".to_string())].into_iter().collect(),
    };
    protocol::write_stream_header(&mut stream, &hdr).await?;

    let (mut rd, wr) = tokio::io::split(stream);

    let sock2 = sock.clone();
    let tid = tunnel_id.to_string();
    let task = tokio::spawn(async move {
        let mut dbuf = vec![0u8; 64 * 1024];
        loop {
            match datagram::read_frame_into(&mut rd, &mut dbuf).await {
                Ok(n) => {
                    if sock2.send_to(&dbuf[..n], peer).await.is_err() {
                        break;
                    }
                    telemetry::count_bytes_out(&tid, n as u64);
                }
                Err(_) => break,
            }
        }
    });

    let now = Instant::now();
    Ok(UdpFlow {
        wr: Mutex::new(wr),
        task,
        started: now,
        last: now,
    })
}

fn evict_oldest(flows: &mut HashMap<SocketAddr, UdpFlow>) {
    let Some(oldest) = flows
        .iter()
        .min_by_key(|(_, f)| f.started)
        .map(|(k, _)| *k)
    else {
        return;
    };
    if let Some(f) = flows.remove(&oldest) {
        f.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::fxtunnel::{
        ports::PortAllocator,
        protocol::{Plan, TunnelKind},
        registry::{AdmitRequest, test_support::pipe_session_pair},
    };

    #[tokio::test]
    async fn datagrams_roundtrip_with_boundaries() {
        let registry = Arc::new(Registry::new(
            "t.ex",
            PortAllocator::empty(),
            PortAllocator::new(43100, 43101),
        ));
        let (srv, cli) = pipe_session_pair();
        let clock = Arc::new(AtomicU64::new(
            crate::fxtunnel::telemetry::now_unix_ms(),
        ));
        let cid = registry.add_session(None, "user1", "0.1.0", srv, clock);
        let tunnel = registry
            .admit(
                AdmitRequest {
                    client_id: cid,
                    kind: TunnelKind::Udp,
                    name: "dns".into(),
                    subdomain: None,
                    host_aliases: vec![],
                    local_port: 53,
                    desired_public_port: None,
                },
                &Plan::default(),
            )
            .unwrap()
            .tunnel;

        // Fake agent: one framed datagram in, one framed reply out.
        tokio::spawn(async move {
            let st = cli.accept_stream().await.unwrap();
            let (mut rd, mut wr) = tokio::io::split(st);
            let hdr = protocol::read_stream_header(&mut rd).await.unwrap();
            assert_eq!(hdr.meta.get("proto").map(String::as_str), Some("udp"));

            let mut buf = Vec::new();
            let n = datagram::read_frame_into(&mut rd, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"Q");

            datagram::write_frame(&mut wr, b"A").await.unwrap();
            let _ = wr.shutdown().await;
        });

        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let public_addr = sock.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let reg2 = registry.clone();
        let id2 = tunnel.id.clone();
        tokio::spawn(async move {
            let _ = run_udp_listener(reg2, id2, sock, UdpTunnelOptions::default(), stop_rx).await;
        });

        let external = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        external.send_to(b"Q", public_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(
            Duration::from_secs(5),
            external.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..n], b"A");
        assert_eq!(from, public_addr);

        let _ = stop_tx.send(true);
    }
}
