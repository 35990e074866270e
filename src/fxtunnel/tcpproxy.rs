use std::sync::Arc;

use tokio::{io::AsyncWriteExt, net::TcpListener, net::TcpStream};

use crate::fxtunnel::{
    protocol::{self, StreamHeader},
    registry::Registry,
    telemetry,
};

/// Accept loop for one TCP tunnel's public port. The listener is bound by the
/// control engine before `TunnelAccept` is sent; stopping the watch channel
/// terminates pending accepts and frees the port for the cool-down queue.
pub async fn run_tcp_listener(
    registry: Arc<Registry>,
    tunnel_id: String,
    ln: TcpListener,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local = ln.local_addr().ok();
    tracing::info!(tunnel = %tunnel_id, local = ?local, "tcp: tunnel listener ready");

    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let registry = registry.clone();
                let tunnel_id = tunnel_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(registry, &tunnel_id, conn, peer).await {
                        tracing::debug!(tunnel = %tunnel_id, peer = %peer, err = %err, "tcp: conn ended");
                    }
                });
            }
        }
    }

    tracing::info!(tunnel = %tunnel_id, "tcp: tunnel listener stopped");
    Ok(())
}

async fn handle_conn(
    registry: Arc<Registry>,
    tunnel_id: &str,
    mut conn: TcpStream,
    peer: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let Some((_tunnel, sess)) = registry.session_for_tunnel(tunnel_id) else {
        anyhow::bail!("tunnel is gone");
    };

    let mut stream = sess.open_stream().await?;
    let hdr = StreamHeader {
        tunnel_id: tunnel_id.to_string(),
        remote_addr: Some(peer.to_string()),
        meta: Default::default(),
    };
    protocol::write_stream_header(&mut stream, &hdr).await?;

    let copied = tokio::io::copy_bidirectional(&mut conn, &mut stream).await;
    let _ = conn.shutdown().await;
    let _ = stream.shutdown().await;

    if let Ok((up, down)) = copied {
        telemetry::count_bytes_in(tunnel_id, up);
        telemetry::count_bytes_out(tunnel_id, down);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::fxtunnel::{
        ports::PortAllocator,
        protocol::{Plan, TunnelKind},
        registry::{AdmitRequest, test_support::pipe_session_pair},
        telemetry,
    };

    #[tokio::test]
    async fn accepted_conn_is_spliced_to_a_fresh_stream() {
        let registry = Arc::new(Registry::new(
            "t.ex",
            PortAllocator::new(42100, 42101),
            PortAllocator::empty(),
        ));
        let (srv, cli) = pipe_session_pair();
        let clock = Arc::new(AtomicU64::new(telemetry::now_unix_ms()));
        let cid = registry.add_session(None, "user1", "0.1.0", srv, clock);
        let tunnel = registry
            .admit(
                AdmitRequest {
                    client_id: cid,
                    kind: TunnelKind::Tcp,
                    name: "ssh".into(),
                    subdomain: None,
                    host_aliases: vec![],
                    local_port: 22,
                    desired_public_port: None,
                },
                &Plan::default(),
            )
            .unwrap()
            .tunnel;

        // Echo agent.
        tokio::spawn(async move {
            let st = cli.accept_stream().await.unwrap();
            let (mut rd, mut wr) = tokio::io::split(st);
            let hdr = crate::fxtunnel::protocol::read_stream_header(&mut rd).await.unwrap();
            assert!(hdr.remote_addr.is_some());
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
            let _ = wr.shutdown().await;
        });

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let reg2 = registry.clone();
        let id2 = tunnel.id.clone();
        tokio::spawn(async move {
            let _ = run_tcp_listener(reg2, id2, ln, stop_rx).await;
        });

        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(b"hello tunnel").await.unwrap();
        c.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        c.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello tunnel");

        let _ = stop_tx.send(true);
    }
}
