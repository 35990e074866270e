use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::fxtunnel::{inspect::Inspector, registry::Registry};

/// Minimal operational surface. The full admin UI and its REST API live in a
/// separate service; this endpoint exposes health, metrics, the tunnel and
/// session snapshots, and the capture rings.
#[derive(Clone)]
pub struct AdminState {
    pub prom: Arc<PrometheusHandle>,
    pub registry: Arc<Registry>,
    pub inspector: Arc<Inspector>,
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/tunnels", get(tunnels))
        .route("/sessions", get(sessions))
        .route("/tunnels/{id}/exchanges", get(exchanges))
        .route("/tunnels/{id}/exchanges/{eid}", get(exchange))
        .route("/tunnels/{id}/exchanges/clear", post(clear_exchanges))
        .route("/tunnels/{id}/exchanges/stream", get(stream_exchanges))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() {
                    break;
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    sessions: usize,
    tcp_ports_free: usize,
    udp_ports_free: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let (tcp_free, udp_free) = st.registry.free_ports();
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            sessions: st.registry.session_count(),
            tcp_ports_free: tcp_free,
            udp_ports_free: udp_free,
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

async fn tunnels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.registry.snapshot()))
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.registry.sessions_snapshot()))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn exchanges(
    State(st): State<Arc<AdminState>>,
    Path(id): Path<String>,
    Query(q): Query<ListQuery>,
) -> impl IntoResponse {
    let Some(ring) = st.inspector.ring_if_exists(&id) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "no captures"})));
    };
    if ring.is_empty() {
        return (
            StatusCode::OK,
            Json(serde_json::json!({"total": 0, "exchanges": []})),
        );
    }
    let entries = ring.list(q.offset, q.limit.unwrap_or(100));
    (
        StatusCode::OK,
        Json(serde_json::json!({"total": ring.len(), "exchanges": entries})),
    )
}

async fn exchange(
    State(st): State<Arc<AdminState>>,
    Path((id, eid)): Path<(String, u64)>,
) -> impl IntoResponse {
    let found = st
        .inspector
        .ring_if_exists(&id)
        .and_then(|ring| ring.get(eid));
    match found {
        Some(e) => (StatusCode::OK, Json(serde_json::to_value(&*e).unwrap_or_default())),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "not found"})),
        ),
    }
}

async fn clear_exchanges(
    State(st): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Some(ring) = st.inspector.ring_if_exists(&id) {
        ring.clear();
    }
    StatusCode::NO_CONTENT
}

/// Live capture feed: newline-delimited JSON until the consumer hangs up.
/// Slow consumers miss entries instead of slowing the data plane.
async fn stream_exchanges(
    State(st): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let ring = st.inspector.ring(&id);
    let sub = ring.subscribe();
    let sub_id = sub.id;

    struct Unsub {
        ring: Arc<crate::fxtunnel::inspect::InspectRing>,
        id: u64,
    }
    impl Drop for Unsub {
        fn drop(&mut self) {
            self.ring.unsubscribe(self.id);
        }
    }

    let guard = Unsub {
        ring: ring.clone(),
        id: sub_id,
    };

    let stream = futures_util::stream::unfold(
        (sub.rx, guard),
        |(mut rx, guard)| async move {
            let e = rx.recv().await?;
            let mut line = serde_json::to_vec(&*e).unwrap_or_default();
            line.push(b'\n');
            Some((
                Ok::<_, std::convert::Infallible>(bytes::Bytes::from(line)),
                (rx, guard),
            ))
        },
    );

    (
        [("content-type", "application/x-ndjson")],
        Body::from_stream(stream),
    )
}
