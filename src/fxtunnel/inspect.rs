use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::fxtunnel::telemetry;

/// Default ring capacity per HTTP tunnel.
pub const DEFAULT_RING_CAPACITY: usize = 256;

/// Bytes of request/response body kept per exchange. Larger bodies are stored
/// as a prefix plus the true size.
pub const DEFAULT_BODY_CAP: usize = 256 * 1024;

/// Queue depth for the persistence worker. When full, newer exchanges skip the
/// archive but stay in RAM; operators see an occasional gap under load.
const PERSIST_QUEUE_DEPTH: usize = 256;

/// Per-subscriber channel depth. Appends never wait for slow subscribers; a
/// full channel drops the notification.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct CapturedExchange {
    pub id: u64,
    pub tunnel_id: String,
    pub at_unix_ms: u64,
    pub remote_addr: String,
    pub method: String,
    pub path: String,
    pub request_headers: Vec<(String, String)>,
    /// Prefix of the request body, capped; `request_body_len` is the true
    /// size. Serialized as base64 so the archive and the admin API carry the
    /// bytes, not just their length.
    #[serde(rename = "request_body_b64", serialize_with = "ser_base64")]
    pub request_body: Vec<u8>,
    pub request_body_len: u64,
    pub status: u16,
    pub response_headers: Vec<(String, String)>,
    #[serde(rename = "response_body_b64", serialize_with = "ser_base64")]
    pub response_body: Vec<u8>,
    pub response_body_len: u64,
    pub duration_ms: u64,
}

fn ser_base64<S: serde::Serializer>(b: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&BASE64.encode(b))
}

struct RingState {
    entries: VecDeque<Arc<CapturedExchange>>,
    capacity: usize,
    next_id: u64,
    next_sub_id: u64,
    subscribers: Vec<(u64, mpsc::Sender<Arc<CapturedExchange>>)>,
    closed: bool,
}

/// Fixed-capacity ring of captured exchanges with fan-out subscribers.
///
/// The lock covers only map mutation; subscriber sends happen on a snapshot
/// taken inside the critical section and delivered after release.
pub struct InspectRing {
    state: Mutex<RingState>,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<CapturedExchange>>,
}

impl InspectRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                entries: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                next_id: 1,
                next_sub_id: 1,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// O(1) append, overwriting the oldest entry when full. Returns the stored
    /// entry, or None when the ring is closed.
    pub fn append(&self, mut e: CapturedExchange) -> Option<Arc<CapturedExchange>> {
        let (entry, subs) = {
            let mut st = self.lock();
            if st.closed {
                return None;
            }
            e.id = st.next_id;
            st.next_id += 1;
            let entry = Arc::new(e);
            if st.entries.len() == st.capacity {
                st.entries.pop_front();
            }
            st.entries.push_back(entry.clone());
            let subs: Vec<_> = st.subscribers.iter().map(|(_, tx)| tx.clone()).collect();
            (entry, subs)
        };

        for tx in subs {
            if tx.try_send(entry.clone()).is_err() {
                metrics::counter!("fxtunnel_inspect_notifications_dropped_total").increment(1);
            }
        }
        Some(entry)
    }

    /// Snapshot in reverse chronological order.
    pub fn list(&self, offset: usize, limit: usize) -> Vec<Arc<CapturedExchange>> {
        let st = self.lock();
        st.entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Linear scan bounded by the ring capacity.
    pub fn get(&self, id: u64) -> Option<Arc<CapturedExchange>> {
        let st = self.lock();
        st.entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let mut st = self.lock();
        let id = st.next_sub_id;
        st.next_sub_id += 1;
        st.subscribers.push((id, tx));
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut st = self.lock();
        st.subscribers.retain(|(sid, _)| *sid != id);
    }

    pub fn clear(&self) {
        let mut st = self.lock();
        st.entries.clear();
    }

    /// Close all subscriber channels; further appends are no-ops.
    pub fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.subscribers.clear();
        st.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable archive for captured exchanges; the real store lives in the admin
/// service.
#[async_trait]
pub trait InspectStore: Send + Sync {
    async fn save(&self, user_id: &str, exchange: Arc<CapturedExchange>) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<(String, Arc<CapturedExchange>)>,
}

impl PersistHandle {
    /// Non-blocking enqueue; drops the exchange from persistence when the
    /// queue is full. The entry stays in the ring either way.
    pub fn enqueue(&self, user_id: &str, exchange: Arc<CapturedExchange>) {
        if self.tx.try_send((user_id.to_string(), exchange)).is_err() {
            metrics::counter!("fxtunnel_inspect_persist_dropped_total").increment(1);
        }
    }
}

/// Single-writer drain task feeding the archive.
pub fn spawn_persistence(store: Arc<dyn InspectStore>) -> PersistHandle {
    let (tx, mut rx) = mpsc::channel::<(String, Arc<CapturedExchange>)>(PERSIST_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some((user_id, exchange)) = rx.recv().await {
            if let Err(err) = store.save(&user_id, exchange).await {
                tracing::warn!(err = %err, "inspect: persist failed");
            }
        }
    });
    PersistHandle { tx }
}

/// Append-only JSON-lines archive. The deployment-grade store lives in the
/// admin service; this one covers single-node setups and tests.
pub struct JsonlStore {
    path: std::path::PathBuf,
}

impl JsonlStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Serialize)]
struct ArchivedExchange<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    exchange: &'a CapturedExchange,
}

#[async_trait]
impl InspectStore for JsonlStore {
    async fn save(&self, user_id: &str, exchange: Arc<CapturedExchange>) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&ArchivedExchange {
            user_id,
            exchange: &exchange,
        })?;
        line.push(b'\n');

        use tokio::io::AsyncWriteExt;
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        f.write_all(&line).await?;
        Ok(())
    }
}

/// Per-tunnel ring directory used by the HTTP proxy and the admin surface.
/// Rings are created on first capture and closed when their tunnel goes away.
pub struct Inspector {
    enabled: bool,
    capacity: usize,
    body_cap: usize,
    rings: dashmap::DashMap<String, Arc<InspectRing>>,
    persist: Option<PersistHandle>,
}

impl Inspector {
    pub fn new(
        enabled: bool,
        capacity: usize,
        body_cap: usize,
        persist: Option<PersistHandle>,
    ) -> Self {
        Self {
            enabled,
            capacity: capacity.max(1),
            body_cap: body_cap.max(1),
            rings: dashmap::DashMap::new(),
            persist,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn body_cap(&self) -> usize {
        self.body_cap
    }

    pub fn ring(&self, tunnel_id: &str) -> Arc<InspectRing> {
        self.rings
            .entry(tunnel_id.to_string())
            .or_insert_with(|| Arc::new(InspectRing::new(self.capacity)))
            .clone()
    }

    pub fn ring_if_exists(&self, tunnel_id: &str) -> Option<Arc<InspectRing>> {
        self.rings.get(tunnel_id).map(|r| r.clone())
    }

    /// Append to the tunnel's ring and hand the exchange to the archive.
    pub fn record(&self, user_id: &str, exchange: CapturedExchange) {
        if !self.enabled {
            return;
        }
        let ring = self.ring(&exchange.tunnel_id);
        if let Some(stored) = ring.append(exchange) {
            if let Some(p) = &self.persist {
                p.enqueue(user_id, stored);
            }
        }
    }

    pub fn drop_tunnel(&self, tunnel_id: &str) {
        if let Some((_k, ring)) = self.rings.remove(tunnel_id) {
            ring.close();
        }
    }
}

/// Builder used by the HTTP proxy while an exchange is in flight.
pub struct ExchangeCapture {
    body_cap: usize,
    started_unix_ms: u64,
    exchange: CapturedExchange,
}

impl ExchangeCapture {
    pub fn new(tunnel_id: &str, remote_addr: &str, body_cap: usize) -> Self {
        let now = telemetry::now_unix_ms();
        Self {
            body_cap,
            started_unix_ms: now,
            exchange: CapturedExchange {
                id: 0,
                tunnel_id: tunnel_id.to_string(),
                at_unix_ms: now,
                remote_addr: remote_addr.to_string(),
                method: String::new(),
                path: String::new(),
                request_headers: Vec::new(),
                request_body: Vec::new(),
                request_body_len: 0,
                status: 0,
                response_headers: Vec::new(),
                response_body: Vec::new(),
                response_body_len: 0,
                duration_ms: 0,
            },
        }
    }

    pub fn request_line(&mut self, method: &str, path: &str) {
        self.exchange.method = method.to_string();
        self.exchange.path = path.to_string();
    }

    pub fn request_headers(&mut self, headers: &[(String, String)]) {
        self.exchange.request_headers = headers.to_vec();
    }

    pub fn response_head(&mut self, status: u16, headers: &[(String, String)]) {
        self.exchange.status = status;
        self.exchange.response_headers = headers.to_vec();
    }

    pub fn request_body_chunk(&mut self, chunk: &[u8]) {
        self.exchange.request_body_len += chunk.len() as u64;
        tee_into(&mut self.exchange.request_body, chunk, self.body_cap);
    }

    pub fn response_body_chunk(&mut self, chunk: &[u8]) {
        self.exchange.response_body_len += chunk.len() as u64;
        tee_into(&mut self.exchange.response_body, chunk, self.body_cap);
    }

    pub fn finish(mut self) -> CapturedExchange {
        self.exchange.duration_ms = telemetry::now_unix_ms().saturating_sub(self.started_unix_ms);
        self.exchange
    }
}

fn tee_into(dst: &mut Vec<u8>, chunk: &[u8], cap: usize) {
    if dst.len() >= cap {
        return;
    }
    let room = cap - dst.len();
    dst.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(tunnel: &str) -> CapturedExchange {
        let mut c = ExchangeCapture::new(tunnel, "203.0.113.7:1", DEFAULT_BODY_CAP);
        c.request_line("GET", "/hi");
        c.response_head(200, &[]);
        c.finish()
    }

    #[test]
    fn ring_overwrites_oldest_and_lists_reverse() {
        let ring = InspectRing::new(256);
        for _ in 0..300 {
            ring.append(exchange("t-1"));
        }
        assert_eq!(ring.len(), 256);

        let listed = ring.list(0, 512);
        assert_eq!(listed.len(), 256);
        // Most recent first.
        assert_eq!(listed[0].id, 300);
        assert_eq!(listed[255].id, 45);
    }

    #[test]
    fn get_hits_only_retained_entries() {
        let ring = InspectRing::new(4);
        for _ in 0..6 {
            ring.append(exchange("t-1"));
        }
        assert!(ring.get(1).is_none());
        assert!(ring.get(6).is_some());
    }

    #[tokio::test]
    async fn subscriber_sees_only_subsequent_exchanges() {
        let ring = InspectRing::new(16);
        ring.append(exchange("t-1"));

        let mut sub = ring.subscribe();
        ring.append(exchange("t-1"));

        let got = sub.rx.recv().await.unwrap();
        assert_eq!(got.id, 2);
    }

    #[test]
    fn full_subscriber_never_blocks_append() {
        let ring = InspectRing::new(512);
        let _sub = ring.subscribe();
        // Never reading from _sub; appends must keep succeeding.
        for _ in 0..300 {
            assert!(ring.append(exchange("t-1")).is_some());
        }
        assert_eq!(ring.len(), 300);
    }

    #[test]
    fn close_makes_append_a_noop() {
        let ring = InspectRing::new(8);
        ring.append(exchange("t-1"));
        ring.close();
        assert!(ring.append(exchange("t-1")).is_none());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn body_at_cap_kept_in_full_one_over_truncated() {
        let cap = 16;
        let mut c = ExchangeCapture::new("t-1", "a", cap);
        c.request_body_chunk(&vec![1u8; cap]);
        let e = c.finish();
        assert_eq!(e.request_body.len(), cap);
        assert_eq!(e.request_body_len, cap as u64);

        let mut c = ExchangeCapture::new("t-1", "a", cap);
        c.request_body_chunk(&vec![1u8; cap + 1]);
        let e = c.finish();
        assert_eq!(e.request_body.len(), cap);
        assert_eq!(e.request_body_len, cap as u64 + 1);
    }

    #[tokio::test]
    async fn jsonl_store_appends_lines_with_body_prefixes() {
        let dir = std::env::temp_dir().join("fxtunnel-inspect-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("archive-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut c = ExchangeCapture::new("t-1", "203.0.113.7:1", DEFAULT_BODY_CAP);
        c.request_line("POST", "/submit");
        c.request_body_chunk(b"hello");
        c.response_head(200, &[]);
        c.response_body_chunk(b"ok");
        let with_bodies = c.finish();

        let store = JsonlStore::new(path.clone());
        store.save("user1", Arc::new(with_bodies)).await.unwrap();
        store.save("user1", Arc::new(exchange("t-1"))).await.unwrap();

        let data = std::fs::read_to_string(&path).unwrap();
        assert_eq!(data.lines().count(), 2);
        assert!(data.lines().all(|l| l.contains(r#""user_id":"user1""#)));

        // The archive carries the body prefix, not just its length.
        let first = data.lines().next().unwrap();
        assert!(first.contains(&format!(r#""request_body_b64":"{}""#, BASE64.encode(b"hello"))));
        assert!(first.contains(&format!(r#""response_body_b64":"{}""#, BASE64.encode(b"ok"))));
        assert!(first.contains(r#""request_body_len":5"#));
    }

    #[tokio::test]
    async fn persistence_drops_when_queue_full() {
        struct SlowStore;
        #[async_trait]
        impl InspectStore for SlowStore {
            async fn save(
                &self,
                _user_id: &str,
                _e: Arc<CapturedExchange>,
            ) -> anyhow::Result<()> {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let h = spawn_persistence(Arc::new(SlowStore));
        // Far more than the queue depth; enqueue must never block.
        for _ in 0..2000 {
            h.enqueue("user1", Arc::new(exchange("t-1")));
        }
    }
}
