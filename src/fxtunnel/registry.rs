use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::fxtunnel::{
    ports::{PortAllocator, PortError},
    protocol::{Plan, RejectCode, TunnelKind},
    telemetry,
    transport::TransportSession,
};

/// A session with no inbound frame for this long is considered dead; its
/// subdomains become reclaimable by the same user.
pub const SESSION_LIVENESS_MS: u64 = 30_000;

const GENERATED_LABEL_LEN: usize = 8;
const GENERATED_LABEL_RETRIES: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct Tunnel {
    pub id: String,
    pub kind: TunnelKind,
    pub name: String,
    pub owner_user_id: String,
    pub client_id: String,
    #[serde(serialize_with = "ser_rfc3339")]
    pub created_at: SystemTime,
    /// HTTP only.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subdomain: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host_aliases: Vec<String>,
    /// TCP/UDP only.
    #[serde(skip_serializing_if = "is_zero_port")]
    pub public_port: u16,
    pub local_port: u16,
}

fn is_zero_port(p: &u16) -> bool {
    *p == 0
}

fn ser_rfc3339<S: serde::Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&humantime::format_rfc3339_millis(*t).to_string())
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("{0}")]
    Conflict(String),
    #[error("no free ports")]
    NoPorts,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Limit(String),
    #[error("{0}")]
    Invalid(String),
}

impl AdmissionError {
    pub fn code(&self) -> RejectCode {
        match self {
            AdmissionError::Conflict(_) => RejectCode::Conflict,
            AdmissionError::NoPorts => RejectCode::NoPorts,
            AdmissionError::Forbidden(_) => RejectCode::Forbidden,
            AdmissionError::Limit(_) => RejectCode::Limit,
            AdmissionError::Invalid(_) => RejectCode::Invalid,
        }
    }
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("tunnel not found")]
    NotFound,
    #[error("not the tunnel owner")]
    Forbidden,
}

pub struct AdmitRequest {
    pub client_id: String,
    pub kind: TunnelKind,
    pub name: String,
    pub subdomain: Option<String>,
    pub host_aliases: Vec<String>,
    pub local_port: u16,
    pub desired_public_port: Option<u16>,
}

/// Result of a successful admission. `evicted` carries a same-user tunnel
/// whose dead session was holding the requested subdomain; the caller must
/// tear down whatever serving state it still has.
pub struct Admitted {
    pub tunnel: Arc<Tunnel>,
    pub evicted: Option<Arc<Tunnel>>,
}

struct SessionEntry {
    user_id: String,
    version: String,
    sess: Arc<dyn TransportSession>,
    started_at: SystemTime,
    draining: bool,
    last_recv_unix_ms: Arc<AtomicU64>,
}

#[derive(Default)]
struct State {
    tunnels: HashMap<String, Arc<Tunnel>>,
    by_host: HashMap<String, String>,
    by_tcp_port: HashMap<u16, String>,
    by_udp_port: HashMap<u16, String>,
    by_user: HashMap<String, HashSet<String>>,
    by_client: HashMap<String, HashSet<String>>,
    sessions: HashMap<String, SessionEntry>,
    tcp_ports: PortAllocator,
    udp_ports: PortAllocator,
}

/// Authoritative map of active tunnels and live sessions.
///
/// All multi-index mutations happen under one lock with short critical
/// sections; the lock is never held across I/O. Sessions hold tunnels by id;
/// the HTTP router and the proxy listeners go through the secondary indexes
/// kept here.
pub struct Registry {
    base_domain: String,
    id_seq: AtomicU64,
    state: Mutex<State>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(base_domain: &str, tcp_ports: PortAllocator, udp_ports: PortAllocator) -> Self {
        Self {
            base_domain: base_domain.trim().to_ascii_lowercase(),
            id_seq: AtomicU64::new(1),
            state: Mutex::new(State {
                tcp_ports,
                udp_ports,
                ..State::default()
            }),
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a live session. The hint from `Hello.client_id` is honored
    /// when free; otherwise a fresh id is assigned. No two sessions ever share
    /// a client id.
    pub fn add_session(
        &self,
        hint: Option<&str>,
        user_id: &str,
        version: &str,
        sess: Arc<dyn TransportSession>,
        last_recv_unix_ms: Arc<AtomicU64>,
    ) -> String {
        let mut st = self.lock();

        let mut client_id = hint
            .map(str::trim)
            .filter(|h| !h.is_empty() && !st.sessions.contains_key(*h))
            .map(str::to_string)
            .unwrap_or_default();
        while client_id.is_empty() || st.sessions.contains_key(&client_id) {
            let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
            client_id = format!("c-{n}");
        }

        st.sessions.insert(
            client_id.clone(),
            SessionEntry {
                user_id: user_id.to_string(),
                version: version.to_string(),
                sess,
                started_at: SystemTime::now(),
                draining: false,
                last_recv_unix_ms,
            },
        );
        drop(st);

        telemetry::count_session_open();
        client_id
    }

    /// Stop admitting new tunnels on this session; existing streams finish.
    pub fn mark_draining(&self, client_id: &str) {
        let mut st = self.lock();
        if let Some(e) = st.sessions.get_mut(client_id) {
            e.draining = true;
        }
    }

    /// Remove a session and every tunnel it owns. Returns the removed tunnels
    /// so the caller can stop their listeners.
    pub fn remove_session(&self, client_id: &str) -> Vec<Arc<Tunnel>> {
        let mut st = self.lock();
        if st.sessions.remove(client_id).is_none() {
            return Vec::new();
        }

        let ids: Vec<String> = st
            .by_client
            .get(client_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = remove_tunnel_locked(&mut st, &id) {
                removed.push(t);
            }
        }
        drop(st);

        telemetry::count_session_close();
        removed
    }

    pub fn session_user(&self, client_id: &str) -> Option<String> {
        let st = self.lock();
        st.sessions.get(client_id).map(|e| e.user_id.clone())
    }

    /// Admission pipeline for a `TunnelRequest`: plan limits, then name/port
    /// assignment, then a transactional insert into every index.
    pub fn admit(&self, req: AdmitRequest, plan: &Plan) -> Result<Admitted, AdmissionError> {
        let mut st = self.lock();

        let Some(sess) = st.sessions.get(&req.client_id) else {
            return Err(AdmissionError::Invalid("unknown session".into()));
        };
        if sess.draining {
            return Err(AdmissionError::Invalid("session is draining".into()));
        }
        let user_id = sess.user_id.clone();

        check_plan_limits(&st, &user_id, req.kind, plan)?;

        let mut evicted = None;
        let mut subdomain = String::new();
        let mut aliases = Vec::new();
        let mut public_port = 0u16;

        match req.kind {
            TunnelKind::Http => {
                let label = match &req.subdomain {
                    Some(want) => {
                        let label = normalize_label(want)
                            .ok_or_else(|| AdmissionError::Invalid(format!("bad subdomain {want:?}")))?;
                        check_scope(plan, &label)?;
                        if let Some(existing_id) = st.by_host.get(&label).cloned() {
                            let existing = st.tunnels[&existing_id].clone();
                            if existing.owner_user_id != user_id {
                                return Err(AdmissionError::Conflict(format!(
                                    "subdomain {label:?} is taken"
                                )));
                            }
                            if session_is_live(&st, &existing.client_id) {
                                return Err(AdmissionError::Conflict(format!(
                                    "subdomain {label:?} is active on another session"
                                )));
                            }
                            // Same user, dead session: evict and reassign.
                            evicted = remove_tunnel_locked(&mut st, &existing_id);
                        }
                        label
                    }
                    None => generate_label(&st)?,
                };

                for a in &req.host_aliases {
                    let alias = normalize_label(a)
                        .ok_or_else(|| AdmissionError::Invalid(format!("bad alias {a:?}")))?;
                    if alias == label || st.by_host.contains_key(&alias) {
                        return Err(AdmissionError::Conflict(format!("alias {alias:?} is taken")));
                    }
                    aliases.push(alias);
                }
                subdomain = label;
            }
            TunnelKind::Tcp => {
                public_port = alloc_port(&mut st.tcp_ports, req.desired_public_port)?;
            }
            TunnelKind::Udp => {
                public_port = alloc_port(&mut st.udp_ports, req.desired_public_port)?;
            }
        }

        let tunnel = Arc::new(Tunnel {
            id: Uuid::new_v4().to_string(),
            kind: req.kind,
            name: req.name,
            owner_user_id: user_id,
            client_id: req.client_id,
            created_at: SystemTime::now(),
            subdomain,
            host_aliases: aliases,
            public_port,
            local_port: req.local_port,
        });

        insert_tunnel_locked(&mut st, tunnel.clone());
        drop(st);

        telemetry::count_tunnel_open(&tunnel.kind.to_string());
        Ok(Admitted { tunnel, evicted })
    }

    /// Remove a tunnel by id regardless of requester; used for session
    /// teardown and for rolling back a failed listener bind.
    pub fn remove_tunnel(&self, id: &str) -> Option<Arc<Tunnel>> {
        let mut st = self.lock();
        remove_tunnel_locked(&mut st, id)
    }

    /// Close with authorization: only the owner or an admin may close.
    pub fn close_by_id(
        &self,
        id: &str,
        requesting_user: &str,
        admin: bool,
    ) -> Result<Arc<Tunnel>, CloseError> {
        let mut st = self.lock();
        let t = st.tunnels.get(id).cloned().ok_or(CloseError::NotFound)?;
        if !admin && t.owner_user_id != requesting_user {
            return Err(CloseError::Forbidden);
        }
        Ok(remove_tunnel_locked(&mut st, id).unwrap_or(t))
    }

    /// Host-label lookup for the HTTP router (subdomains and aliases).
    pub fn lookup_label(&self, label: &str) -> Option<Arc<Tunnel>> {
        let st = self.lock();
        let id = st.by_host.get(label)?;
        st.tunnels.get(id).cloned()
    }

    pub fn tunnel_by_id(&self, id: &str) -> Option<Arc<Tunnel>> {
        let st = self.lock();
        st.tunnels.get(id).cloned()
    }

    /// Clone out the owning session's transport handle so the caller can open
    /// a stream after the lock is released.
    pub fn session_for_tunnel(
        &self,
        tunnel_id: &str,
    ) -> Option<(Arc<Tunnel>, Arc<dyn TransportSession>)> {
        let st = self.lock();
        let t = st.tunnels.get(tunnel_id)?.clone();
        let sess = st.sessions.get(&t.client_id)?.sess.clone();
        if sess.is_closed() {
            return None;
        }
        Some((t, sess))
    }

    pub fn snapshot(&self) -> Vec<Arc<Tunnel>> {
        let st = self.lock();
        let mut out: Vec<Arc<Tunnel>> = st.tunnels.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn sessions_snapshot(&self) -> Vec<SessionInfo> {
        let st = self.lock();
        let mut out: Vec<SessionInfo> = st
            .sessions
            .iter()
            .map(|(cid, e)| SessionInfo {
                client_id: cid.clone(),
                user_id: e.user_id.clone(),
                version: e.version.clone(),
                started_at: e.started_at,
                last_recv_unix_ms: e.last_recv_unix_ms.load(Ordering::Relaxed),
                draining: e.draining,
                tunnels: st.by_client.get(cid).map(|s| s.len()).unwrap_or(0),
            })
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Free-port counts per range, for the operational surface.
    pub fn free_ports(&self) -> (usize, usize) {
        let st = self.lock();
        (st.tcp_ports.free_count(), st.udp_ports.free_count())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub client_id: String,
    pub user_id: String,
    pub version: String,
    #[serde(serialize_with = "ser_rfc3339")]
    pub started_at: SystemTime,
    pub last_recv_unix_ms: u64,
    pub draining: bool,
    pub tunnels: usize,
}

fn check_plan_limits(
    st: &State,
    user_id: &str,
    kind: TunnelKind,
    plan: &Plan,
) -> Result<(), AdmissionError> {
    let owned = st.by_user.get(user_id);
    let total = owned.map(|s| s.len()).unwrap_or(0);
    if total as u32 >= plan.max_tunnels {
        return Err(AdmissionError::Limit(format!(
            "plan allows {} concurrent tunnels",
            plan.max_tunnels
        )));
    }

    let per_kind_cap = match kind {
        TunnelKind::Http => plan.max_http,
        TunnelKind::Tcp => plan.max_tcp,
        TunnelKind::Udp => plan.max_udp,
    };
    let of_kind = owned
        .map(|s| {
            s.iter()
                .filter(|id| st.tunnels.get(*id).is_some_and(|t| t.kind == kind))
                .count()
        })
        .unwrap_or(0);
    if of_kind as u32 >= per_kind_cap {
        return Err(AdmissionError::Limit(format!(
            "plan allows {per_kind_cap} {kind} tunnels"
        )));
    }
    Ok(())
}

fn check_scope(plan: &Plan, label: &str) -> Result<(), AdmissionError> {
    if plan.subdomain_scope.is_empty() {
        return Ok(());
    }
    if plan.subdomain_scope.iter().any(|s| s == label) {
        return Ok(());
    }
    Err(AdmissionError::Forbidden(format!(
        "token is not scoped for subdomain {label:?}"
    )))
}

fn session_is_live(st: &State, client_id: &str) -> bool {
    let Some(e) = st.sessions.get(client_id) else {
        return false;
    };
    let last = e.last_recv_unix_ms.load(Ordering::Relaxed);
    telemetry::now_unix_ms().saturating_sub(last) <= SESSION_LIVENESS_MS
}

fn alloc_port(alloc: &mut PortAllocator, desired: Option<u16>) -> Result<u16, AdmissionError> {
    match alloc.alloc(desired) {
        Ok(p) => Ok(p),
        Err(PortError::Exhausted) => Err(AdmissionError::NoPorts),
        Err(PortError::Unavailable(p)) => {
            Err(AdmissionError::Conflict(format!("port {p} is taken")))
        }
        Err(PortError::OutOfRange(p)) => {
            Err(AdmissionError::Invalid(format!("port {p} is out of range")))
        }
    }
}

/// Lowercase DNS label: alphanumeric plus inner hyphens, at most 63 chars.
pub fn normalize_label(raw: &str) -> Option<String> {
    let label = raw.trim().to_ascii_lowercase();
    if label.is_empty() || label.len() > 63 {
        return None;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return None;
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return None;
    }
    Some(label)
}

fn generate_label(st: &State) -> Result<String, AdmissionError> {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    for _ in 0..GENERATED_LABEL_RETRIES {
        let label: String = (0..GENERATED_LABEL_LEN)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        if !st.by_host.contains_key(&label) {
            return Ok(label);
        }
    }
    Err(AdmissionError::Conflict(
        "could not find a free subdomain".into(),
    ))
}

fn insert_tunnel_locked(st: &mut State, t: Arc<Tunnel>) {
    match t.kind {
        TunnelKind::Http => {
            st.by_host.insert(t.subdomain.clone(), t.id.clone());
            for a in &t.host_aliases {
                st.by_host.insert(a.clone(), t.id.clone());
            }
        }
        TunnelKind::Tcp => {
            st.by_tcp_port.insert(t.public_port, t.id.clone());
        }
        TunnelKind::Udp => {
            st.by_udp_port.insert(t.public_port, t.id.clone());
        }
    }
    st.by_user
        .entry(t.owner_user_id.clone())
        .or_default()
        .insert(t.id.clone());
    st.by_client
        .entry(t.client_id.clone())
        .or_default()
        .insert(t.id.clone());
    st.tunnels.insert(t.id.clone(), t);
}

fn remove_tunnel_locked(st: &mut State, id: &str) -> Option<Arc<Tunnel>> {
    let t = st.tunnels.remove(id)?;

    match t.kind {
        TunnelKind::Http => {
            st.by_host.remove(&t.subdomain);
            for a in &t.host_aliases {
                st.by_host.remove(a);
            }
        }
        TunnelKind::Tcp => {
            st.by_tcp_port.remove(&t.public_port);
            st.tcp_ports.release(t.public_port);
        }
        TunnelKind::Udp => {
            st.by_udp_port.remove(&t.public_port);
            st.udp_ports.release(t.public_port);
        }
    }
    if let Some(s) = st.by_user.get_mut(&t.owner_user_id) {
        s.remove(id);
        if s.is_empty() {
            st.by_user.remove(&t.owner_user_id);
        }
    }
    if let Some(s) = st.by_client.get_mut(&t.client_id) {
        s.remove(id);
        if s.is_empty() {
            st.by_client.remove(&t.client_id);
        }
    }

    telemetry::count_tunnel_close(&t.kind.to_string());
    Some(t)
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeSession;
    use super::*;

    fn registry() -> Registry {
        Registry::new(
            "t.ex",
            PortAllocator::new(10000, 10001),
            PortAllocator::new(20000, 20001),
        )
    }

    fn live_clock() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(telemetry::now_unix_ms()))
    }

    fn http_req(client_id: &str, sub: Option<&str>) -> AdmitRequest {
        AdmitRequest {
            client_id: client_id.into(),
            kind: TunnelKind::Http,
            name: "web".into(),
            subdomain: sub.map(Into::into),
            host_aliases: vec![],
            local_port: 3000,
            desired_public_port: None,
        }
    }

    #[test]
    fn subdomain_conflict_between_users() {
        let r = registry();
        let c1 = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), live_clock());
        let c2 = r.add_session(None, "user2", "0.1.0", Arc::new(FakeSession), live_clock());

        r.admit(http_req(&c1, Some("app")), &Plan::default()).unwrap();
        let err = r
            .admit(http_req(&c2, Some("app")), &Plan::default())
            .unwrap_err();
        assert_eq!(err.code(), RejectCode::Conflict);
    }

    #[test]
    fn same_user_dead_session_is_evicted() {
        let r = registry();
        let stale = Arc::new(AtomicU64::new(
            telemetry::now_unix_ms() - SESSION_LIVENESS_MS - 1000,
        ));
        let c1 = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), stale);
        let old = r
            .admit(http_req(&c1, Some("app")), &Plan::default())
            .unwrap()
            .tunnel;

        let c2 = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), live_clock());
        let admitted = r.admit(http_req(&c2, Some("app")), &Plan::default()).unwrap();
        assert_eq!(admitted.tunnel.subdomain, "app");
        assert_eq!(admitted.evicted.unwrap().id, old.id);
        assert!(r.tunnel_by_id(&old.id).is_none());
    }

    #[test]
    fn generated_label_shape() {
        let r = registry();
        let c = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), live_clock());
        let t = r.admit(http_req(&c, None), &Plan::default()).unwrap().tunnel;
        assert_eq!(t.subdomain.len(), 8);
        assert!(t
            .subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(r.lookup_label(&t.subdomain).is_some());
    }

    #[test]
    fn tcp_ports_exhaust() {
        let r = registry();
        let c = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), live_clock());
        let mk = || AdmitRequest {
            client_id: c.clone(),
            kind: TunnelKind::Tcp,
            name: "ssh".into(),
            subdomain: None,
            host_aliases: vec![],
            local_port: 22,
            desired_public_port: None,
        };
        let a = r.admit(mk(), &Plan::default()).unwrap().tunnel;
        let b = r.admit(mk(), &Plan::default()).unwrap().tunnel;
        assert_eq!((a.public_port, b.public_port), (10000, 10001));
        let err = r.admit(mk(), &Plan::default()).unwrap_err();
        assert_eq!(err.code(), RejectCode::NoPorts);
    }

    #[test]
    fn close_by_id_requires_owner() {
        let r = registry();
        let c = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), live_clock());
        let t = r
            .admit(http_req(&c, Some("app")), &Plan::default())
            .unwrap()
            .tunnel;

        assert!(matches!(
            r.close_by_id(&t.id, "user2", false),
            Err(CloseError::Forbidden)
        ));
        r.close_by_id(&t.id, "user2", true).unwrap();
        assert!(r.tunnel_by_id(&t.id).is_none());
        assert!(r.lookup_label("app").is_none());
    }

    #[test]
    fn remove_session_drops_all_indexes() {
        let r = registry();
        let c = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), live_clock());
        r.admit(http_req(&c, Some("app")), &Plan::default()).unwrap();
        r.admit(
            AdmitRequest {
                client_id: c.clone(),
                kind: TunnelKind::Udp,
                name: "dns".into(),
                subdomain: None,
                host_aliases: vec![],
                local_port: 53,
                desired_public_port: None,
            },
            &Plan::default(),
        )
        .unwrap();

        let removed = r.remove_session(&c);
        assert_eq!(removed.len(), 2);
        assert!(r.lookup_label("app").is_none());
        assert_eq!(r.snapshot().len(), 0);
    }

    #[test]
    fn plan_limits_enforced() {
        let r = registry();
        let c = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), live_clock());
        let plan = Plan {
            max_tunnels: 1,
            ..Plan::default()
        };
        r.admit(http_req(&c, Some("one")), &plan).unwrap();
        let err = r.admit(http_req(&c, Some("two")), &plan).unwrap_err();
        assert_eq!(err.code(), RejectCode::Limit);
    }

    #[test]
    fn scope_restriction() {
        let r = registry();
        let c = r.add_session(None, "user1", "0.1.0", Arc::new(FakeSession), live_clock());
        let plan = Plan {
            subdomain_scope: vec!["mine".into()],
            ..Plan::default()
        };
        assert!(r.admit(http_req(&c, Some("mine")), &plan).is_ok());
        let err = r.admit(http_req(&c, Some("other")), &plan).unwrap_err();
        assert_eq!(err.code(), RejectCode::Forbidden);
    }

    #[test]
    fn label_normalization() {
        assert_eq!(normalize_label(" App "), Some("app".into()));
        assert_eq!(normalize_label("my-app2"), Some("my-app2".into()));
        assert_eq!(normalize_label("-bad"), None);
        assert_eq!(normalize_label("has space"), None);
        assert_eq!(normalize_label(""), None);
    }
}
