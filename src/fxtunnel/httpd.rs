use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

use crate::fxtunnel::{
    domains::CustomDomains,
    inspect::{ExchangeCapture, Inspector},
    limits::RateLimiter,
    net,
    protocol::{self, StreamHeader},
    registry::{Registry, Tunnel},
    telemetry,
};

const SKIP_COOKIE: &str = "fxtunnel_ack";

pub struct HttpdOptions {
    pub listen_addr: String,
    pub registry: Arc<Registry>,
    pub domains: Arc<CustomDomains>,
    pub ip_limiter: Arc<RateLimiter>,
    pub inspector: Arc<Inspector>,
    /// Serve the warning page to browsers that have not acknowledged a tunnel.
    pub interstitial: bool,
    pub max_header_bytes: usize,
    /// Deadline for reading a request head / relaying response headers.
    pub header_timeout: Duration,
    /// Idle-read limit on the downstream socket between keep-alive requests.
    pub idle_timeout: Duration,
}

impl HttpdOptions {
    pub fn defaults(
        listen_addr: String,
        registry: Arc<Registry>,
        domains: Arc<CustomDomains>,
        ip_limiter: Arc<RateLimiter>,
        inspector: Arc<Inspector>,
    ) -> Self {
        Self {
            listen_addr,
            registry,
            domains,
            ip_limiter,
            inspector,
            interstitial: false,
            max_header_bytes: 64 * 1024,
            header_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

pub async fn serve_http_with_shutdown(
    opts: HttpdOptions,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(&opts.listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("httpd: bind {}", opts.listen_addr))?;

    tracing::info!(listen_addr = %opts.listen_addr, base = %opts.registry.base_domain(), "httpd: listening");

    let opts = Arc::new(opts);
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let opts = opts.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(opts, conn, peer).await {
                        tracing::debug!(client = %peer, err = %err, "httpd: connection ended");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_conn(
    st: Arc<HttpdOptions>,
    mut conn: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    let mut first = true;

    loop {
        let wait = if first { st.header_timeout } else { st.idle_timeout };
        first = false;

        let (head, head_len) =
            match read_request_head(&mut conn, &mut pending, st.max_header_bytes, wait).await {
                Ok(Some(parsed)) => parsed,
                Ok(None) => return Ok(()),
                Err(err) => {
                    if err.downcast_ref::<httparse::Error>().is_some() {
                        respond_simple(&mut conn, 400, "Bad Request", "malformed request\n", false)
                            .await?;
                        return Ok(());
                    }
                    return Err(err);
                }
            };
        pending.drain(..head_len);

        match handle_request(&st, &mut conn, &mut pending, peer, head).await? {
            Outcome::KeepAlive => continue,
            Outcome::Close => return Ok(()),
        }
    }
}

enum Outcome {
    KeepAlive,
    Close,
}

async fn handle_request(
    st: &HttpdOptions,
    conn: &mut TcpStream,
    pending: &mut Vec<u8>,
    peer: SocketAddr,
    head: RequestHead,
) -> anyhow::Result<Outcome> {
    if !st.ip_limiter.allow(&peer.ip().to_string()) {
        telemetry::count_request(429);
        respond_simple(conn, 429, "Too Many Requests", "rate limited\n", true).await?;
        return Ok(Outcome::KeepAlive);
    }

    let host = head
        .header("host")
        .map(strip_port)
        .unwrap_or_default()
        .to_ascii_lowercase();

    let tunnel = resolve_host(st, &host);
    let Some(tunnel) = tunnel else {
        telemetry::count_request(404);
        respond_not_found(conn, &host, head.accepts_html()).await?;
        return Ok(Outcome::KeepAlive);
    };

    if st.interstitial
        && head.method == "GET"
        && head.accepts_html()
        && !has_skip_cookie(&head)
    {
        telemetry::count_request(200);
        respond_interstitial(conn, &host, st.registry.base_domain()).await?;
        return Ok(Outcome::KeepAlive);
    }

    proxy_exchange(st, conn, pending, peer, head, tunnel).await
}

/// Lookup order: verified custom domain, then the bare base domain (falls
/// through to the branded 404), then a single wildcard label.
fn resolve_host(st: &HttpdOptions, host: &str) -> Option<Arc<Tunnel>> {
    if host.is_empty() {
        return None;
    }

    if let Some(label) = st.domains.resolve(host) {
        if let Some(t) = st.registry.lookup_label(&label) {
            return Some(t);
        }
    }

    let base = st.registry.base_domain();
    if host == base {
        return None;
    }

    let label = host.strip_suffix(base)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    st.registry.lookup_label(label)
}

async fn proxy_exchange(
    st: &HttpdOptions,
    conn: &mut TcpStream,
    pending: &mut Vec<u8>,
    peer: SocketAddr,
    head: RequestHead,
    tunnel: Arc<Tunnel>,
) -> anyhow::Result<Outcome> {
    let Some((tunnel, sess)) = st.registry.session_for_tunnel(&tunnel.id) else {
        telemetry::count_request(502);
        respond_simple(conn, 502, "Bad Gateway", "tunnel is gone\n", false).await?;
        return Ok(Outcome::Close);
    };

    let mut stream = match sess.open_stream().await {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(tunnel = %tunnel.id, err = %err, "httpd: open stream failed");
            telemetry::count_request(502);
            respond_simple(conn, 502, "Bad Gateway", "tunnel unavailable\n", false).await?;
            return Ok(Outcome::Close);
        }
    };

    let hdr = StreamHeader {
        tunnel_id: tunnel.id.clone(),
        remote_addr: Some(peer.to_string()),
        meta: [("host".to_string(), head.host_raw().unwrap_or_default())]
            .into_iter()
            .collect(),
    };
    protocol::write_stream_header(&mut stream, &hdr).await?;

    let mut capture = if st.inspector.enabled() {
        let mut c = ExchangeCapture::new(&tunnel.id, &peer.to_string(), st.inspector.body_cap());
        c.request_line(&head.method, &head.target);
        c.request_headers(&head.headers);
        Some(c)
    } else {
        None
    };

    let out_head = rewrite_request_head(&head, peer);
    stream.write_all(&out_head).await?;

    // Upgrades hijack the connection: after the request head, bytes are copied
    // raw in both directions; the 101 flows back through the same stream.
    if head.wants_upgrade() {
        if !pending.is_empty() {
            stream.write_all(pending).await?;
            pending.clear();
        }
        stream.flush().await?;

        if let Some(mut c) = capture.take() {
            c.response_head(101, &[]);
            st.inspector.record(&tunnel.owner_user_id, c.finish());
        }

        let copied = tokio::io::copy_bidirectional(conn, &mut stream).await;
        if let Ok((up, down)) = copied {
            telemetry::count_bytes_in(&tunnel.id, up);
            telemetry::count_bytes_out(&tunnel.id, down);
        }
        telemetry::count_request(101);
        return Ok(Outcome::Close);
    }

    let mut req_keep_alive = head.keep_alive();
    let mut rd_down = Prefixed::new(std::mem::take(pending), conn);

    // Forward the request body.
    let req_bytes = match head.body_framing() {
        BodyFraming::Length(n) => {
            relay_exact(&mut rd_down, &mut stream, n, |chunk| {
                if let Some(c) = capture.as_mut() {
                    c.request_body_chunk(chunk);
                }
            })
            .await?;
            n
        }
        BodyFraming::Chunked => {
            relay_chunked(&mut rd_down, &mut stream, st.max_header_bytes, |chunk| {
                if let Some(c) = capture.as_mut() {
                    c.request_body_chunk(chunk);
                }
            })
            .await?
        }
        BodyFraming::None => 0,
    };
    telemetry::count_bytes_in(&tunnel.id, req_bytes);

    // Hand leftover pipelined bytes back for the next request on this socket.
    *pending = rd_down.into_prefix();

    // Half-close toward the agent: the request is complete, the response comes
    // back on the same stream until EOF.
    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);
    stream_wr.shutdown().await?;

    // Response head, bounded by the header deadline.
    let mut rbuf: Vec<u8> = Vec::new();
    let (resp, resp_head_len) = match read_response_head(
        &mut stream_rd,
        &mut rbuf,
        st.max_header_bytes,
        st.header_timeout,
    )
    .await
    {
        Ok(Some(parsed)) => parsed,
        Err(err) if err.downcast_ref::<httparse::Error>().is_some() => {
            telemetry::count_request(502);
            respond_simple(conn, 502, "Bad Gateway", "origin sent garbage\n", false).await?;
            return Ok(Outcome::Close);
        }
        Ok(None) | Err(_) => {
            telemetry::count_request(502);
            respond_simple(conn, 502, "Bad Gateway", "origin sent no response\n", false).await?;
            return Ok(Outcome::Close);
        }
    };

    let resp_head_raw = rbuf[..resp_head_len].to_vec();
    rbuf.drain(..resp_head_len);

    if let Some(c) = capture.as_mut() {
        c.response_head(resp.status, &resp.headers);
    }

    // Close-delimited responses force the downstream connection shut once the
    // stream drains.
    let head_is_headless = head.method == "HEAD";
    let body = if head_is_headless {
        BodyFraming::None
    } else {
        resp.body_framing()
    };
    let close_delimited = matches!(body, BodyFraming::None)
        && !head_is_headless
        && !status_forbids_body(resp.status)
        && resp.header("content-length").is_none()
        && !resp.is_chunked();

    let downstream_head = if close_delimited || !req_keep_alive {
        req_keep_alive = false;
        rewrite_response_head_close(&resp_head_raw)
    } else {
        resp_head_raw.clone()
    };
    conn.write_all(&downstream_head).await?;

    let mut resp_bytes = 0u64;
    let mut rd_up = Prefixed::new(rbuf, &mut stream_rd);
    match body {
        BodyFraming::Length(n) => {
            relay_exact(&mut rd_up, conn, n, |chunk| {
                if let Some(c) = capture.as_mut() {
                    c.response_body_chunk(chunk);
                }
            })
            .await?;
            resp_bytes = n;
        }
        BodyFraming::Chunked | BodyFraming::None => {
            // Chunked is self-delimiting for the downstream client; relay raw
            // until the agent half-closes. Close-delimited bodies end the same
            // way and the downstream was already marked Connection: close.
            if !(status_forbids_body(resp.status) || head_is_headless) {
                resp_bytes = relay_until_eof(&mut rd_up, conn, |chunk| {
                    if let Some(c) = capture.as_mut() {
                        c.response_body_chunk(chunk);
                    }
                })
                .await?;
            }
        }
    }
    conn.flush().await?;
    telemetry::count_bytes_out(&tunnel.id, resp_bytes);
    telemetry::count_request(resp.status);

    if let Some(c) = capture.take() {
        st.inspector.record(&tunnel.owner_user_id, c.finish());
    }

    if req_keep_alive && !close_delimited {
        Ok(Outcome::KeepAlive)
    } else {
        Ok(Outcome::Close)
    }
}

fn status_forbids_body(status: u16) -> bool {
    matches!(status, 100..=199 | 204 | 304)
}

// --- request/response head parsing ---------------------------------------

/// Generous bound on header count; httparse rejects anything beyond it.
const MAX_HEADERS: usize = 64;

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    /// HTTP/1.x minor version as parsed.
    pub minor_version: u8,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    fn host_raw(&self) -> Option<String> {
        self.header("host").map(str::to_string)
    }

    fn accepts_html(&self) -> bool {
        self.header("accept")
            .is_some_and(|a| a.to_ascii_lowercase().contains("text/html"))
    }

    fn wants_upgrade(&self) -> bool {
        self.header("connection")
            .is_some_and(|c| c.to_ascii_lowercase().contains("upgrade"))
            && self.header("upgrade").is_some()
    }

    fn keep_alive(&self) -> bool {
        let conn = self
            .header("connection")
            .map(|c| c.to_ascii_lowercase())
            .unwrap_or_default();
        if conn.contains("close") {
            return false;
        }
        if self.minor_version == 0 {
            return conn.contains("keep-alive");
        }
        true
    }

    fn body_framing(&self) -> BodyFraming {
        framing_of(&self.headers)
    }
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    fn body_framing(&self) -> BodyFraming {
        if status_forbids_body(self.status) {
            return BodyFraming::None;
        }
        framing_of(&self.headers)
    }
}

fn framing_of(headers: &[(String, String)]) -> BodyFraming {
    if header_get(headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return BodyFraming::Chunked;
    }
    if let Some(cl) = header_get(headers, "content-length") {
        if let Ok(n) = cl.trim().parse::<u64>() {
            return BodyFraming::Length(n);
        }
    }
    BodyFraming::None
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub(crate) fn strip_port(host: &str) -> String {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal.
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match host.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !h.is_empty() => h.to_string(),
        _ => host.to_string(),
    }
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

/// Try to parse a request head from the buffered bytes. Ok(None) means more
/// bytes are needed; a parse error carries `httparse::Error` for the caller
/// to turn into a 400.
pub(crate) fn probe_request(buf: &[u8]) -> anyhow::Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => {
            let head = RequestHead {
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or_default().to_string(),
                minor_version: req.version.unwrap_or(1),
                headers: owned_headers(req.headers),
            };
            Ok(Some((head, n)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)),
    }
}

fn probe_response(buf: &[u8]) -> anyhow::Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => {
            let head = ResponseHead {
                status: resp.code.unwrap_or_default(),
                headers: owned_headers(resp.headers),
            };
            Ok(Some((head, n)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(anyhow::Error::new(e)),
    }
}

/// Accumulate into `buf` until httparse sees a full request head. Ok(None)
/// means a clean EOF before any bytes arrived.
async fn read_request_head<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
    wait: Duration,
) -> anyhow::Result<Option<(RequestHead, usize)>> {
    let fut = async {
        let mut tmp = vec![0u8; 8 * 1024];
        loop {
            if !buf.is_empty() {
                if let Some(parsed) = probe_request(buf)? {
                    return Ok(Some(parsed));
                }
            }
            if buf.len() > max {
                anyhow::bail!("httpd: header block exceeds {max} bytes");
            }
            let n = r.read(&mut tmp).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                anyhow::bail!("httpd: eof inside header block");
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    };

    match time::timeout(wait, fut).await {
        Ok(v) => v,
        Err(_) => anyhow::bail!("httpd: header read timed out"),
    }
}

async fn read_response_head<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
    wait: Duration,
) -> anyhow::Result<Option<(ResponseHead, usize)>> {
    let fut = async {
        let mut tmp = vec![0u8; 8 * 1024];
        loop {
            if !buf.is_empty() {
                if let Some(parsed) = probe_response(buf)? {
                    return Ok(Some(parsed));
                }
            }
            if buf.len() > max {
                anyhow::bail!("httpd: response head exceeds {max} bytes");
            }
            let n = r.read(&mut tmp).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                anyhow::bail!("httpd: eof inside response head");
            }
            buf.extend_from_slice(&tmp[..n]);
        }
    };

    match time::timeout(wait, fut).await {
        Ok(v) => v,
        Err(_) => anyhow::bail!("httpd: response head read timed out"),
    }
}

/// Re-emit the request head with forwarding headers injected. The Host header
/// is preserved so the origin sees the public name.
fn rewrite_request_head(head: &RequestHead, peer: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!(
            "{} {} HTTP/1.{}\r\n",
            head.method, head.target, head.minor_version
        )
        .as_bytes(),
    );

    let client_ip = peer.ip().to_string();
    let mut wrote_xff = false;
    for (k, v) in &head.headers {
        if k.eq_ignore_ascii_case("x-forwarded-for") {
            out.extend_from_slice(format!("X-Forwarded-For: {v}, {client_ip}\r\n").as_bytes());
            wrote_xff = true;
        } else if k.eq_ignore_ascii_case("x-forwarded-proto") {
            // Replaced below.
        } else {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
    }
    if !wrote_xff {
        out.extend_from_slice(format!("X-Forwarded-For: {client_ip}\r\n").as_bytes());
    }
    out.extend_from_slice(b"X-Forwarded-Proto: http\r\n");
    out.extend_from_slice(b"\r\n");
    out
}

/// Rewrite a raw response head to carry `Connection: close`.
fn rewrite_response_head_close(raw: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    let mut out = Vec::with_capacity(raw.len() + 32);
    for (i, line) in text.split("\r\n").enumerate() {
        if line.is_empty() {
            break;
        }
        if i > 0 && line.to_ascii_lowercase().starts_with("connection:") {
            continue;
        }
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}

fn has_skip_cookie(head: &RequestHead) -> bool {
    head.header("cookie").is_some_and(|c| {
        c.split(';')
            .any(|kv| kv.trim().strip_prefix(SKIP_COOKIE).is_some_and(|rest| {
                rest.trim_start().starts_with('=')
            }))
    })
}

// --- canned responses ------------------------------------------------------

async fn respond_simple<W: AsyncWrite + Unpin>(
    conn: &mut W,
    status: u16,
    reason: &str,
    body: &str,
    keep_alive: bool,
) -> anyhow::Result<()> {
    let conn_hdr = if keep_alive { "keep-alive" } else { "close" };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: {conn_hdr}\r\n\r\n",
        body.len()
    );
    conn.write_all(head.as_bytes()).await?;
    conn.write_all(body.as_bytes()).await?;
    conn.flush().await?;
    Ok(())
}

async fn respond_not_found<W: AsyncWrite + Unpin>(
    conn: &mut W,
    host: &str,
    html: bool,
) -> anyhow::Result<()> {
    if !html {
        let body = format!("fxtunnel: no tunnel for host {host:?}\n");
        return respond_simple(conn, 404, "Not Found", &body, true).await;
    }

    let body = format!(
        "<!doctype html><html><head><title>fxtunnel</title></head><body>\
         <h1>404 &mdash; tunnel not found</h1>\
         <p>No active tunnel answers to <code>{host}</code>. It may have \
         disconnected, or the address may be mistyped.</p>\
         </body></html>"
    );
    let head = format!(
        "HTTP/1.1 404 Not Found\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        body.len()
    );
    conn.write_all(head.as_bytes()).await?;
    conn.write_all(body.as_bytes()).await?;
    conn.flush().await?;
    Ok(())
}

async fn respond_interstitial<W: AsyncWrite + Unpin>(
    conn: &mut W,
    host: &str,
    base_domain: &str,
) -> anyhow::Result<()> {
    let body = format!(
        "<!doctype html><html><head><title>fxtunnel warning</title></head><body>\
         <h1>You are about to visit {host}</h1>\
         <p>This site is served through an fxtunnel tunnel operated by a third \
         party. Do not enter credentials unless you trust the operator.</p>\
         <p><a href=\"/\">Continue</a></p>\
         </body></html>"
    );
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nSet-Cookie: {SKIP_COOKIE}=1; Domain=.{base_domain}; Path=/; Max-Age=86400\r\nConnection: keep-alive\r\n\r\n",
        body.len()
    );
    conn.write_all(head.as_bytes()).await?;
    conn.write_all(body.as_bytes()).await?;
    conn.flush().await?;
    Ok(())
}

// --- body relays -----------------------------------------------------------

/// Reader with a consumed-first prefix of already-buffered bytes.
struct Prefixed<'a, R> {
    pre: Vec<u8>,
    inner: &'a mut R,
}

impl<'a, R: AsyncRead + Unpin> Prefixed<'a, R> {
    fn new(pre: Vec<u8>, inner: &'a mut R) -> Self {
        Self { pre, inner }
    }

    fn into_prefix(self) -> Vec<u8> {
        self.pre
    }

    async fn read_some(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if !self.pre.is_empty() {
            let n = out.len().min(self.pre.len());
            out[..n].copy_from_slice(&self.pre[..n]);
            self.pre.drain(..n);
            return Ok(n);
        }
        self.inner.read(out).await
    }

    /// Grow the prefix by one read from the inner source.
    async fn fill(&mut self) -> std::io::Result<usize> {
        let mut tmp = vec![0u8; 8 * 1024];
        let n = self.inner.read(&mut tmp).await?;
        self.pre.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    /// Read one CRLF-terminated line, returned without the terminator.
    async fn read_line(&mut self, max: usize) -> anyhow::Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.pre.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.pre.drain(..pos + 2).collect();
                return Ok(line[..pos].to_vec());
            }
            if self.pre.len() > max {
                anyhow::bail!("httpd: line exceeds {max} bytes");
            }
            if self.fill().await? == 0 {
                anyhow::bail!("httpd: eof inside line");
            }
        }
    }
}

async fn relay_exact<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    rd: &mut Prefixed<'_, R>,
    wr: &mut W,
    total: u64,
    mut tee: impl FnMut(&[u8]),
) -> anyhow::Result<()> {
    let mut left = total;
    let mut buf = vec![0u8; 32 * 1024];
    while left > 0 {
        let want = buf.len().min(left as usize);
        let n = rd.read_some(&mut buf[..want]).await?;
        if n == 0 {
            anyhow::bail!("httpd: eof with {left} body bytes missing");
        }
        tee(&buf[..n]);
        wr.write_all(&buf[..n]).await?;
        left -= n as u64;
    }
    wr.flush().await?;
    Ok(())
}

async fn relay_until_eof<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    rd: &mut Prefixed<'_, R>,
    wr: &mut W,
    mut tee: impl FnMut(&[u8]),
) -> anyhow::Result<u64> {
    let mut buf = vec![0u8; 32 * 1024];
    let mut total = 0u64;
    loop {
        let n = rd.read_some(&mut buf).await?;
        if n == 0 {
            break;
        }
        tee(&buf[..n]);
        wr.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    wr.flush().await?;
    Ok(total)
}

/// Relay a chunked body verbatim while teeing the decoded chunk data.
/// Returns the decoded byte count.
async fn relay_chunked<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    rd: &mut Prefixed<'_, R>,
    wr: &mut W,
    max_line: usize,
    mut tee: impl FnMut(&[u8]),
) -> anyhow::Result<u64> {
    let mut decoded = 0u64;
    loop {
        let line = rd.read_line(max_line).await?;
        let size_text = std::str::from_utf8(&line)
            .ok()
            .map(|s| s.split(';').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();
        let size = u64::from_str_radix(&size_text, 16)
            .map_err(|_| anyhow::anyhow!("httpd: bad chunk size {size_text:?}"))?;

        wr.write_all(&line).await?;
        wr.write_all(b"\r\n").await?;

        if size == 0 {
            // Trailers through the final empty line.
            loop {
                let t = rd.read_line(max_line).await?;
                wr.write_all(&t).await?;
                wr.write_all(b"\r\n").await?;
                if t.is_empty() {
                    break;
                }
            }
            break;
        }

        relay_exact(rd, wr, size, &mut tee).await?;
        decoded += size;

        let sep = rd.read_line(max_line).await?;
        if !sep.is_empty() {
            anyhow::bail!("httpd: chunk not followed by CRLF");
        }
        wr.write_all(b"\r\n").await?;
    }
    wr.flush().await?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        probe_request(raw.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn parses_request_head() {
        let raw = "GET /hi HTTP/1.1\r\nHost: app.t.ex:8080\r\nAccept: */*\r\n\r\n";
        let (h, n) = probe_request(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(n, raw.len());
        assert_eq!(h.method, "GET");
        assert_eq!(h.target, "/hi");
        assert_eq!(h.minor_version, 1);
        assert_eq!(h.header("host"), Some("app.t.ex:8080"));
        assert!(h.keep_alive());
        assert!(!h.accepts_html());
    }

    #[test]
    fn partial_head_needs_more_bytes() {
        assert!(probe_request(b"GET /hi HTTP/1.1\r\nHost: a").unwrap().is_none());
    }

    #[test]
    fn malformed_head_is_a_parse_error() {
        let err = probe_request(b"\x00garbage\r\n\r\n").unwrap_err();
        assert!(err.downcast_ref::<httparse::Error>().is_some());
    }

    #[test]
    fn http10_defaults_to_close_without_keep_alive() {
        let h = head("GET / HTTP/1.0\r\nHost: a\r\n\r\n");
        assert_eq!(h.minor_version, 0);
        assert!(!h.keep_alive());
        let h = head("GET / HTTP/1.0\r\nHost: a\r\nConnection: keep-alive\r\n\r\n");
        assert!(h.keep_alive());
    }

    #[test]
    fn parses_response_head() {
        let raw = b"HTTP/1.1 204 No Content\r\nServer: test\r\n\r\n";
        let (r, n) = probe_response(raw).unwrap().unwrap();
        assert_eq!(n, raw.len());
        assert_eq!(r.status, 204);
        assert_eq!(r.header("server"), Some("test"));
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("app.t.ex:8080"), "app.t.ex");
        assert_eq!(strip_port("app.t.ex"), "app.t.ex");
        assert_eq!(strip_port("[::1]:8080"), "::1");
    }

    #[test]
    fn upgrade_detection() {
        let h = head(
            "GET /ws HTTP/1.1\r\nHost: a.t.ex\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        assert!(h.wants_upgrade());
    }

    #[test]
    fn body_framing_priority() {
        let h = head(
            "POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nContent-Length: 10\r\n\r\n",
        );
        assert_eq!(h.body_framing(), BodyFraming::Chunked);

        let h = head("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(h.body_framing(), BodyFraming::Length(10));
    }

    #[test]
    fn xff_appended_and_proto_set() {
        let h = head("GET / HTTP/1.1\r\nHost: a\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n");
        let peer: SocketAddr = "203.0.113.7:9999".parse().unwrap();
        let out = String::from_utf8(rewrite_request_head(&h, peer)).unwrap();
        assert!(out.contains("X-Forwarded-For: 10.0.0.1, 203.0.113.7\r\n"));
        assert!(out.contains("X-Forwarded-Proto: http\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn skip_cookie_detected() {
        let h = head("GET / HTTP/1.1\r\nHost: a\r\nCookie: other=2; fxtunnel_ack=1\r\n\r\n");
        assert!(has_skip_cookie(&h));
        let h = head("GET / HTTP/1.1\r\nHost: a\r\nCookie: fxtunnel_ackx=1\r\n\r\n");
        assert!(!has_skip_cookie(&h));
    }

    #[test]
    fn response_head_close_rewrite() {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Type: text/plain\r\n\r\n";
        let out = String::from_utf8(rewrite_response_head_close(raw)).unwrap();
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("keep-alive"));
    }

    #[tokio::test]
    async fn chunked_relay_preserves_wire_and_decodes() {
        let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec();
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            a.write_all(&wire).await.unwrap();
        });

        let mut out = Vec::new();
        let mut decoded = Vec::new();
        let mut rd = Prefixed::new(Vec::new(), &mut b);
        let n = relay_chunked(&mut rd, &mut out, 1024, |c| decoded.extend_from_slice(c))
            .await
            .unwrap();

        assert_eq!(n, 9);
        assert_eq!(decoded, b"Wikipedia");
        assert_eq!(out, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn proxies_a_request_through_the_tunnel() {
        use std::sync::atomic::AtomicU64;

        use crate::fxtunnel::{
            ports::PortAllocator,
            protocol::{Plan, TunnelKind},
            registry::{AdmitRequest, test_support::pipe_session_pair},
        };

        let registry = Arc::new(Registry::new(
            "t.ex",
            PortAllocator::empty(),
            PortAllocator::empty(),
        ));
        let (srv, cli) = pipe_session_pair();
        let clock = Arc::new(AtomicU64::new(telemetry::now_unix_ms()));
        let cid = registry.add_session(None, "user1", "0.1.0", srv, clock);
        let admitted = registry
            .admit(
                AdmitRequest {
                    client_id: cid,
                    kind: TunnelKind::Http,
                    name: "web".into(),
                    subdomain: Some("app".into()),
                    host_aliases: vec![],
                    local_port: 3000,
                    desired_public_port: None,
                },
                &Plan::default(),
            )
            .unwrap();
        let tunnel_id = admitted.tunnel.id.clone();

        // Fake agent: receive the stream, check the header, play origin.
        let expect_id = tunnel_id.clone();
        tokio::spawn(async move {
            let mut st = cli.accept_stream().await.unwrap();
            let hdr = protocol::read_stream_header(&mut st).await.unwrap();
            assert_eq!(hdr.tunnel_id, expect_id);

            // The proxy half-closes after the request; drain it fully.
            let mut req = Vec::new();
            st.read_to_end(&mut req).await.unwrap();
            let text = String::from_utf8_lossy(&req);
            assert!(text.starts_with("GET /hi HTTP/1.1\r\n"));
            assert!(text.contains("X-Forwarded-For:"));

            st.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            st.shutdown().await.unwrap();
        });

        let opts = Arc::new(HttpdOptions::defaults(
            "127.0.0.1:0".into(),
            registry.clone(),
            Arc::new(CustomDomains::default()),
            Arc::new(RateLimiter::new(0.0, 1.0)),
            Arc::new(Inspector::new(true, 16, 4096, None)),
        ));

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), ln.accept());
        let mut client = client.unwrap();
        let (server_conn, peer) = accepted.unwrap();

        let opts2 = opts.clone();
        tokio::spawn(async move {
            let _ = handle_conn(opts2, server_conn, peer).await;
        });

        client
            .write_all(b"GET /hi HTTP/1.1\r\nHost: app.t.ex:8080\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        client.read_to_end(&mut resp).await.unwrap();
        let text = String::from_utf8_lossy(&resp);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.ends_with("ok"), "got: {text}");

        // The exchange landed in the tunnel's capture ring.
        let ring = opts.inspector.ring_if_exists(&tunnel_id).unwrap();
        assert_eq!(ring.len(), 1);
        let e = &ring.list(0, 1)[0];
        assert_eq!(e.status, 200);
        assert_eq!(e.response_body, b"ok");
    }

    #[tokio::test]
    async fn unknown_host_gets_branded_404() {
        use crate::fxtunnel::ports::PortAllocator;

        let registry = Arc::new(Registry::new(
            "t.ex",
            PortAllocator::empty(),
            PortAllocator::empty(),
        ));
        let opts = Arc::new(HttpdOptions::defaults(
            "127.0.0.1:0".into(),
            registry,
            Arc::new(CustomDomains::default()),
            Arc::new(RateLimiter::new(0.0, 1.0)),
            Arc::new(Inspector::new(false, 16, 4096, None)),
        ));

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), ln.accept());
        let mut client = client.unwrap();
        let (server_conn, peer) = accepted.unwrap();
        tokio::spawn(async move {
            let _ = handle_conn(opts, server_conn, peer).await;
        });

        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: nosuch.t.ex\r\n\r\n")
            .await
            .unwrap();

        let mut got = Vec::new();
        let mut tmp = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !String::from_utf8_lossy(&got).contains("no tunnel for host") {
            assert!(tokio::time::Instant::now() < deadline);
            let n = client.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed early: {:?}", String::from_utf8_lossy(&got));
            got.extend_from_slice(&tmp[..n]);
        }
        assert!(String::from_utf8_lossy(&got).starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn read_request_head_rejects_oversize() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            // A never-ending method token keeps the parser partial.
            let junk = vec![b'a'; 100_000];
            let _ = a.write_all(&junk).await;
        });
        let mut buf = Vec::new();
        let err = read_request_head(&mut b, &mut buf, 64 * 1024, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
