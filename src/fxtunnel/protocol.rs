use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single framed control message (length prefix excluded).
pub const MAX_CONTROL_FRAME_BYTES: u32 = 1 << 20; // 1 MiB

/// Session close codes. Conveyed through `Goodbye.reason` / `AuthResult.reason`
/// on the control channel; the transport itself carries no code.
pub const CLOSE_PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
pub const CLOSE_UPGRADE_REQUIRED: &str = "UPGRADE_REQUIRED";
pub const CLOSE_UNAUTHENTICATED: &str = "UNAUTHENTICATED";
pub const CLOSE_RATE_LIMITED: &str = "RATE_LIMITED";

/// Stream close code reported by the client when the local origin cannot be
/// dialed.
pub const CLOSE_ORIGIN_UNREACHABLE: &str = "ORIGIN_UNREACHABLE";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("message has no kind field")]
    MissingKind,
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether the error must tear the whole session down (any control-channel
    /// decode or framing failure) as opposed to being local to one stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Io(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Http,
    Tcp,
    Udp,
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelKind::Http => write!(f, "http"),
            TunnelKind::Tcp => write!(f, "tcp"),
            TunnelKind::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    Conflict,
    NoPorts,
    Forbidden,
    Limit,
    Invalid,
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectCode::Conflict => write!(f, "CONFLICT"),
            RejectCode::NoPorts => write!(f, "NO_PORTS"),
            RejectCode::Forbidden => write!(f, "FORBIDDEN"),
            RejectCode::Limit => write!(f, "LIMIT"),
            RejectCode::Invalid => write!(f, "INVALID"),
        }
    }
}

/// Per-user policy snapshot delivered in `AuthResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: u32,
    #[serde(default = "default_max_per_kind")]
    pub max_http: u32,
    #[serde(default = "default_max_per_kind")]
    pub max_tcp: u32,
    #[serde(default = "default_max_per_kind")]
    pub max_udp: u32,
    /// When non-empty, the presenting token may only claim these subdomains.
    #[serde(default)]
    pub subdomain_scope: Vec<String>,
    #[serde(default)]
    pub inspect: bool,
}

fn default_max_tunnels() -> u32 {
    8
}

fn default_max_per_kind() -> u32 {
    8
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            max_tunnels: default_max_tunnels(),
            max_http: default_max_per_kind(),
            max_tcp: default_max_per_kind(),
            max_udp: default_max_per_kind(),
            subdomain_scope: Vec::new(),
            inspect: false,
        }
    }
}

/// Control channel envelope. One JSON object per frame, discriminated by the
/// `kind` field. Unknown fields inside a known kind are ignored for forward
/// compatibility; an unknown kind is fatal to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello {
        v: String,
        #[serde(default)]
        caps: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    HelloAck {
        v: String,
        min_v: String,
        #[serde(default)]
        caps: Vec<String>,
    },
    Auth {
        token: String,
    },
    AuthResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan: Option<Plan>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TunnelRequest {
        req_id: String,
        kind: TunnelKind,
        #[serde(default)]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default)]
        host_aliases: Vec<String>,
        local_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        desired_public_port: Option<u16>,
    },
    TunnelAccept {
        req_id: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_port: Option<u16>,
    },
    TunnelReject {
        req_id: String,
        code: RejectCode,
        message: String,
    },
    TunnelClose {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Ping {
        ts: String,
    },
    Pong {
        ts: String,
    },
    Goodbye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

const KNOWN_KINDS: &[&str] = &[
    "hello",
    "hello_ack",
    "auth",
    "auth_result",
    "tunnel_request",
    "tunnel_accept",
    "tunnel_reject",
    "tunnel_close",
    "ping",
    "pong",
    "goodbye",
];

/// First framed payload on any data stream, declaring which tunnel the stream
/// belongs to. Framed exactly like a control message, exactly once, before any
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

pub fn rfc3339_now() -> String {
    humantime::format_rfc3339_millis(std::time::SystemTime::now()).to_string()
}

pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(msg)?;
    frame(body)
}

pub fn decode_message(body: &[u8]) -> Result<ControlMessage, ProtocolError> {
    let v: serde_json::Value = serde_json::from_slice(body)?;
    let kind = v
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or(ProtocolError::MissingKind)?;
    if !KNOWN_KINDS.contains(&kind) {
        return Err(ProtocolError::UnknownKind(kind.to_string()));
    }
    Ok(serde_json::from_value(v)?)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &ControlMessage,
) -> Result<(), ProtocolError> {
    let framed = encode_message(msg)?;
    w.write_all(&framed).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ControlMessage, ProtocolError> {
    let body = read_frame(r).await?;
    decode_message(&body)
}

pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    hdr: &StreamHeader,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(hdr)?;
    let framed = frame(body)?;
    w.write_all(&framed).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_stream_header<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<StreamHeader, ProtocolError> {
    let body = read_frame(r).await?;
    Ok(serde_json::from_slice(&body)?)
}

fn frame(body: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    let n: u32 = body.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_CONTROL_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&n.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_CONTROL_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Compare two dotted versions numerically, missing components count as zero.
/// Non-numeric components compare as zero, so garbage never outranks a real
/// release.
pub fn version_lt(a: &str, b: &str) -> bool {
    let parse = |s: &str| -> [u64; 3] {
        let mut out = [0u64; 3];
        for (i, part) in s.trim().split('.').take(3).enumerate() {
            out[i] = part
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0);
        }
        out
    };
    parse(a) < parse(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_roundtrip_preserves_fields() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let msg = ControlMessage::TunnelRequest {
            req_id: "r-1".into(),
            kind: TunnelKind::Http,
            name: "web".into(),
            subdomain: Some("app".into()),
            host_aliases: vec!["www".into()],
            local_port: 3000,
            desired_public_port: None,
        };

        let sent = msg.clone();
        let w = tokio::spawn(async move { write_message(&mut a, &sent).await });
        let got = read_message(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            a.write_u32(MAX_CONTROL_FRAME_BYTES + 1).await.unwrap();
        });

        let err = read_message(&mut b).await.unwrap_err();
        match err {
            ProtocolError::FrameTooLarge(n) => assert!(n > MAX_CONTROL_FRAME_BYTES),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = br#"{"kind":"ping","ts":"2026-01-01T00:00:00Z","extra":42}"#;
        let msg = decode_message(body).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Ping {
                ts: "2026-01-01T00:00:00Z".into()
            }
        );
    }

    #[test]
    fn unknown_kind_is_its_own_error() {
        let body = br#"{"kind":"teleport","x":1}"#;
        match decode_message(body).unwrap_err() {
            ProtocolError::UnknownKind(k) => assert_eq!(k, "teleport"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_header_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hdr = StreamHeader {
            tunnel_id: "t-1".into(),
            remote_addr: Some("203.0.113.7:44444".into()),
            meta: BTreeMap::from([("host".to_string(), "app.t.ex".to_string())]),
        };
        let sent = hdr.clone();
        tokio::spawn(async move { write_stream_header(&mut a, &sent).await });
        let got = read_stream_header(&mut b).await.unwrap();
        assert_eq!(got, hdr);
    }

    #[test]
    fn reject_codes_use_wire_spelling() {
        let s = serde_json::to_string(&RejectCode::NoPorts).unwrap();
        assert_eq!(s, r#""NO_PORTS""#);
    }

    #[test]
    fn version_compare() {
        assert!(version_lt("0.3.9", "0.4.0"));
        assert!(!version_lt("0.4.0", "0.4.0"));
        assert!(!version_lt("1.0", "0.9.9"));
        assert!(version_lt("garbage", "0.0.1"));
    }
}
