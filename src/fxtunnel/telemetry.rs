use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle
/// used to render the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn count_session_open() {
    metrics::counter!("fxtunnel_sessions_total").increment(1);
    metrics::gauge!("fxtunnel_active_sessions").increment(1.0);
}

pub fn count_session_close() {
    metrics::gauge!("fxtunnel_active_sessions").decrement(1.0);
}

pub fn count_tunnel_open(kind: &str) {
    metrics::gauge!("fxtunnel_active_tunnels", "kind" => kind.to_string()).increment(1.0);
}

pub fn count_tunnel_close(kind: &str) {
    metrics::gauge!("fxtunnel_active_tunnels", "kind" => kind.to_string()).decrement(1.0);
}

pub fn count_rejection(code: &str) {
    metrics::counter!("fxtunnel_tunnel_rejections_total", "code" => code.to_string()).increment(1);
}

pub fn count_request(status: u16) {
    let class = match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    metrics::counter!("fxtunnel_http_requests_total", "class" => class).increment(1);
}

pub fn count_bytes_in(tunnel_id: &str, n: u64) {
    metrics::counter!("fxtunnel_bytes_in_total", "tunnel" => tunnel_id.to_string()).increment(n);
}

pub fn count_bytes_out(tunnel_id: &str, n: u64) {
    metrics::counter!("fxtunnel_bytes_out_total", "tunnel" => tunnel_id.to_string()).increment(n);
}
