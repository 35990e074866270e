use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::fxtunnel::{
    admin, auth,
    client::{Client, ClientOptions, TunnelSpec},
    config::{self, ConfigError},
    domains::{CustomDomain, CustomDomains},
    httpd,
    inspect::{self, Inspector},
    limits::RateLimiter,
    logging, ports, protocol,
    registry::Registry,
    server::{ControlEndpoint, ControlServer, ControlServerOptions},
    telemetry,
    transport::{TlsDialOptions, TlsListenOptions},
    udpproxy::UdpTunnelOptions,
};

pub async fn run_server(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(path.as_deref())?;

    let _logrt = logging::init(&cfg.logging)?;

    let Some(sc) = cfg.server.clone() else {
        return Err(ConfigError("server section is required to run the server".into()).into());
    };

    if let Some(p) = &path {
        tracing::info!(config = %p.display(), "server: loaded config");
    }

    let prom = Arc::new(telemetry::init_prometheus()?);

    let tcp_alloc = sc
        .tcp_range
        .map(|(a, b)| ports::PortAllocator::new(a, b))
        .unwrap_or_else(ports::PortAllocator::empty);
    let udp_alloc = sc
        .udp_range
        .map(|(a, b)| ports::PortAllocator::new(a, b))
        .unwrap_or_else(ports::PortAllocator::empty);

    let registry = Arc::new(Registry::new(&sc.base_domain, tcp_alloc, udp_alloc));

    let domains = Arc::new(CustomDomains::new(
        sc.custom_domains
            .iter()
            .map(|d| CustomDomain {
                domain: d.domain.clone(),
                target_subdomain: d.target_subdomain.clone(),
                verified: d.verified,
                owner: d.owner.clone(),
            })
            .collect(),
    ));

    let ip_limiter = Arc::new(RateLimiter::new(sc.limits.ip_rate, sc.limits.ip_burst));
    let token_limiter = Arc::new(RateLimiter::new(sc.limits.token_rate, sc.limits.token_burst));

    // Rings stay in RAM; the optional archive drains through a bounded
    // single-writer queue so a slow disk never touches the data plane.
    let persist = if sc.inspect.enabled && !sc.inspect.archive_path.is_empty() {
        Some(inspect::spawn_persistence(Arc::new(inspect::JsonlStore::new(
            sc.inspect.archive_path.clone(),
        ))))
    } else {
        None
    };
    let inspector = Arc::new(Inspector::new(
        sc.inspect.enabled,
        sc.inspect.capacity,
        sc.inspect.body_cap,
        persist,
    ));

    let verifier: Arc<dyn auth::TokenVerifier> = if !sc.auth.endpoint.is_empty() {
        Arc::new(auth::HttpVerifier::new(sc.auth.endpoint.clone())?)
    } else {
        let mut tokens = HashMap::new();
        for t in &sc.auth.tokens {
            tokens.insert(
                t.token.clone(),
                auth::AuthDecision {
                    user_id: t.user_id.clone(),
                    plan: protocol::Plan::default(),
                    admin: t.admin,
                },
            );
        }
        if tokens.is_empty() {
            tracing::warn!("server: no auth endpoint and no static tokens; all clients will be rejected");
        }
        Arc::new(auth::StaticVerifier::new(tokens))
    };

    tracing::info!(
        base = %sc.base_domain,
        http = %sc.http_addr,
        control = %sc.control_addr,
        transports = ?sc.transports,
        tcp_range = ?sc.tcp_range,
        udp_range = ?sc.udp_range,
        inspect = sc.inspect.enabled,
        "server: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Public HTTP router.
    {
        let opts = httpd::HttpdOptions {
            interstitial: sc.interstitial,
            ..httpd::HttpdOptions::defaults(
                sc.http_addr.clone(),
                registry.clone(),
                domains.clone(),
                ip_limiter.clone(),
                inspector.clone(),
            )
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { httpd::serve_http_with_shutdown(opts, shutdown).await });
    }

    // Control plane.
    {
        let control = ControlServer::new(ControlServerOptions {
            endpoints: sc
                .transports
                .iter()
                .map(|t| ControlEndpoint {
                    listen_addr: sc.control_addr.clone(),
                    transport: t.clone(),
                })
                .collect(),
            tls: TlsListenOptions {
                cert_file: sc.tls.cert_file.clone(),
                key_file: sc.tls.key_file.clone(),
            },
            registry: registry.clone(),
            verifier,
            token_limiter: token_limiter.clone(),
            inspector: inspector.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            min_client_version: sc.min_client_version.clone(),
            public_http_port: addr_port(&sc.http_addr).unwrap_or(8080),
            public_scheme: sc.public_scheme.clone(),
            udp_opts: UdpTunnelOptions::default(),
        });
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { control.listen_and_serve(shutdown).await });
    }

    // Admin endpoint.
    if !cfg.admin_addr.trim().is_empty() {
        let addr: SocketAddr = crate::fxtunnel::net::normalize_bind_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: prom.clone(),
            registry: registry.clone(),
            inspector: inspector.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Rate-limiter bucket sweeper.
    {
        let ip_limiter = ip_limiter.clone();
        let token_limiter = token_limiter.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        ip_limiter.sweep();
                        token_limiter.sweep();
                    }
                }
            }
            Ok(())
        });
    }

    // Wait for a signal or an unexpected task exit.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("server: shutdown signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                let _ = shutdown_tx.send(true);
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks; enforce a cap so process managers don't stall.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct ClientOverrides {
    pub server: Option<String>,
    pub token: Option<String>,
    pub transport: Option<String>,
    pub server_name: Option<String>,
    pub insecure: bool,
}

pub async fn run_client(
    config_path: Option<PathBuf>,
    overrides: ClientOverrides,
    spec: TunnelSpec,
) -> anyhow::Result<()> {
    let path = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(path.as_deref())?;

    let _logrt = logging::init(&cfg.logging)?;

    let fc = cfg.client.unwrap_or_default();

    let server_addr = overrides
        .server
        .or_else(|| (!fc.server_addr.is_empty()).then(|| fc.server_addr.clone()))
        .ok_or_else(|| ConfigError("server address is required (--server)".into()))?;
    let token = overrides
        .token
        .or_else(|| (!fc.token.is_empty()).then(|| fc.token.clone()))
        .ok_or_else(|| ConfigError("token is required (--token)".into()))?;
    let transport = overrides
        .transport
        .unwrap_or_else(|| fc.transport.clone());

    let mut tunnels = vec![spec];
    for t in &fc.tunnels {
        tunnels.push(tunnel_from_config(t)?);
    }

    let client = Client::new(ClientOptions {
        server_addr,
        transport,
        token,
        version: env!("CARGO_PKG_VERSION").to_string(),
        tunnels,
        dial_timeout: Duration::from_secs(5),
        tls: TlsDialOptions {
            server_name: overrides
                .server_name
                .unwrap_or_else(|| fc.server_name.clone()),
            insecure_skip_verify: overrides.insecure || fc.insecure_skip_verify,
        },
    })?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("client: shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    client.run(shutdown_rx).await
}

fn tunnel_from_config(t: &config::ClientTunnelConfig) -> anyhow::Result<TunnelSpec> {
    let kind = match t.kind.trim().to_ascii_lowercase().as_str() {
        "http" => protocol::TunnelKind::Http,
        "tcp" => protocol::TunnelKind::Tcp,
        "udp" => protocol::TunnelKind::Udp,
        other => {
            return Err(ConfigError(format!("unknown tunnel kind {other:?}")).into());
        }
    };
    Ok(TunnelSpec {
        kind,
        name: if t.name.is_empty() {
            format!("{kind}-{}", t.local_port)
        } else {
            t.name.clone()
        },
        subdomain: t.subdomain.clone(),
        host_aliases: t.host_aliases.clone(),
        local_port: t.local_port,
        desired_public_port: t.remote_port,
    })
}

fn addr_port(addr: &str) -> Option<u16> {
    addr.trim().rsplit_once(':')?.1.parse().ok()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(t) => t,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::addr_port;

    #[test]
    fn addr_port_parses() {
        assert_eq!(addr_port(":8080"), Some(8080));
        assert_eq!(addr_port("0.0.0.0:9000"), Some(9000));
        assert_eq!(addr_port("nonsense"), None);
    }
}
