use std::{
    fs,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

/// Marker wrapped around anything that should exit with the config error
/// code.
#[derive(Debug, Error)]
#[error("config: {0}")]
pub struct ConfigError(pub String);

pub const DEFAULT_HTTP_ADDR: &str = ":8080";
pub const DEFAULT_CONTROL_ADDR: &str = ":4443";

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub admin_addr: String,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub base_domain: String,
    pub http_addr: String,
    pub control_addr: String,
    pub transports: Vec<String>,
    pub public_scheme: String,
    pub min_client_version: String,
    pub interstitial: bool,
    pub tls: TlsFilesConfig,
    pub tcp_range: Option<(u16, u16)>,
    pub udp_range: Option<(u16, u16)>,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub inspect: InspectConfig,
    pub custom_domains: Vec<CustomDomainConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsFilesConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Verification endpoint of the external auth service. Empty means the
    /// static token table below is authoritative.
    pub endpoint: String,
    pub tokens: Vec<StaticTokenConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticTokenConfig {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub ip_rate: f64,
    pub ip_burst: f64,
    pub token_rate: f64,
    pub token_burst: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip_rate: 0.0,
            ip_burst: 100.0,
            token_rate: 5.0,
            token_burst: 20.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InspectConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub body_cap: usize,
    /// Optional JSON-lines archive file; empty disables persistence.
    pub archive_path: String,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: crate::fxtunnel::inspect::DEFAULT_RING_CAPACITY,
            body_cap: crate::fxtunnel::inspect::DEFAULT_BODY_CAP,
            archive_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomDomainConfig {
    pub domain: String,
    pub target_subdomain: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub owner: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub token: String,
    pub transport: String,
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub tunnels: Vec<ClientTunnelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientTunnelConfig {
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub host_aliases: Vec<String>,
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: Option<u16>,
}

// --- raw file schema -------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    logging: Option<FileLogging>,
    #[serde(default)]
    admin_addr: String,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    base_domain: String,
    http_addr: Option<String>,
    control_addr: Option<String>,
    #[serde(default)]
    transports: Vec<String>,
    public_scheme: Option<String>,
    min_client_version: Option<String>,
    #[serde(default)]
    interstitial: bool,
    tls: Option<FileTls>,
    tcp_port_range: Option<[u16; 2]>,
    udp_port_range: Option<[u16; 2]>,
    auth: Option<FileAuth>,
    limits: Option<FileLimits>,
    inspect: Option<FileInspect>,
    #[serde(default)]
    custom_domains: Vec<CustomDomainConfig>,
}

#[derive(Debug, Deserialize)]
struct FileTls {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileAuth {
    endpoint: Option<String>,
    #[serde(default)]
    tokens: Vec<StaticTokenConfig>,
}

#[derive(Debug, Deserialize)]
struct FileLimits {
    ip_rate: Option<f64>,
    ip_burst: Option<f64>,
    token_rate: Option<f64>,
    token_burst: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FileInspect {
    #[serde(default)]
    enabled: bool,
    capacity: Option<usize>,
    body_cap: Option<usize>,
    archive_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileClient {
    server_addr: Option<String>,
    token: Option<String>,
    transport: Option<String>,
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    #[serde(default)]
    tunnels: Vec<ClientTunnelConfig>,
}

// --- path resolution -------------------------------------------------------

pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            return Err(ConfigError("empty config path".into()).into());
        }
        return Ok(Some(p));
    }

    if let Some(p) = std::env::var_os("FXTUNNEL_CONFIG") {
        if !p.is_empty() {
            return Ok(Some(PathBuf::from(p)));
        }
    }

    for c in ["fxtunnel.toml", "fxtunnel.yaml", "fxtunnel.yml"] {
        let p = Path::new(c);
        if p.is_file() {
            return Ok(Some(p.to_path_buf()));
        }
    }

    if let Some(proj) = ProjectDirs::from("dev", "fxtun", "fxtunnel") {
        let p = proj.config_dir().join("fxtunnel.toml");
        if p.is_file() {
            return Ok(Some(p));
        }
    }

    Ok(None)
}

/// Load and normalize; a missing path yields the built-in defaults so the
/// client can run from flags alone.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let fc = match path {
        None => FileConfig::default(),
        Some(path) => {
            let data = fs::read(path)
                .map_err(|e| ConfigError(format!("read {}: {e}", path.display())))?;
            let s = String::from_utf8_lossy(&data);

            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();

            match ext.as_str() {
                "toml" => toml::from_str(&s)
                    .map_err(|e| ConfigError(format!("parse toml {}: {e}", path.display())))?,
                "yaml" | "yml" => serde_yaml::from_str(&s)
                    .map_err(|e| ConfigError(format!("parse yaml {}: {e}", path.display())))?,
                other => {
                    return Err(ConfigError(format!(
                        "unsupported config extension {other:?} (expected .toml or .yaml/.yml)"
                    ))
                    .into());
                }
            }
        }
    };

    let mut cfg = Config::from_file_config(fc)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            if let Some(v) = nonempty(&l.level) {
                logging.level = v;
            }
            if let Some(v) = nonempty(&l.format) {
                logging.format = v;
            }
            if let Some(v) = nonempty(&l.output) {
                logging.output = v;
            }
        }

        let server = match fc.server {
            None => None,
            Some(s) => Some(ServerConfig {
                base_domain: s.base_domain.trim().to_ascii_lowercase(),
                http_addr: nonempty(&s.http_addr).unwrap_or_else(|| DEFAULT_HTTP_ADDR.into()),
                control_addr: nonempty(&s.control_addr)
                    .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.into()),
                transports: if s.transports.is_empty() {
                    vec!["tcp".into()]
                } else {
                    s.transports
                        .iter()
                        .map(|t| t.trim().to_ascii_lowercase())
                        .filter(|t| !t.is_empty())
                        .collect()
                },
                public_scheme: nonempty(&s.public_scheme).unwrap_or_else(|| "http".into()),
                min_client_version: nonempty(&s.min_client_version)
                    .unwrap_or_else(|| "0.0.0".into()),
                interstitial: s.interstitial,
                tls: TlsFilesConfig {
                    cert_file: s
                        .tls
                        .as_ref()
                        .and_then(|t| nonempty(&t.cert_file))
                        .unwrap_or_default(),
                    key_file: s
                        .tls
                        .as_ref()
                        .and_then(|t| nonempty(&t.key_file))
                        .unwrap_or_default(),
                },
                tcp_range: s.tcp_port_range.map(|[a, b]| (a, b)),
                udp_range: s.udp_port_range.map(|[a, b]| (a, b)),
                auth: AuthConfig {
                    endpoint: s
                        .auth
                        .as_ref()
                        .and_then(|a| nonempty(&a.endpoint))
                        .unwrap_or_default(),
                    tokens: s.auth.map(|a| a.tokens).unwrap_or_default(),
                },
                limits: {
                    let mut l = LimitsConfig::default();
                    if let Some(f) = &s.limits {
                        if let Some(v) = f.ip_rate {
                            l.ip_rate = v;
                        }
                        if let Some(v) = f.ip_burst {
                            l.ip_burst = v;
                        }
                        if let Some(v) = f.token_rate {
                            l.token_rate = v;
                        }
                        if let Some(v) = f.token_burst {
                            l.token_burst = v;
                        }
                    }
                    l
                },
                inspect: {
                    let mut i = InspectConfig::default();
                    if let Some(f) = &s.inspect {
                        i.enabled = f.enabled;
                        if let Some(v) = f.capacity {
                            i.capacity = v;
                        }
                        if let Some(v) = f.body_cap {
                            i.body_cap = v;
                        }
                        if let Some(v) = nonempty(&f.archive_path) {
                            i.archive_path = v;
                        }
                    }
                    i
                },
                custom_domains: s.custom_domains,
            }),
        };

        let client = fc.client.map(|c| ClientConfig {
            server_addr: nonempty(&c.server_addr).unwrap_or_default(),
            token: nonempty(&c.token).unwrap_or_default(),
            transport: nonempty(&c.transport).unwrap_or_else(|| "tcp".into()),
            server_name: nonempty(&c.server_name).unwrap_or_default(),
            insecure_skip_verify: c.insecure_skip_verify,
            tunnels: c.tunnels,
        });

        Ok(Config {
            logging,
            admin_addr: fc.admin_addr.trim().to_string(),
            server,
            client,
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        if let Some(s) = &self.server {
            if s.base_domain.is_empty() {
                return Err(ConfigError("server.base_domain is required".into()).into());
            }
            for (name, range) in [("tcp", s.tcp_range), ("udp", s.udp_range)] {
                if let Some((min, max)) = range {
                    if min > max || min == 0 {
                        return Err(ConfigError(format!(
                            "server.{name}_port_range [{min}, {max}] is not a valid range"
                        ))
                        .into());
                    }
                }
            }
            for t in &s.transports {
                crate::fxtunnel::transport::parse_transport(t)
                    .map_err(|e| ConfigError(e.to_string()))?;
            }
        }
        Ok(())
    }
}

fn nonempty(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// --- environment overrides -------------------------------------------------

fn env_str(section: &str, key: &str) -> Option<String> {
    std::env::var(format!("FXTUNNEL_{section}_{key}"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(section: &str, key: &str) -> Option<T> {
    env_str(section, key).and_then(|s| s.parse().ok())
}

fn env_bool(section: &str, key: &str) -> Option<bool> {
    env_str(section, key).map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Every config key is overridable via `FXTUNNEL_<SECTION>_<KEY>`.
fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_str("LOGGING", "LEVEL") {
        cfg.logging.level = v;
    }
    if let Some(v) = env_str("LOGGING", "FORMAT") {
        cfg.logging.format = v;
    }
    if let Some(v) = env_str("LOGGING", "OUTPUT") {
        cfg.logging.output = v;
    }
    if let Some(v) = env_str("ADMIN", "ADDR") {
        cfg.admin_addr = v;
    }

    if let Some(s) = cfg.server.as_mut() {
        if let Some(v) = env_str("SERVER", "BASE_DOMAIN") {
            s.base_domain = v.to_ascii_lowercase();
        }
        if let Some(v) = env_str("SERVER", "HTTP_ADDR") {
            s.http_addr = v;
        }
        if let Some(v) = env_str("SERVER", "CONTROL_ADDR") {
            s.control_addr = v;
        }
        if let Some(v) = env_str("SERVER", "TRANSPORTS") {
            s.transports = v
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Some(v) = env_str("SERVER", "PUBLIC_SCHEME") {
            s.public_scheme = v;
        }
        if let Some(v) = env_str("SERVER", "MIN_CLIENT_VERSION") {
            s.min_client_version = v;
        }
        if let Some(v) = env_bool("SERVER", "INTERSTITIAL") {
            s.interstitial = v;
        }
        if let Some(v) = env_str("TLS", "CERT_FILE") {
            s.tls.cert_file = v;
        }
        if let Some(v) = env_str("TLS", "KEY_FILE") {
            s.tls.key_file = v;
        }
        if let (Some(min), Some(max)) = (
            env_parse::<u16>("SERVER", "TCP_PORT_MIN"),
            env_parse::<u16>("SERVER", "TCP_PORT_MAX"),
        ) {
            s.tcp_range = Some((min, max));
        }
        if let (Some(min), Some(max)) = (
            env_parse::<u16>("SERVER", "UDP_PORT_MIN"),
            env_parse::<u16>("SERVER", "UDP_PORT_MAX"),
        ) {
            s.udp_range = Some((min, max));
        }
        if let Some(v) = env_str("AUTH", "ENDPOINT") {
            s.auth.endpoint = v;
        }
        if let Some(v) = env_parse::<f64>("LIMITS", "IP_RATE") {
            s.limits.ip_rate = v;
        }
        if let Some(v) = env_parse::<f64>("LIMITS", "IP_BURST") {
            s.limits.ip_burst = v;
        }
        if let Some(v) = env_parse::<f64>("LIMITS", "TOKEN_RATE") {
            s.limits.token_rate = v;
        }
        if let Some(v) = env_parse::<f64>("LIMITS", "TOKEN_BURST") {
            s.limits.token_burst = v;
        }
        if let Some(v) = env_bool("INSPECT", "ENABLED") {
            s.inspect.enabled = v;
        }
        if let Some(v) = env_parse::<usize>("INSPECT", "CAPACITY") {
            s.inspect.capacity = v;
        }
        if let Some(v) = env_parse::<usize>("INSPECT", "BODY_CAP") {
            s.inspect.body_cap = v;
        }
        if let Some(v) = env_str("INSPECT", "ARCHIVE_PATH") {
            s.inspect.archive_path = v;
        }
    }

    if let Some(c) = cfg.client.as_mut() {
        if let Some(v) = env_str("CLIENT", "SERVER_ADDR") {
            c.server_addr = v;
        }
        if let Some(v) = env_str("CLIENT", "TOKEN") {
            c.token = v;
        }
        if let Some(v) = env_str("CLIENT", "TRANSPORT") {
            c.transport = v;
        }
        if let Some(v) = env_str("CLIENT", "SERVER_NAME") {
            c.server_name = v;
        }
        if let Some(v) = env_bool("CLIENT", "INSECURE") {
            c.insecure_skip_verify = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The override test mutates process environment; everything that reads
    // config must serialize against it.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn env_guard() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tmp(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fxtunnel-config-tests");
        fs::create_dir_all(&dir).unwrap();
        let p = dir.join(name);
        fs::write(&p, contents).unwrap();
        p
    }

    #[test]
    fn toml_roundtrip_with_defaults() {
        let _g = env_guard();
        let p = write_tmp(
            "server.toml",
            r#"
[server]
base_domain = "t.ex"
tcp_port_range = [10000, 10001]

[[server.auth.tokens]]
token = "sk_T"
user_id = "user1"
"#,
        );
        let cfg = load_config(Some(&p)).unwrap();
        let s = cfg.server.unwrap();
        assert_eq!(s.base_domain, "t.ex");
        assert_eq!(s.http_addr, DEFAULT_HTTP_ADDR);
        assert_eq!(s.control_addr, DEFAULT_CONTROL_ADDR);
        assert_eq!(s.tcp_range, Some((10000, 10001)));
        assert_eq!(s.udp_range, None);
        assert_eq!(s.auth.tokens.len(), 1);
        assert_eq!(s.transports, vec!["tcp".to_string()]);
    }

    #[test]
    fn yaml_is_accepted() {
        let _g = env_guard();
        let p = write_tmp(
            "server.yaml",
            "server:\n  base_domain: t.ex\n  interstitial: true\n",
        );
        let cfg = load_config(Some(&p)).unwrap();
        assert!(cfg.server.unwrap().interstitial);
    }

    #[test]
    fn invalid_range_is_config_error() {
        let _g = env_guard();
        let p = write_tmp(
            "bad.toml",
            "[server]\nbase_domain = \"t.ex\"\ntcp_port_range = [2, 1]\n",
        );
        let err = load_config(Some(&p)).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let _g = env_guard();
        let cfg = load_config(None).unwrap();
        assert!(cfg.server.is_none());
        assert!(cfg.client.is_none());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn env_overrides_take_effect() {
        let _g = env_guard();
        let p = write_tmp("env.toml", "[server]\nbase_domain = \"t.ex\"\n");
        unsafe {
            std::env::set_var("FXTUNNEL_SERVER_HTTP_ADDR", ":9090");
            std::env::set_var("FXTUNNEL_INSPECT_ENABLED", "true");
        }
        let cfg = load_config(Some(&p)).unwrap();
        unsafe {
            std::env::remove_var("FXTUNNEL_SERVER_HTTP_ADDR");
            std::env::remove_var("FXTUNNEL_INSPECT_ENABLED");
        }
        let s = cfg.server.unwrap();
        assert_eq!(s.http_addr, ":9090");
        assert!(s.inspect.enabled);
    }
}
