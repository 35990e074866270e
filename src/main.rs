mod fxtunnel;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use fxtunnel::app::{self, ClientOverrides};
use fxtunnel::client::{ClientError, TunnelSpec};
use fxtunnel::config::ConfigError;
use fxtunnel::protocol::TunnelKind;

#[derive(Debug, Parser)]
#[command(
    name = "fxtunnel",
    version,
    about = "fxtunnel - expose local services through a public tunnel server"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public tunnel server
    Server {
        /// Path to the config file (.toml/.yaml/.yml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Expose a local HTTP origin
    Http {
        /// Local origin port on loopback
        port: u16,
        /// Requested subdomain label under the server's base domain
        #[arg(long = "domain", alias = "subdomain")]
        domain: Option<String>,
        /// Additional host labels for the same tunnel
        #[arg(long = "alias")]
        aliases: Vec<String>,
        #[command(flatten)]
        common: ClientFlags,
    },
    /// Expose a local TCP origin
    Tcp {
        /// Local origin port on loopback
        port: u16,
        /// Preferred public port from the server's range
        #[arg(long)]
        remote_port: Option<u16>,
        #[command(flatten)]
        common: ClientFlags,
    },
    /// Expose a local UDP origin
    Udp {
        /// Local origin port on loopback
        port: u16,
        /// Preferred public port from the server's range
        #[arg(long)]
        remote_port: Option<u16>,
        #[command(flatten)]
        common: ClientFlags,
    },
    /// Print the version
    Version,
}

#[derive(Debug, Args)]
struct ClientFlags {
    /// Tunnel server control endpoint, host:port
    #[arg(long, env = "FXTUNNEL_CLIENT_SERVER_ADDR")]
    server: Option<String>,
    /// Bearer token for authentication
    #[arg(long, env = "FXTUNNEL_CLIENT_TOKEN")]
    token: Option<String>,
    /// Path to the config file (.toml/.yaml/.yml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Control transport: tcp (TLS + multiplexing) or quic
    #[arg(long)]
    transport: Option<String>,
    /// TLS server name when it differs from the dialed host
    #[arg(long)]
    server_name: Option<String>,
    /// Skip TLS certificate verification (self-signed servers)
    #[arg(long)]
    insecure: bool,
    /// Display name for the tunnel
    #[arg(long)]
    name: Option<String>,
}

impl ClientFlags {
    fn overrides(&self) -> ClientOverrides {
        ClientOverrides {
            server: self.server.clone(),
            token: self.token.clone(),
            transport: self.transport.clone(),
            server_name: self.server_name.clone(),
            insecure: self.insecure,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let res = match cli.cmd {
        Command::Server { config } => app::run_server(config).await,
        Command::Http {
            port,
            domain,
            aliases,
            common,
        } => {
            let spec = TunnelSpec {
                kind: TunnelKind::Http,
                name: common
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("http-{port}")),
                subdomain: domain,
                host_aliases: aliases,
                local_port: port,
                desired_public_port: None,
            };
            app::run_client(common.config.clone(), common.overrides(), spec).await
        }
        Command::Tcp {
            port,
            remote_port,
            common,
        } => {
            let spec = TunnelSpec {
                kind: TunnelKind::Tcp,
                name: common.name.clone().unwrap_or_else(|| format!("tcp-{port}")),
                subdomain: None,
                host_aliases: vec![],
                local_port: port,
                desired_public_port: remote_port,
            };
            app::run_client(common.config.clone(), common.overrides(), spec).await
        }
        Command::Udp {
            port,
            remote_port,
            common,
        } => {
            let spec = TunnelSpec {
                kind: TunnelKind::Udp,
                name: common.name.clone().unwrap_or_else(|| format!("udp-{port}")),
                subdomain: None,
                host_aliases: vec![],
                local_port: port,
                desired_public_port: remote_port,
            };
            app::run_client(common.config.clone(), common.overrides(), spec).await
        }
        Command::Version => {
            println!("fxtunnel {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fxtunnel: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// 1 startup failure, 2 config error, 3 auth error.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    if let Some(ClientError::AuthRejected(_)) = err.downcast_ref::<ClientError>() {
        return 3;
    }
    1
}
