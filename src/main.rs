use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use toolmux::config::Config;
use toolmux::gateway::{self, AppState};
use toolmux::mcp::{ServerConfig, TransportConfig};
use toolmux::mirror::{GatewayClient, MirrorEntry, MirrorStore, PresenceMirror};
use tracing_subscriber::EnvFilter;

/// Connects to MCP tool servers and exposes them to a function-calling chat loop.
#[derive(Parser)]
#[command(name = "toolmux", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $TOOLMUX_CONFIG or the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage configured servers through a running gateway
    Servers {
        /// Gateway base URL
        #[arg(long, global = true)]
        gateway: Option<String>,

        #[command(subcommand)]
        action: ServersAction,
    },
}

#[derive(Subcommand)]
enum ServersAction {
    /// Show configured servers and their status
    List,
    /// Add (or replace) a server config
    Add {
        /// Display name
        name: String,
        /// Command for stdio, endpoint URL for http/sse
        target: String,
        /// Arguments passed to a stdio command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        #[arg(long, value_enum, default_value_t = TransportArg::Stdio)]
        transport: TransportArg,
        /// Server id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Environment overlay for stdio servers, KEY=VALUE
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Connect right after adding
        #[arg(long)]
        connect: bool,
    },
    /// Disconnect and forget a server
    Remove { id: String },
    Connect { id: String },
    Disconnect { id: String },
    /// Reconcile with the gateway and reconnect previously connected servers
    Restore,
    /// Replace all configs from a JSON array file ("-" for stdin)
    Import { path: PathBuf },
    /// Write configs as a JSON array (stdout when no path is given)
    Export { path: Option<PathBuf> },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Stdio,
    Http,
    Sse,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolmux=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let state = AppState::from_config(&config);
            gateway::serve(&config, state).await
        }
        Command::Servers { gateway, action } => {
            let url = gateway.unwrap_or_else(|| config.mirror.resolved_gateway_url(&config.gateway));
            // Connects may take the full handshake timeout server-side.
            let timeout = Duration::from_secs(config.mcp.connect_timeout_secs + 10);
            let client = GatewayClient::new(&url, timeout)?;
            let store = MirrorStore::new(config.mirror.resolved_state_path()?);
            let mut mirror = PresenceMirror::new(client, store);
            mirror.restore().await?;
            run_servers(&mut mirror, action).await
        }
    }
}

async fn run_servers(mirror: &mut PresenceMirror<GatewayClient>, action: ServersAction) -> Result<()> {
    match action {
        ServersAction::List | ServersAction::Restore => print_entries(&mirror.entries()),
        ServersAction::Add {
            name,
            target,
            args,
            transport,
            id,
            env,
            connect,
        } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let transport = match transport {
                TransportArg::Stdio => TransportConfig::Stdio {
                    command: target,
                    args,
                    env: env.into_iter().collect::<BTreeMap<_, _>>(),
                },
                TransportArg::Http => TransportConfig::Http { url: target },
                TransportArg::Sse => TransportConfig::Sse { url: target },
            };
            mirror.add_server(ServerConfig {
                id: id.clone(),
                name,
                transport,
            })?;
            println!("{id}");
            if connect {
                report(mirror.connect(&id).await)?;
            }
        }
        ServersAction::Remove { id } => mirror.remove_server(&id).await?,
        ServersAction::Connect { id } => report(mirror.connect(&id).await)?,
        ServersAction::Disconnect { id } => report(mirror.disconnect(&id).await)?,
        ServersAction::Import { path } => {
            let json = if path.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?
            };
            let count = mirror.import_json(&json).await?;
            println!("imported {count} server(s)");
        }
        ServersAction::Export { path } => {
            let json = mirror.export_json()?;
            match path {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{json}"),
            }
        }
    }
    Ok(())
}

fn report(result: toolmux::mcp::OperationResult) -> Result<()> {
    match (result.success, result.error) {
        (true, None) => Ok(()),
        (true, Some(warning)) => {
            eprintln!("warning: {warning}");
            Ok(())
        }
        (false, error) => bail!(error.unwrap_or_else(|| "operation failed".into())),
    }
}

fn print_entries(entries: &[MirrorEntry]) {
    if entries.is_empty() {
        println!("no servers configured");
        return;
    }
    for entry in entries {
        let error = entry.last_error.as_deref().unwrap_or("");
        println!(
            "{}\t{}\t{}\t{}\t{}",
            entry.id, entry.name, entry.transport, entry.status, error
        );
    }
}
