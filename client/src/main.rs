use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ntunnel_shared::crypto::{Identity, Keypair};
use ntunnel_shared::protocol::{Headers, HttpMethod, TunnelResponseMessage};
use ntunnel_shared::transport::{parse_endpoints, Bus, Endpoint, DEFAULT_PUBLISH_TIMEOUT};

mod agent;
mod config;
mod correlator;
mod forward;
mod headers;
mod proxy;
mod relay_transport;

#[cfg(test)]
mod test_support;

use agent::Agent;
use config::NTunnelConfig;
use correlator::{TunnelClient, DEFAULT_REQUEST_TIMEOUT};
use forward::{Forwarder, DEFAULT_MAX_RESPONSE_SIZE};
use headers::{parse_header, HeaderRewriter, HeaderRule};
use relay_transport::RelayTransport;

#[derive(Parser)]
#[command(name = "ntunnel")]
#[command(author = "NTunnel Team")]
#[command(version = "0.1.0")]
#[command(about = "Tunnel HTTP to a private service over public relays", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay endpoint URLs, comma-separated
    #[arg(short, long, global = true, env = "RELAY_URLS")]
    relays: Option<String>,

    /// Config file (default: ntunnel.yml in the current or home directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Private key, hex
    #[arg(long, global = true, env = "NTUNNEL_PRIVATE_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Private key file
    #[arg(long, global = true, env = "KEY_PATH")]
    key_path: Option<PathBuf>,

    /// Milliseconds to wait for the first relay acknowledgement
    #[arg(long, global = true, env = "PUBLISH_TIMEOUT")]
    publish_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a local HTTP service through the tunnel
    Agent {
        /// Local service base URL
        #[arg(short, long, env = "TARGET_URL")]
        target: Option<String>,

        /// Largest response body relayed, in bytes
        #[arg(long, env = "MAX_RESPONSE_SIZE")]
        max_response_size: Option<usize>,

        /// Milliseconds allowed for the local service to answer
        #[arg(long, env = "UPSTREAM_TIMEOUT")]
        upstream_timeout: Option<u64>,
    },
    /// Run a local HTTP proxy that tunnels every request to an agent
    Proxy {
        /// Agent identity, hex
        #[arg(short, long, env = "SERVICE_PUBKEY")]
        agent: Option<String>,

        /// Local port to listen on
        #[arg(short, long, env = "PROXY_PORT")]
        port: Option<u16>,

        /// Request timeout in milliseconds
        #[arg(short, long, env = "REQUEST_TIMEOUT")]
        timeout: Option<u64>,

        /// Header added to every tunnelled request, `Name: value`
        #[arg(long = "set-header")]
        set_headers: Vec<String>,

        /// Header removed from every tunnelled request
        #[arg(long = "strip-header")]
        strip_headers: Vec<String>,
    },
    /// Send one request through the tunnel and print the response
    Fetch {
        /// Request path, e.g. /api/status
        path: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,

        /// Agent identity, hex
        #[arg(short, long, env = "SERVICE_PUBKEY")]
        agent: Option<String>,

        /// Request timeout in milliseconds
        #[arg(short, long, env = "REQUEST_TIMEOUT")]
        timeout: Option<u64>,
    },
    /// Generate a key and print its identity
    Keygen {
        /// Write the key to this file instead of printing it
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let file = match cli.config.clone().or_else(NTunnelConfig::find_config) {
        Some(path) => {
            info!("Using config {}", path.display());
            NTunnelConfig::load(&path)?
        }
        None => NTunnelConfig::default(),
    };

    match cli.command {
        Commands::Agent {
            ref target,
            max_response_size,
            upstream_timeout,
        } => {
            let target = target
                .clone()
                .or_else(|| file.agent.target.clone())
                .unwrap_or_else(|| config::DEFAULT_TARGET.to_string());
            let target = reqwest::Url::parse(&target)
                .with_context(|| format!("Invalid target URL: {}", target))?;
            let max_response_size = max_response_size
                .or(file.agent.max_response_size)
                .unwrap_or(DEFAULT_MAX_RESPONSE_SIZE);

            let forwarder = match upstream_timeout.or(file.agent.upstream_timeout_ms) {
                Some(ms) => {
                    let http = reqwest::Client::builder()
                        .timeout(Duration::from_millis(ms))
                        .build()
                        .context("Failed to build HTTP client")?;
                    Forwarder::with_client(http, target, max_response_size)
                }
                None => Forwarder::new(target, max_response_size),
            };

            let keypair = config::agent_keypair(key_setting(&cli, &file).as_deref(), key_path_setting(&cli, &file).as_deref())?;
            let bus = relay_bus(&cli, &file)?;

            let agent = Agent::new(keypair, bus, forwarder);
            agent.print_banner();
            agent.run(shutdown_signal()).await;
        }
        Commands::Proxy {
            ref agent,
            port,
            timeout,
            ref set_headers,
            ref strip_headers,
        } => {
            let mut rules = Vec::new();
            for line in file.client.set_headers.iter().chain(set_headers) {
                let (name, value) = parse_header(line).ok_or_else(|| anyhow!("Invalid header '{}': expected 'Name: value'", line))?;
                rules.push(HeaderRule::Set(name, value));
            }
            rules.extend(strip_headers.iter().map(|name| HeaderRule::Remove(name.clone())));

            let client = tunnel_client(&cli, &file, agent.as_deref(), timeout)?;
            let port = port.or(file.client.port).unwrap_or(config::DEFAULT_PROXY_PORT);

            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            proxy::print_banner(&client, port);

            axum::serve(listener, proxy::router(client, HeaderRewriter::with_rules(rules)))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Commands::Fetch {
            ref path,
            ref method,
            ref headers,
            ref data,
            ref agent,
            timeout,
        } => {
            let method: HttpMethod = method.parse().map_err(|e| anyhow!("{}", e))?;
            let mut request_headers = Headers::new();
            for line in headers {
                let (name, value) = parse_header(line).ok_or_else(|| anyhow!("Invalid header '{}': expected 'Name: value'", line))?;
                request_headers.insert(name, value);
            }

            let client = tunnel_client(&cli, &file, agent.as_deref(), timeout)?;
            let body = data.as_ref().map(|d| d.clone().into_bytes());
            match client.fetch(method, path, request_headers, body).await? {
                TunnelResponseMessage::Success(resp) => {
                    println!("HTTP {}", resp.status);
                    for (k, v) in &resp.headers {
                        println!("{}: {}", k, v);
                    }
                    println!();
                    println!("{}", resp.body_text());
                }
                TunnelResponseMessage::Error(err) => {
                    return Err(anyhow!("Agent returned {}: {}", err.status, err.error));
                }
            }
        }
        Commands::Keygen { ref out } => {
            match out {
                Some(path) => {
                    if path.exists() {
                        anyhow::bail!("Refusing to overwrite {}", path.display());
                    }
                    let keypair = config::load_or_generate_key(path)?;
                    println!("Key written to {}", path.display());
                    println!("Identity: {}", keypair.identity());
                }
                None => {
                    let keypair = Keypair::generate();
                    println!("Private key: {}", keypair.secret_hex());
                    println!("Identity:    {}", keypair.identity());
                }
            }
        }
    }

    Ok(())
}

fn key_setting(cli: &Cli, file: &NTunnelConfig) -> Option<String> {
    cli.key.clone().or_else(|| file.key.clone())
}

fn key_path_setting(cli: &Cli, file: &NTunnelConfig) -> Option<PathBuf> {
    cli.key_path.clone().or_else(|| file.key_path.clone())
}

fn relay_bus(cli: &Cli, file: &NTunnelConfig) -> Result<Bus> {
    let endpoints: Vec<Endpoint> = match &cli.relays {
        Some(list) => parse_endpoints(list),
        None if !file.relays.is_empty() => file.relays.iter().map(|r| Endpoint::new(r.as_str())).collect(),
        None => vec![Endpoint::from(config::DEFAULT_RELAY)],
    };
    if endpoints.is_empty() {
        anyhow::bail!("No relay endpoints configured");
    }

    let publish_timeout = cli
        .publish_timeout
        .or(file.publish_timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_PUBLISH_TIMEOUT);

    Ok(Bus::new(Arc::new(RelayTransport::new()), endpoints).with_publish_timeout(publish_timeout))
}

fn tunnel_client(cli: &Cli, file: &NTunnelConfig, agent: Option<&str>, timeout: Option<u64>) -> Result<TunnelClient> {
    let agent = agent
        .map(str::to_string)
        .or_else(|| file.client.agent.clone())
        .ok_or_else(|| anyhow!("No agent identity given (use --agent or SERVICE_PUBKEY)"))?;
    let agent: Identity = agent.parse().map_err(|e| anyhow!("Invalid agent identity: {}", e))?;

    let keypair = config::client_keypair(key_setting(cli, file).as_deref(), key_path_setting(cli, file).as_deref())?;
    let timeout = timeout
        .or(file.client.timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

    Ok(TunnelClient::new(keypair, agent, relay_bus(cli, file)?).with_timeout(timeout))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down...");
}
