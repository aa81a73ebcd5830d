//! Pylon node -- single binary mesh routing node.
//!
//! Usage:
//!   pylon-node                      # Run with default config
//!   pylon-node --config path.toml   # Run with custom config
//!   pylon-node routes               # Query the local admin API

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use pylon_api::{admin_router, rpc_router, ActionHandle, AppState};
use pylon_node::config::{self, NodeConfig};
use pylon_node::{expand_tilde, load_or_create_token, outbound, rib_task};
use pylon_protocol::{PeerInfo, RouteProtocol};
use pylon_rib::{Rib, SnapshotCell};
use pylon_transport::{ConnectionPool, PeerTransport, TransportStats};

#[derive(Parser)]
#[command(name = "pylon-node", about = "Pylon service mesh routing node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.pylon/config.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show node status (queries local admin API)
    Status,
    /// List peers
    Peers,
    /// List local and learned routes
    Routes,
    /// Advertise a local route
    RouteAdd {
        /// Route name
        name: String,
        /// Serving protocol (http, http:graphql, http:gql, http:grpc)
        #[arg(long, default_value = "http")]
        protocol: RouteProtocol,
        /// Backend endpoint URL
        #[arg(long)]
        endpoint: String,
        /// Region label
        #[arg(long)]
        region: Option<String>,
        /// Free-form tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Withdraw a local route
    RouteDel {
        name: String,
        #[arg(long, default_value = "http")]
        protocol: RouteProtocol,
    },
    /// Register a peer and open a session to it
    PeerAdd {
        name: String,
        /// Peer RPC endpoint (http(s):// or ws(s)://)
        #[arg(long)]
        endpoint: String,
        /// Domain served by the peer, repeatable
        #[arg(long = "domain")]
        domains: Vec<String>,
        /// Credential for dialing this peer (defaults to the mesh token)
        #[arg(long)]
        peer_token: Option<String>,
    },
    /// Remove a peer and withdraw its routes
    PeerDel { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
        Some(Commands::Status) => {
            cli_api_call(&cfg, "/api/v1/status", None).await?;
        }
        Some(Commands::Peers) => {
            cli_api_call(&cfg, "/api/v1/peers", None).await?;
        }
        Some(Commands::Routes) => {
            cli_api_call(&cfg, "/api/v1/routes", None).await?;
        }
        Some(Commands::RouteAdd {
            name,
            protocol,
            endpoint,
            region,
            tags,
        }) => {
            let body = serde_json::json!({ "route": {
                "name": name,
                "protocol": protocol,
                "endpoint": endpoint,
                "region": region,
                "tags": tags,
            }});
            cli_api_call(&cfg, "/api/v1/routes/create", Some(body)).await?;
        }
        Some(Commands::RouteDel { name, protocol }) => {
            let body = serde_json::json!({ "name": name, "protocol": protocol });
            cli_api_call(&cfg, "/api/v1/routes/delete", Some(body)).await?;
        }
        Some(Commands::PeerAdd {
            name,
            endpoint,
            domains,
            peer_token,
        }) => {
            let body = serde_json::json!({ "peerInfo": {
                "name": name,
                "endpoint": endpoint,
                "domains": domains,
                "peerToken": peer_token,
            }});
            cli_api_call(&cfg, "/api/v1/peers/create", Some(body)).await?;
        }
        Some(Commands::PeerDel { name }) => {
            let body = serde_json::json!({ "name": name });
            cli_api_call(&cfg, "/api/v1/peers/delete", Some(body)).await?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "pylon_node=info,pylon_api=info,pylon_transport=info,pylon_rib=info".into()
    });
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Call the local admin API and print the JSON response. Reads are GET,
/// mutations POST a body.
async fn cli_api_call(
    cfg: &NodeConfig,
    path: &str,
    body: Option<serde_json::Value>,
) -> anyhow::Result<()> {
    let url = format!("http://{}{}", cfg.api.admin_addr, path);

    let token_path = expand_tilde(&cfg.api.admin_token_file);
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let request = match body {
        Some(body) => client.post(&url).json(&body),
        None => client.get(&url),
    };
    let resp = request
        .header("Authorization", format!("Bearer {}", token))
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let defaults = cfg.protocol_defaults();

    let admin_token = load_or_create_token(&expand_tilde(&cfg.api.admin_token_file))?;
    let peer_token = match &cfg.node.peer_token {
        Some(token) => token.clone(),
        None => load_or_create_token(&expand_tilde(&cfg.node.peer_token_file))?,
    };

    tracing::info!(
        node = %cfg.node.name,
        version = env!("CARGO_PKG_VERSION"),
        endpoint = cfg.node.endpoint.as_deref().unwrap_or("(none)"),
        hold_time_secs = defaults.hold_time_secs,
        seeded_peers = cfg.peers.len(),
        "starting pylon-node"
    );

    let rib = Rib::new(cfg.node.name.clone(), defaults);
    let snapshots = Arc::new(SnapshotCell::new());
    let pool = ConnectionPool::new(
        Duration::from_secs(cfg.transport.connect_timeout_secs),
        Duration::from_secs(cfg.transport.rpc_timeout_secs),
    )?;
    let stats = Arc::new(TransportStats::new());
    let transport = PeerTransport::new(
        cfg.local_identity(),
        Some(peer_token.clone()),
        pool.clone(),
        Arc::clone(&stats),
    );

    let (action_tx, action_rx) = tokio::sync::mpsc::channel(256);
    let (batch_tx, batch_rx) = tokio::sync::mpsc::channel(256);
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let handle = ActionHandle::new(action_tx);

    let state = Arc::new(AppState {
        node_name: cfg.node.name.clone(),
        admin_token,
        peer_token,
        start_time: std::time::Instant::now(),
        handle: handle.clone(),
        snapshots: Arc::clone(&snapshots),
        transport_stats: stats,
    });

    let seed_peers: Vec<PeerInfo> = cfg.peers.iter().map(config::PeerEntry::to_peer_info).collect();

    // Spawn the RIB task (single writer)
    let rib_handle = {
        let snapshots = Arc::clone(&snapshots);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(rib_task::run_rib_loop(
            rib, action_rx, snapshots, batch_tx, seed_peers, shutdown,
        ))
    };

    // Spawn the outbound dispatcher
    let outbound_handle = {
        let handle = handle.clone();
        let pool = pool.clone();
        tokio::spawn(outbound::run_outbound_loop(transport, handle, pool, batch_rx))
    };

    // Peer RPC server
    let rpc_handle = {
        let router = rpc_router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind(&cfg.api.rpc_addr).await?;
        tracing::info!(addr = %cfg.api.rpc_addr, "peer RPC listening");
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let mut shutdown = shutdown;
                    let _ = shutdown.recv().await;
                })
                .await
                .ok();
        })
    };

    // Admin API server
    let admin_handle = {
        let router = admin_router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind(&cfg.api.admin_addr).await?;
        tracing::info!(addr = %cfg.api.admin_addr, "admin API listening");
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let mut shutdown = shutdown;
                    let _ = shutdown.recv().await;
                })
                .await
                .ok();
        })
    };

    tracing::info!("all tasks spawned, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    let _ = shutdown_tx.send(());

    // The RIB task flushes close notices through the dispatcher; both
    // always terminate. The servers may be pinned by open peer sockets, so
    // their drain gets a bound.
    let _ = tokio::join!(rib_handle, outbound_handle);
    let servers = async {
        let _ = tokio::join!(rpc_handle, admin_handle);
    };
    if tokio::time::timeout(Duration::from_secs(5), servers).await.is_err() {
        tracing::warn!("server tasks still draining, exiting anyway");
    }

    tracing::info!("shutdown complete");
    Ok(())
}
