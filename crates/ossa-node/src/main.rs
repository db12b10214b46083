//! ossa-node: run one agent on the mesh.
//!
//! Joins UADP discovery with the agent's manifest, optionally keeps a
//! WebSocket link to an endpoint, and logs what happens until Ctrl+C.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ossa_discovery::{DiscoveryEvent, UadpDiscoveryService};
use ossa_transport::{Transport, TransportEvent, WebSocketTransport};
use ossa_types::MeshConfig;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Run an OSSA agent node.
#[derive(Parser)]
#[command(name = "ossa-node", version, about = "Run an OSSA agent on the local mesh")]
struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent manifest (JSON). A throwaway identity is used if omitted.
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Announce the agent and stay on the mesh (default).
    Run {
        /// WebSocket endpoint; overrides `[websocket] url`.
        #[arg(long)]
        connect: Option<String>,
    },
    /// Query the mesh for agents offering every listed capability.
    Query {
        /// Required capabilities.
        #[arg(required = true)]
        capabilities: Vec<String>,
        /// How long to collect responses, in seconds.
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref());
    let metadata = match cli.manifest.as_deref() {
        Some(path) => config::load_manifest(path)?,
        None => config::default_metadata(),
    };
    let discovery = UadpDiscoveryService::new(metadata, config.discovery.clone());

    match cli.command.unwrap_or(Commands::Run { connect: None }) {
        Commands::Run { connect } => run(discovery, config, connect).await,
        Commands::Query { capabilities, wait } => query(discovery, capabilities, wait).await,
    }
}

async fn run(discovery: UadpDiscoveryService, config: MeshConfig, connect: Option<String>) -> anyhow::Result<()> {
    let mut discovery_events = discovery.subscribe();
    discovery.start().await.context("Failed to start discovery")?;

    let link = match connect.or_else(|| config.websocket.url.clone()) {
        Some(url) => {
            let capabilities = discovery
                .metadata()
                .capability_set()
                .into_iter()
                .map(str::to_string)
                .collect();
            let transport = WebSocketTransport::new(
                &url,
                discovery.agent_id(),
                capabilities,
                config.websocket.clone(),
                config.rpc.clone(),
            )?;
            // A failed first attempt keeps retrying in the background;
            // sends queue until the link is up.
            if let Err(e) = transport.connect().await {
                warn!(%url, error = %e, "WebSocket link unavailable");
            }
            Some(transport)
        }
        None => None,
    };
    let mut link_events = link.as_ref().map(|t| t.subscribe());

    info!(agent_id = %discovery.agent_id(), "Node running, press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = discovery_events.recv() => match event {
                Ok(event) => log_discovery_event(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Discovery events lagged"),
                Err(RecvError::Closed) => break,
            },
            event = recv_link_event(&mut link_events) => match event {
                Ok(event) => log_transport_event(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Transport events lagged"),
                Err(RecvError::Closed) => link_events = None,
            },
        }
    }

    info!("Shutting down");
    if let Some(transport) = link {
        transport.disconnect().await;
    }
    discovery.stop().await;
    Ok(())
}

async fn query(discovery: UadpDiscoveryService, capabilities: Vec<String>, wait: u64) -> anyhow::Result<()> {
    discovery.start().await.context("Failed to start discovery")?;
    let agents = discovery
        .discover(&capabilities, Duration::from_secs(wait))
        .await;
    discovery.stop().await;

    if agents.is_empty() {
        println!("No agents offer {}", capabilities.join(", "));
        return Ok(());
    }
    for agent in agents {
        let info = &agent.network_info;
        println!(
            "{}  {}  {}:{}  [{}]",
            agent.id(),
            agent.metadata.name,
            info.hostname,
            info.port,
            agent.metadata.capabilities.primary.join(", ")
        );
    }
    Ok(())
}

async fn recv_link_event(
    events: &mut Option<tokio::sync::broadcast::Receiver<TransportEvent>>,
) -> Result<TransportEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn log_discovery_event(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::AgentDiscovered(agent) => info!(
            agent_id = %agent.id(),
            name = %agent.metadata.name,
            ip = %agent.network_info.ip,
            port = agent.network_info.port,
            "Agent discovered"
        ),
        DiscoveryEvent::AgentLeft { agent_id } => info!(%agent_id, "Agent left"),
        DiscoveryEvent::AgentTimeout(agent) => info!(agent_id = %agent.id(), "Agent timed out"),
        other => info!(event = other.name(), "Discovery event"),
    }
}

fn log_transport_event(event: &TransportEvent) {
    match event {
        TransportEvent::Message(envelope) => info!(
            id = %envelope.id,
            from = %envelope.metadata.agent_id,
            kind = ?envelope.kind,
            "Message received"
        ),
        TransportEvent::Error(error) => warn!(%error, "Transport error"),
        other => info!(event = other.name(), "Transport event"),
    }
}
