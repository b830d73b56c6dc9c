//! EdgeMesh Node Daemon
//!
//! Runs a content-delivery edge node that:
//! - Holds one WebSocket link to a master and follows its commands
//! - Serves content to clients over HTTP, WebSocket, and WebRTC channels
//! - Aggregates delivery usage and reports it upstream
//! - Optionally discovers masters through ledger job posts

use clap::Parser;
use edgemesh_core::{MemoryContentStore, NodeMetadata};
use edgemesh_node::{
    init_metrics, ControllerServer, HealthState, JobSearchSession, MasterConnection,
    MetricsServer, NodeAgent, NodeConfig, StateStore, TransportSet, UsageAggregator,
    WsWireTransport, NODE_VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "edgemesh-node")]
#[command(about = "EdgeMesh content-delivery edge node daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Master WebSocket address (overrides config file)
    #[arg(short, long)]
    master: Option<String>,

    /// HTTP listener port (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Metrics HTTP port (overrides config file)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    info!("EdgeMesh node starting...");

    // Load configuration. Priority: CLI args > config.toml > env > defaults
    let config = NodeConfig::load_or_default(&cli.config)
        .with_overrides(cli.master, cli.port)
        .with_env_overrides();

    info!(
        node_id = %config.node.id,
        node_name = %config.node.name,
        http_port = config.transports.http.port,
        ws_port = config.transports.ws.port,
        ledger = config.ledger.enabled,
        "Configuration loaded"
    );

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        return Err(e.into());
    }

    // A ledger client is an external collaborator this binary does not ship.
    if config.ledger.enabled {
        error!("Ledger job search is enabled but this build carries no ledger provider");
        anyhow::bail!("ledger.enabled requires a ledger provider");
    }

    init_metrics();

    let health_state = Arc::new(RwLock::new(HealthState::default()));
    let metrics_port = cli.metrics_port.unwrap_or(config.metrics.port);
    if config.metrics.enabled {
        let metrics_server = MetricsServer::new(metrics_port)
            .map_err(|e| anyhow::anyhow!("Failed to create metrics server: {}", e))?;
        let health_path = config.metrics.health_path.clone();
        let metrics_path = config.metrics.metrics_path.clone();
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server
                .start(health_path, metrics_path, health_state)
                .await
            {
                error!(error = %e, "Metrics server failed");
            }
        });
        info!(port = metrics_port, "Metrics server started");
    }

    // Shared state and collaborators
    let state = Arc::new(StateStore::load_or_init(config.state_path()));
    let store = Arc::new(MemoryContentStore::new());
    let aggregator = Arc::new(UsageAggregator::new());
    let transports = Arc::new(TransportSet::new(
        &config.transports,
        store.clone(),
        aggregator.clone(),
    ));

    let wire = Arc::new(WsWireTransport::new(Duration::from_secs(
        config.master.connect_timeout_secs,
    )));
    let metadata = NodeMetadata {
        node_id: config.node.id.clone(),
        version: NODE_VERSION.to_string(),
        wallet_address: None,
        domain: config.node.domain.clone(),
        ports: transports.declared_ports(),
    };
    let master = MasterConnection::new(wire, store.clone(), None, metadata);

    // Direct mode only: job search needs a ledger provider.
    let jobs: Option<Arc<JobSearchSession>> = None;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    if config.controller.enabled {
        let controller = ControllerServer::new(
            config.controller.clone(),
            config.node.id.clone(),
            NODE_VERSION.to_string(),
            master.clone(),
            store.clone(),
            state.clone(),
            shutdown_tx.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = controller.serve().await {
                error!(error = %e, "Controller API failed");
            }
        });
    }

    let agent = NodeAgent::new(
        config.clone(),
        master,
        transports,
        aggregator,
        store,
        state,
        None,
        jobs,
        None,
    );

    // Print startup summary
    info!("========================================");
    info!("  EdgeMesh Node Running");
    info!("========================================");
    info!("  Node ID:     {}", config.node.id);
    info!("  Node Name:   {}", config.node.name);
    info!("  HTTP:        {}:{}", config.transports.http.bind_ip, config.transports.http.port);
    if config.transports.ws.enabled {
        info!("  WebSocket:   {}:{}", config.transports.ws.bind_ip, config.transports.ws.port);
    }
    if config.transports.webrtc.enabled {
        info!(
            "  WebRTC:      {}:{} (data {})",
            config.transports.webrtc.bind_ip,
            config.transports.webrtc.control_port,
            config.transports.webrtc.data_port
        );
    }
    if config.metrics.enabled {
        info!("  Metrics:     http://0.0.0.0:{}{}", metrics_port, config.metrics.metrics_path);
    }
    if !config.master.address.is_empty() {
        info!("  Master:      {}", config.master.address);
    }
    info!("========================================");
    info!("Press Ctrl+C to shut down");

    edgemesh_node::metrics::mark_node_up();

    let agent_task = tokio::spawn(agent.run(shutdown_rx));

    tokio::select! {
        result = agent_task => {
            match result {
                Ok(Ok(())) => info!("Agent finished"),
                Ok(Err(e)) => error!(error = %e, "Agent failed"),
                Err(e) => error!(error = %e, "Agent task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            if shutdown_tx.send(()).await.is_err() {
                warn!("Agent already stopped");
            }
            // Give services time to finish
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    edgemesh_node::metrics::mark_node_down();
    info!("EdgeMesh node stopped");
    Ok(())
}
