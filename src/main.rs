//! PVE CSI Driver
//!
//! Serves the Identity role plus either the Controller or the Node role of
//! the volume lifecycle protocol.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use pve_csi::csi::{
    router, serve, serve_health, ControllerService, CsiState, DeviceResolver, Endpoint,
    IdentityService, NodeService, SystemMounter,
};
use pve_csi::kubernetes::KubeClient;
use pve_csi::logging::init_logging;
use pve_csi::metrics::Metrics;
use pve_csi::{ClusterPool, ClustersConfig, DriverInfo, Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Controller,
    Node,
}

/// PVE CSI Driver - block volumes on Proxmox VE clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// RPC endpoint, unix:///path or tcp://host:port
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    csi_address: String,

    /// Role served next to Identity
    #[arg(long, env = "CSI_MODE", value_enum, default_value = "controller")]
    mode: Mode,

    /// Cluster credentials file (controller mode)
    #[arg(long, env = "CLOUD_CONFIG")]
    cloud_config: Option<PathBuf>,

    /// Orchestrator node this instance runs on (node mode)
    #[arg(long, env = "NODE_NAME")]
    node_id: Option<String>,

    /// Health and metrics bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Kubeconfig path; in-cluster configuration when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Probe every cluster before serving (controller mode)
    #[arg(long, env = "CHECK_CLUSTERS")]
    check_clusters: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    let driver = DriverInfo::default();
    let endpoint: Endpoint = args.csi_address.parse()?;

    info!("Starting {} {}", driver.name, driver.version);
    info!("  Mode: {:?}", args.mode);
    info!("  Endpoint: {}", endpoint);

    let metrics = Arc::new(Metrics::new()?);

    let (controller, node) = match args.mode {
        Mode::Controller => (Some(Arc::new(controller_service(&args).await?)), None),
        Mode::Node => (None, Some(Arc::new(node_service(&args).await?))),
    };

    let state = Arc::new(CsiState {
        identity: IdentityService::new(driver, args.mode == Mode::Controller),
        controller,
        node,
        metrics: metrics.clone(),
    });

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_health(&health_addr, metrics).await {
            error!("Health server error: {}", e);
        }
    });

    serve(&endpoint, router(state), shutdown_signal()).await?;

    info!("Driver shutdown complete");
    Ok(())
}

async fn controller_service(args: &Args) -> Result<ControllerService> {
    let path = args
        .cloud_config
        .as_deref()
        .ok_or_else(|| Error::Configuration("--cloud-config is required in controller mode".into()))?;

    let config = ClustersConfig::from_file(path)?;
    let pool = ClusterPool::new(&config)?;
    info!("Loaded {} clusters from {}", config.clusters.len(), path.display());

    if args.check_clusters {
        pool.check_all().await?;
    }

    Ok(ControllerService::new(Arc::new(pool)))
}

async fn node_service(args: &Args) -> Result<NodeService> {
    let node_id = args
        .node_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Configuration("--node-id is required in node mode".into()))?;

    let kube = KubeClient::connect(args.kubeconfig.as_deref()).await?;
    info!("  Node: {}", node_id);

    Ok(NodeService::new(
        node_id,
        Arc::new(kube),
        Arc::new(SystemMounter::new()),
        DeviceResolver::default(),
    ))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    info!("Shutdown signal received");
}
