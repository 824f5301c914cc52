//! pvecsictl
//!
//! Migrate, rename and swap volumes provisioned by the PVE CSI driver.

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use pve_csi::kubernetes::KubeClient;
use pve_csi::logging::init_logging;
use pve_csi::migration::{Workflow, DEFAULT_MIGRATE_TIMEOUT};
use pve_csi::{ClusterPool, ClustersConfig, Error, DRIVER_NAME};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume maintenance for the PVE CSI driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cluster credentials file
    #[arg(long, env = "CLOUD_CONFIG", global = true, default_value = "/etc/proxmox/config.yaml")]
    cloud_config: PathBuf,

    /// Kubeconfig path; default configuration when unset
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Move a claim's disk to another hypervisor node
    Migrate {
        claim: String,
        target_node: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Evict pods using the claim
        #[arg(short, long)]
        force: bool,
        /// Relocation timeout in seconds
        #[arg(long, default_value_t = DEFAULT_MIGRATE_TIMEOUT)]
        timeout: u64,
    },

    /// Recreate a claim under a new name on the same volume
    Rename {
        old: String,
        new: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Evict pods using the claim
        #[arg(short, long)]
        force: bool,
    },

    /// Exchange the volumes of two claims
    Swap {
        first: String,
        second: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Evict pods using either claim
        #[arg(short, long)]
        force: bool,
    },
}

impl Command {
    fn namespace(&self) -> &str {
        match self {
            Command::Migrate { namespace, .. }
            | Command::Rename { namespace, .. }
            | Command::Swap { namespace, .. } => namespace,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(&cli.log_level, cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);

            let usage = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<Error>())
                .is_some_and(Error::is_usage);
            if usage {
                eprintln!("\n{}", Cli::command().render_usage());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ClustersConfig::from_file(&cli.cloud_config)
        .with_context(|| format!("loading {}", cli.cloud_config.display()))?;
    let pool = ClusterPool::new(&config).context("building cluster clients")?;
    let kube = KubeClient::connect(cli.kubeconfig.as_deref())
        .await
        .context("connecting to the orchestrator")?;

    let workflow = Workflow::new(Arc::new(kube), Arc::new(pool), DRIVER_NAME);
    workflow
        .check_permissions(cli.command.namespace())
        .await
        .context("checking permissions")?;

    match &cli.command {
        Command::Migrate {
            claim,
            target_node,
            namespace,
            force,
            timeout,
        } => workflow
            .migrate(namespace, claim, target_node, *force, Duration::from_secs(*timeout))
            .await
            .with_context(|| format!("migrating {}/{} to {}", namespace, claim, target_node)),

        Command::Rename {
            old,
            new,
            namespace,
            force,
        } => workflow
            .rename(namespace, old, new, *force)
            .await
            .with_context(|| format!("renaming {}/{} to {}", namespace, old, new)),

        Command::Swap {
            first,
            second,
            namespace,
            force,
        } => workflow
            .swap(namespace, first, second, *force)
            .await
            .with_context(|| format!("swapping {}/{} and {}", namespace, first, second)),
    }
}
