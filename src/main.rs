use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use leasekeeper::daemon::{self, Daemon};
use leasekeeper::orchestrator::{KubeOrchestrator, Orchestrator};
use leasekeeper::{DaemonConfig, Error, Result};

/// Overall budget for the shutdown-path API calls.
const SHUTDOWN_API_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "leasekeeper")]
#[command(author, version, about = "DHCP lease daemon for container networking", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the RPC server and maintain leases until stopped.
    Daemon {
        #[arg(long, default_value = daemon::DEFAULT_SOCKET_PATH)]
        socket_path: PathBuf,

        #[arg(long, default_value = daemon::DEFAULT_LEASE_FILE)]
        lease_file: PathBuf,

        /// Prefix prepended to the socket path and to namespace paths from
        /// requests, for hosts mounted under a subdirectory.
        #[arg(long, default_value = "")]
        hostprefix: String,

        #[arg(long)]
        pidfile: Option<PathBuf>,

        /// Per-try timeout for each DHCP exchange, in seconds.
        #[arg(long, default_value_t = 10)]
        timeout: u64,

        /// Cumulative retry budget for one acquisition, in seconds.
        #[arg(long, default_value_t = 62)]
        resend_max: u64,

        /// Ask servers to broadcast their replies.
        #[arg(long)]
        broadcast: bool,
    },
    /// Mark this node's DHCP service unavailable and exit.
    Shutdown,
}

// The RPC server must stay pinned to one OS thread: lease workers join
// foreign network namespaces on other threads, and the accept loop must
// never be scheduled onto one of them.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Commands::Daemon {
            socket_path,
            lease_file,
            hostprefix,
            pidfile,
            timeout,
            resend_max,
            broadcast,
        } => {
            let config = DaemonConfig {
                socket_path,
                lease_file,
                hostprefix,
                pidfile,
                timeout: Duration::from_secs(timeout),
                resend_max: Duration::from_secs(resend_max),
                broadcast,
            };
            run_daemon(config).await
        }
        Commands::Shutdown => {
            shutdown().await;
            Ok(())
        }
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    config.validate()?;

    if let Some(pidfile) = &config.pidfile {
        std::fs::write(pidfile, format!("{}", std::process::id()))
            .map_err(|error| Error::ConfigInvalid(format!("writing pidfile: {}", error)))?;
    }

    let node = node_name()?;
    let orchestrator = Arc::new(KubeOrchestrator::from_cluster_env(None)?);
    let listener = daemon::listener_or_bind(&config.host_socket_path())?;

    let daemon = Arc::new(Daemon::new(config, orchestrator.clone()));
    daemon.reconcile().await?;

    orchestrator.set_node_offline(&node, false).await?;
    info!("daemon ready to receive requests");

    tokio::select! {
        result = Arc::clone(&daemon).run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, stopping");
            Ok(())
        }
    }
}

/// Best-effort: failures are logged and never block termination.
async fn shutdown() {
    let node = match node_name() {
        Ok(node) => node,
        Err(name_error) => {
            error!("{}", name_error);
            return;
        }
    };

    let orchestrator = match KubeOrchestrator::from_cluster_env(Some(SHUTDOWN_API_TIMEOUT)) {
        Ok(orchestrator) => orchestrator,
        Err(client_error) => {
            error!("failed to reach the orchestrator: {}", client_error);
            return;
        }
    };

    match orchestrator.set_node_offline(&node, true).await {
        Ok(()) => info!("marked node {} network-unavailable", node),
        Err(patch_error) => error!("failed to mark node offline: {}", patch_error),
    }
}

fn node_name() -> Result<String> {
    env::var("NODENAME")
        .map_err(|_| Error::ConfigInvalid("NODENAME environment variable is not set".to_string()))
}
