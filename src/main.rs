use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use portmesh::cluster::{Cluster, SimCluster};
use portmesh::config::KernelConfig;
use portmesh::node::{store_for, KernelHandle};
use portmesh::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "portmesh")]
#[command(version)]
#[command(about = "Coordination kernel: port registry, locking database and capacity-aware scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Boot the kernel on a simulated cluster
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Cluster topology (JSON)
    #[arg(long)]
    topology: PathBuf,

    /// Kernel config (JSON). Missing fields use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to persist the shared document. Kept in memory if omitted.
    #[arg(long)]
    state: Option<PathBuf>,

    /// Service catalog (JSON list), reloaded at startup
    #[arg(long)]
    services: Option<PathBuf>,

    /// Host the kernel runs on. Defaults to the topology root.
    #[arg(long)]
    hostname: Option<String>,

    /// Seconds between status log lines
    #[arg(long, default_value = "30")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cluster = Arc::new(SimCluster::load(&args.topology)?);
    let hostname = args.hostname.unwrap_or_else(|| cluster.root());

    let mut config = KernelConfig::for_host(args.config.as_deref(), hostname)?;
    if let Some(state) = args.state {
        config = config.with_state_path(state);
    }
    if let Some(services) = args.services {
        config = config.with_services_path(services);
    }

    tracing::info!(
        host = %config.hostname,
        nodes = cluster.hostnames().len(),
        state = ?config.database.state_path,
        services = ?config.scheduler.services_path,
        "Starting portmesh kernel"
    );

    let shutdown = install_shutdown_handler()?;
    let store = store_for(&config.database);
    let has_services = config.scheduler.services_path.is_some();
    let home = config.hostname.clone();
    let kernel = KernelHandle::start(config, cluster.clone(), store, shutdown.clone()).await?;

    cluster.copy_executable("portmesh-cli", &home);
    let cli = cluster.spawn("portmesh-cli", &home, 1, &[])?;
    let client = kernel.connect(cli);

    if has_services {
        match client.scheduler.reload_services(None).await {
            Ok(report) => tracing::info!(
                added = ?report.added,
                failed = ?report.failed,
                "Service catalog loaded"
            ),
            Err(e) => tracing::error!(error = %e, "Failed to load service catalog"),
        }
    }

    let mut status_interval = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = status_interval.tick() => {
                match client.scheduler.status().await {
                    Ok(status) => tracing::info!(
                        jobs = status.jobs.len(),
                        running_services = status.services.iter().filter(|s| s.is_running()).count(),
                        services = status.services.len(),
                        "Kernel status"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Status query failed"),
                }
            }
        }
    }

    kernel.shutdown().await;
    Ok(())
}
