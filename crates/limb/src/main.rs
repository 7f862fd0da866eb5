//! Limb
//!
//! Runs the adaptor connection fabric on this node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use limb::telemetry::{self, TelemetryConfig};
use limb::{LimbConfig, LoggingReconciler, Manager};

/// Limb adaptor connection fabric
#[derive(Parser, Debug)]
#[command(name = "limb")]
#[command(about = "Limb adaptor connection fabric", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the registration socket and adaptor sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Number of reconciliation workers (0 = available parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// Don't watch the socket directory for removed adaptors
    #[arg(long)]
    no_watch: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Push metrics to this OTLP collector
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("limb=info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = LimbConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket_dir) = args.socket_dir {
        config.socket_dir = socket_dir;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.no_watch {
        config.watch_sockets = false;
    }
    if let Some(endpoint) = args.otlp_endpoint {
        config.otlp_endpoint = Some(endpoint);
    }

    info!("Starting limb v{}", env!("CARGO_PKG_VERSION"));
    info!(
        socket_dir = %config.socket_dir.display(),
        workers = config.worker_count(),
        watch = config.watch_sockets,
        "Configuration loaded"
    );

    // Installed before the manager creates its instruments
    let meter_provider = telemetry::init_metrics(&TelemetryConfig::from_config(&config))
        .context("Failed to initialize metrics")?;

    let manager = Manager::new(config);
    let reconciler = Arc::new(LoggingReconciler);
    manager.register_adaptor_handler(reconciler.clone());
    manager.register_connection_handler(reconciler);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = manager.start(shutdown).await;

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            warn!(error = %e, "Failed to flush metrics");
        }
    }
    result.context("Fabric stopped with an error")?;

    info!("Limb shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }

    shutdown.cancel();
}
