//! julea-server -- brings up every configured backend in the server role
//! and holds them until SIGINT/SIGTERM.
//!
//! There is no transport here; the process exists so the storage layout
//! named by the configuration is initialized, kept alive and torn down
//! cleanly.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use julea::config::StorageKind;
use julea::{BackendRegistry, ConfigSource, Publisher, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Command-line arguments for the julea server.
#[derive(Parser, Debug)]
#[command(
    name = "julea-server",
    version,
    about = "Initialize julea storage backends in the server role"
)]
struct Cli {
    /// Port substituted for {PORT} in configured backend paths.
    #[arg(short, long, default_value_t = 4711)]
    port: u16,

    /// Configuration file. Defaults to the JULEA_CONFIG / XDG search.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Install the Prometheus recorder and print its output at shutdown.
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    if cli.metrics {
        julea::metrics::init_metrics()?;
        julea::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    if let Some(path) = &cli.config {
        info!("Loading configuration from {}", path.display());
        let publisher = Publisher::new(
            BackendRegistry::with_builtin(),
            ConfigSource::Path(path.clone()),
        );
        if julea::state::install_global(publisher).is_err() {
            anyhow::bail!("global publisher already installed");
        }
    }

    // Exits the process if any backend fails to come up.
    julea::init_as_server(cli.port);
    log_topology(cli.port);

    shutdown_signal().await;

    if let Some(report) = julea::state::global().shutdown(Role::Server) {
        if report.is_clean() {
            info!(closed = report.closed, "julea-server shut down");
        } else {
            for failure in &report.failures {
                warn!(component = %failure.component, error = %failure.error, "teardown failure");
            }
        }
    }

    if let Some(text) = julea::metrics::render() {
        info!("final metrics:\n{text}");
    }

    Ok(())
}

fn log_topology(port: u16) {
    let state = match julea::state::global().current() {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "no state after initialization");
            return;
        }
    };
    let cfg = state.configuration();
    info!(
        port,
        object_servers = cfg.object_server_count(),
        kv_servers = cfg.kv_server_count(),
        db_servers = cfg.db_server_count(),
        max_operation_size = cfg.max_operation_size(),
        "julea-server ready"
    );
    for instance in state.instances() {
        info!(
            kind = %instance.kind(),
            tier = ?instance.tier(),
            module = %instance.module().module_name(),
            path = %instance.path(),
            "backend"
        );
    }
    if state.tiers(StorageKind::Object).len() > 1 {
        info!(tiers = state.tiers(StorageKind::Object).len(), "object storage is tiered");
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
