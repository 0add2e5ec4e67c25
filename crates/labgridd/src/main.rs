//! labgridd — the labgrid daemon.
//!
//! Single binary that assembles all labgrid subsystems:
//! - Object store (redb)
//! - Replica controller
//! - Scheduler / confirmer
//! - Worker health monitor
//! - Metrics exporter
//! - Assignment broker + admin REST API
//! - Driver and access-method registries
//!
//! # Usage
//!
//! ```text
//! labgridd serve --config /etc/labgrid/labgrid.toml --listen 0.0.0.0:8082
//! ```

mod config;

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use labgrid_api::{ApiState, build_router};
use labgrid_drivers::{AccessRegistry, DriverRegistry, EnvironmentDriver};
use labgrid_health::HealthMonitor;
use labgrid_metrics::{LabgridMetrics, MetricsExporter, Registry};
use labgrid_reconcile::Controller;
use labgrid_replicas::ReplicaController;
use labgrid_scheduler::EnvironmentScheduler;
use labgrid_state::StateStore;

use crate::config::{Config, ServeArgs};

const DEFAULT_LOG_FILTER: &str = "info,labgridd=debug,labgrid=debug";

#[derive(Parser)]
#[command(name = "labgridd", about = "labgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controllers, health monitor, broker and API in one process.
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve(args) => {
            let config = Config::resolve(&args)?;
            run_serve(config).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    info!(?config, "labgrid daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("failed to create data directory {}", config.data_dir.display())
    })?;
    let db_path = config.db_path();

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let (_driver, access) = select_drivers(&config)?;
    info!(
        driver = %config.environment_driver,
        access_methods = ?access.names(),
        "drivers selected"
    );

    let registry = Arc::new(Registry::new());
    let metrics = LabgridMetrics::register(&registry)?;

    let replicas = Controller::new(state.clone(), ReplicaController::new(state.clone()))
        .with_workers(config.reconcile_workers);
    let scheduler = Controller::new(state.clone(), EnvironmentScheduler::new(state.clone()))
        .with_workers(config.reconcile_workers);
    let health = HealthMonitor::new(
        state.clone(),
        config.lease_namespace.clone(),
        config.worker_monitor_period(),
    );
    let exporter = MetricsExporter::new(state.clone(), metrics.clone(), config.metrics_interval());

    // ── Start background tasks ─────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let rx = shutdown_rx.clone();
    tasks.spawn(async move { Ok(replicas.run(rx).await?) });
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { Ok(scheduler.run(rx).await?) });
    let rx = shutdown_rx.clone();
    tasks.spawn(async move {
        health.run(rx).await;
        Ok(())
    });
    let rx = shutdown_rx.clone();
    tasks.spawn(async move {
        exporter.run(rx).await;
        Ok(())
    });

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState::new(
        state,
        registry,
        metrics,
        config.lease_namespace.clone(),
    ));
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(addr = %config.listen, "API server starting");

    let mut server_rx = shutdown_rx.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_rx.changed().await;
        })
        .into_future();
    tokio::pin!(server);

    let exited = tokio::select! {
        result = &mut server => Some(result),
        _ = shutdown_signal() => None,
    };
    let _ = shutdown_tx.send(true);

    let served = match exited {
        Some(result) => result,
        None => {
            info!("shutdown signal received");
            match tokio::time::timeout(config.shutdown_timeout(), &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        timeout_secs = config.shutdown_timeout_secs,
                        "in-flight requests did not drain in time"
                    );
                    Ok(())
                }
            }
        }
    };

    // Wait for background tasks.
    let drained = tokio::time::timeout(config.shutdown_timeout(), async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "background task failed"),
                Err(e) => error!(error = %e, "background task panicked"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("background tasks did not stop in time");
    }

    served.context("API server failed")?;
    info!("labgrid daemon stopped");
    Ok(())
}

/// Resolve the configured environment driver from the built-in registry.
fn select_drivers(config: &Config) -> anyhow::Result<(Arc<dyn EnvironmentDriver>, AccessRegistry)> {
    let drivers = DriverRegistry::builtin();
    let driver = drivers.get(&config.environment_driver).with_context(|| {
        format!("available environment drivers: {}", drivers.names().join(", "))
    })?;
    Ok((driver, AccessRegistry::builtin()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
