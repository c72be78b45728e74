//! Replication daemon: wires config -> credential provider -> stream
//! supervisor -> shutdown coordinator, and serves the minimal admin
//! surface spec §6 allows (`/health`, `/metrics`), grounded in
//! `bin/fc-dev/src/main.rs`'s monolith-wiring shape.

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rc_checkpoint::{CheckpointStore, FileCheckpointStore, MongoCheckpointStore};
use rc_config::{CheckpointBackend, ReplicatorConfig};
use rc_shutdown::ShutdownCoordinator;
use rc_supervisor::StreamSupervisor;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "replicatord")]
#[command(about = "Change data capture replication daemon")]
struct Args {
    /// Path to the structured TOML configuration document.
    #[arg(long, env = "REPLICATOR_CONFIG", default_value = "replicatord.toml")]
    config: String,

    /// Port the admin surface (/health, /metrics) listens on.
    #[arg(long, env = "REPLICATOR_ADMIN_PORT", default_value = "9090")]
    admin_port: u16,
}

#[derive(Clone)]
struct AdminState {
    supervisor: Arc<StreamSupervisor>,
    prometheus: PrometheusHandle,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("replicatord: startup failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = ReplicatorConfig::from_path(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;

    init_tracing(config.telemetry.log_json);
    info!(config = %args.config, "starting replicatord");

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;

    let shutdown = ShutdownCoordinator::new(Duration::from_secs(config.global.shutdown_deadline_secs));
    shutdown.install_panic_hook();

    let credential_provider =
        rc_auth::create_provider(config.auth.clone()).context("constructing credential provider")?;
    // Check at least twice within the refresh_before window so a token
    // never sits idle past it for more than half the window's length.
    let refresh_check_interval = Duration::from_secs((config.auth.refresh_before_secs.max(1) as u64 / 2).max(1));
    let refresh_handle = rc_auth::spawn_background_refresh(
        credential_provider.clone(),
        config.auth.scopes.clone(),
        refresh_check_interval,
        shutdown.subscribe(),
    );

    let checkpoint_store = build_checkpoint_store(&config).await.context("constructing checkpoint store")?;
    let supervisor = Arc::new(StreamSupervisor::new(checkpoint_store));
    for stream in &config.streams {
        supervisor.create(stream.clone())?;
    }
    supervisor.start_all().await?;

    register_shutdown_hooks(&shutdown, supervisor.clone()).await;

    let admin_state = AdminState { supervisor: supervisor.clone(), prometheus };
    let admin_app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(admin_state);

    let admin_addr = format!("0.0.0.0:{}", args.admin_port);
    let listener = TcpListener::bind(&admin_addr).await.with_context(|| format!("binding {admin_addr}"))?;
    info!(addr = %admin_addr, "admin surface listening");

    let mut admin_shutdown = shutdown.subscribe();
    let admin_handle = tokio::spawn(async move {
        let server = axum::serve(listener, admin_app);
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!(error = %e, "admin server error");
                }
            }
            _ = admin_shutdown.recv() => {
                info!("admin server shutting down");
            }
        }
    });

    ShutdownCoordinator::wait_for_signal().await;
    info!("shutdown signal received, initiating ordered teardown");
    shutdown.run().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;
    refresh_handle.abort();

    info!("replicatord shutdown complete");
    Ok(())
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_checkpoint_store(config: &ReplicatorConfig) -> rc_common::Result<Arc<dyn CheckpointStore>> {
    match config.checkpoint.backend {
        CheckpointBackend::File => Ok(Arc::new(FileCheckpointStore::new(&config.checkpoint.dir).await?)),
        CheckpointBackend::Mongo => {
            let uri = config.checkpoint.uri.as_deref().unwrap_or_default();
            let database = config.checkpoint.database.as_deref().unwrap_or_default();
            let collection = config.checkpoint.collection.as_deref().unwrap_or_default();
            let client = mongodb::Client::with_uri_str(uri)
                .await
                .map_err(|e| rc_common::ReplicatorError::fatal(format!("checkpoint mongo connect failed: {e}")))?;
            Ok(Arc::new(MongoCheckpointStore::new(client, database, collection)))
        }
    }
}

/// Registers the default shutdown hooks from spec §4.8. `stream_stop` is the
/// only hook with real work left to do once a stream's own `stop()` already
/// commits its final checkpoint and closes its sinks — `position_save`,
/// `metrics_flush`, and `database_cleanup` log their step for operational
/// visibility and parity with the documented hook set.
async fn register_shutdown_hooks(shutdown: &Arc<ShutdownCoordinator>, supervisor: Arc<StreamSupervisor>) {
    shutdown
        .register("position_save", rc_shutdown::PRIORITY_POSITION_SAVE, Duration::from_secs(10), || async {
            info!("shutdown: per-stream checkpoints are committed by the stream_stop hook");
            Ok(())
        })
        .await;
    shutdown
        .register("metrics_flush", rc_shutdown::PRIORITY_METRICS_FLUSH, Duration::from_secs(5), || async {
            info!("shutdown: flushing pending telemetry");
            Ok(())
        })
        .await;
    shutdown
        .register("database_cleanup", rc_shutdown::PRIORITY_DATABASE_CLEANUP, Duration::from_secs(5), || async {
            info!("shutdown: releasing source/sink connection handles on worker stop");
            Ok(())
        })
        .await;
    shutdown
        .register("stream_stop", rc_shutdown::PRIORITY_STREAM_STOP, Duration::from_secs(30), move || {
            let supervisor = supervisor.clone();
            async move { supervisor.stop_all(Duration::from_secs(30)).await }
        })
        .await;
}

async fn health_handler(State(state): State<AdminState>) -> Response {
    let report = state.supervisor.health().await;
    let status = match report.status {
        rc_common::HealthStatus::Healthy | rc_common::HealthStatus::Degraded => StatusCode::OK,
        rc_common::HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler(State(state): State<AdminState>, Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("format").map(String::as_str) {
        Some("json") => {
            let states = state.supervisor.list().await;
            Json(states).into_response()
        }
        _ => state.prometheus.render().into_response(),
    }
}
