//! Trigger Invocation Worker
//!
//! Relays the transactional outbox, dispatches staged invocations to their
//! targets and reclaims invocations whose response deadline has passed.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ETS_CONFIG` | - | Path of the TOML configuration file |
//! | `ETS_DATABASE_URL` | `postgres://localhost/ets` | PostgreSQL connection URL |
//! | `ETS_EVENT_BUS_QUEUE_URL` | - | SQS FIFO queue for produced events (required) |
//! | `ETS_CALLBACK_URL` | - | Completion endpoint handed to targets |
//! | `ETS_TRIGGERS_FILE` | - | JSON trigger catalog |
//! | `ETS_SCRIPT_KEY` | - | Base64 AES-256 key for script sources (required) |
//! | `ETS_METRICS_PORT` | `9090` | Metrics/health port |
//! | `ETS_LOG_JSON` | `false` | Emit JSON log lines |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use ets_config::EtsConfig;
use ets_engine::aws::{AwsInvoker, SqsEventBus};
use ets_engine::catalog::StaticTriggerCatalog;
use ets_engine::crypto::ScriptCipher;
use ets_engine::repository::PgStore;
use ets_engine::service::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CompletionService, DispatchAdapter,
    DispatchRouter, ExpiryService,
};
use ets_outbox::postgres::PostgresOutboxRepository;
use ets_outbox::{EventBus, OutboxPublisher};

/// Trigger Invocation Worker
#[derive(Parser, Debug)]
#[command(name = "ets-worker")]
#[command(about = "Outbox relay, invocation dispatch and deadline expiry")]
struct Args {
    /// TOML configuration file; defaults plus ETS_* variables when absent
    #[arg(long, env = "ETS_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    metrics: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EtsConfig::load(path)?,
        None => EtsConfig::from_env()?,
    };

    ets_common::logging::init(config.logging.json);
    info!("Starting trigger invocation worker");

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics recorder: {}", e))?;

    if config.event_bus.queue_url.is_empty() {
        anyhow::bail!("event_bus.queue_url (ETS_EVENT_BUS_QUEUE_URL) is required");
    }
    let script_key = config
        .secrets
        .script_key
        .as_deref()
        .context("secrets.script_key (ETS_SCRIPT_KEY) is required")?;
    let cipher = Arc::new(ScriptCipher::from_base64_key(script_key)?);

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Storage
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let store = Arc::new(PgStore::new(pool.clone()));
    store.init_schema().await?;
    let outbox = Arc::new(PostgresOutboxRepository::new(pool.clone()));
    outbox.init_schema().await?;
    info!("PostgreSQL stores initialized");

    // Catalog
    let catalog = match &config.catalog.triggers_file {
        Some(path) => StaticTriggerCatalog::from_json_file(path)?,
        None => {
            warn!("No trigger catalog configured; every invocation will be rejected");
            StaticTriggerCatalog::new(Vec::new())
        }
    };
    info!(triggers = catalog.len(), "Trigger catalog loaded");
    let catalog = Arc::new(catalog);

    // AWS collaborators
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let downstream: Arc<dyn EventBus> = Arc::new(SqsEventBus::new(
        aws_sdk_sqs::Client::new(&aws_config),
        config.event_bus.queue_url.clone(),
    ));
    let invoker = Arc::new(AwsInvoker::new(&aws_config));
    info!(queue_url = %config.event_bus.queue_url, "Event bus initialized");

    // Engine
    let publisher = Arc::new(OutboxPublisher::new(outbox));
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::from(
        &config.circuit_breaker,
    )));
    let completion = Arc::new(CompletionService::new(
        store.clone(),
        store.clone(),
        catalog,
        breakers.clone(),
        store.clone(),
        publisher.clone(),
    ));
    let dispatcher = Arc::new(DispatchAdapter::new(
        breakers.clone(),
        invoker,
        cipher,
        completion,
        store.clone(),
        publisher.clone(),
        config.dispatch.clone(),
    ));
    let router: Arc<dyn EventBus> = Arc::new(DispatchRouter::new(dispatcher, downstream));
    let expiry = ExpiryService::new(store.clone(), store, breakers, publisher.clone());

    // Start outbox relay
    let publisher_handle = {
        let publisher = publisher.clone();
        let sweep_interval = config.outbox.sweep_interval();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            publisher.run(router, sweep_interval, shutdown_rx).await;
        })
    };

    // Start expiry sweep
    let expiry_handle = {
        let interval = config.expiry.interval();
        let batch_size = config.expiry.batch_size as usize;
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            expiry.run(interval, batch_size, shutdown_rx).await;
        })
    };

    // Start metrics server
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.server.metrics_port));
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .with_state(AppState { pool, metrics });

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("Trigger invocation worker started");

    // Wait for shutdown
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = publisher_handle.await;
        let _ = expiry_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("Trigger invocation worker shutdown complete");
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, axum::Json(serde_json::json!({ "status": "READY" }))),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(serde_json::json!({ "status": "NOT_READY" })),
            )
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
