//! # Server
//!
//! Operations HTTP surface and process lifecycle: the axum router, the
//! delivery worker pool and graceful shutdown on Ctrl-C or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::engine::Engine;
use crate::executor::WorkerPool;
use crate::handlers;
use crate::telemetry;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub db: Arc<DatabaseConnection>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/stats", get(handlers::stats))
        .route("/ingest/{source_id}", post(handlers::ingest_event))
        .layer(middleware::from_fn(telemetry::propagate_request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API and run the worker pool until a shutdown signal arrives.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let db = Arc::new(db);
    let engine = Engine::from_config(&config, db.clone()).context("failed to build engine")?;

    let shutdown = CancellationToken::new();
    let pool = tokio::spawn(WorkerPool::new(engine.clone()).run(shutdown.clone()));

    let app = create_app(AppState { engine, db });
    let addr = config.bind_addr().context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, profile = %config.profile, "Server listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            signal_token.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    pool.await.context("worker pool task failed")?;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
