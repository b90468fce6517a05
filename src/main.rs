//! Feedbridge - Supplier Feed Pipeline Worker
//!
//! HTTP worker driven step-by-step by the pipeline orchestrator: parses and
//! merges the supplier feeds into the product table, then renders the
//! marketplace exports from pinned templates.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use feedbridge_backend::api::{routes, AppState};
use feedbridge_backend::checkpoint::{CheckpointStore, HttpCheckpointBackend};
use feedbridge_backend::config::ServiceConfig;
use feedbridge_backend::middleware::request_logging;
use feedbridge_backend::storage::HttpObjectStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env().context("service configuration")?;

    let store = HttpObjectStore::new(&config.storage_url, &config.storage_service_key)
        .context("object store client")?;
    let backend =
        HttpCheckpointBackend::new(&config.checkpoint_rpc_url, &config.checkpoint_service_key)
            .context("checkpoint store client")?;
    let state = AppState {
        store: Arc::new(store),
        checkpoints: CheckpointStore::new(Arc::new(backend)),
        soft_budget: config.soft_budget,
    };

    let app = Router::new()
        .route("/worker", post(routes::invoke_worker))
        .route("/health", get(routes::health))
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "feedbridge worker listening");
    axum::serve(listener, app).await.context("server loop")?;
    Ok(())
}
