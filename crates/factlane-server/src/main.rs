use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use factlane_agents::{default_registry, HttpChatTransport, SearchConfig, WebSearchClient};
use factlane_queue::{EndpointRegistry, QueueRuntime};
use factlane_server::{build_router, ApiState};
use factlane_store::SqliteQueueStore;

const DRAIN_TIMEOUT_SECONDS: u64 = 30;

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,factlane_queue=info,factlane_server=info")),
        )
        .init();

    let db_path = std::env::var("FACTLANE_DB").unwrap_or_else(|_| "factlane.db".into());
    let addr = std::env::var("FACTLANE_ADDR").unwrap_or_else(|_| "127.0.0.1:5151".into());

    let store = SqliteQueueStore::open(&db_path)?;
    let registry = EndpointRegistry::load(store.clone()).await?;
    let transport = Arc::new(HttpChatTransport::new());
    let handlers = default_registry(transport.clone());
    let search = Arc::new(WebSearchClient::new(SearchConfig::default()));

    let runtime = QueueRuntime::start(store, registry, handlers, Some(search));
    let state = ApiState::from_runtime(&runtime, transport);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(build_router(state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, db = %db_path, "factlane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    runtime
        .shutdown(std::time::Duration::from_secs(DRAIN_TIMEOUT_SECONDS))
        .await;
    Ok(())
}
