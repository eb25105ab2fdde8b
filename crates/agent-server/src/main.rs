//! Weather agent HTTP Server
//!
//! Thin Axum adapter over the weather agent: one invoke endpoint keyed by
//! thread id, plus a health check.

mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{FileThreadStore, LlmProvider, MemoryThreadStore, ThreadStore};
use agent_runtime::OpenAiProvider;

use crate::handlers::{health_check, invoke_handler};
use crate::state::AppState;

/// Router with CORS and request tracing
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/invoke", post(invoke_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    // Initialize LLM provider; missing endpoint settings stop startup
    let provider = Arc::new(OpenAiProvider::from_env()?);
    match provider.health_check().await {
        Ok(true) => tracing::info!("✓ Connected to {}", provider.config().base_url),
        Ok(false) | Err(_) => {
            tracing::warn!("⚠ LLM endpoint not reachable - requests will fail");
            tracing::warn!("  Check LLM_API_URL and LLM_API_TOKEN in .env");
        }
    }

    // Thread store
    let store: Arc<dyn ThreadStore> = match std::env::var("THREAD_STORE_DIR") {
        Ok(dir) => {
            tracing::info!("Persisting threads under {}", dir);
            Arc::new(FileThreadStore::new(dir)?)
        }
        Err(_) => Arc::new(MemoryThreadStore::new()),
    };

    let agent = weather_agent::weather_agent(provider, store)?;
    tracing::info!("Registered {} tools:", agent.tools().len());
    for name in agent.tools().names() {
        tracing::info!("  • {}", name);
    }

    let state = AppState::new(agent);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🌤 weather agent server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health  - Health check");
    tracing::info!("  POST /invoke  - Run one conversation turn");

    axum::serve(listener, app(state)).await?;

    Ok(())
}
