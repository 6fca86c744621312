//! Parley Gateway: serves voice sessions over WebSocket.
//!
//! Routes:
//! - `GET /health`: liveness and active session count
//! - `GET /ws/audio`: WebSocket upgrade, one voice session per connection
//! - `GET /sessions`: live sessions and their phases
//! - `DELETE /sessions/:id`: terminate a session

mod config;
mod ws;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use crate::config::GatewayConfig;
use parley_voice::{Adapters, DefaultNormalizer, SessionInfo, SessionManager, StagingArea};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load().context("loading gateway config")?;
    let staging = config
        .staging_dir
        .clone()
        .map(StagingArea::new)
        .unwrap_or_default();
    let normalizer = DefaultNormalizer::new(staging).with_ffmpeg(config.ffmpeg.clone());
    let adapters = Adapters::from_env(normalizer);
    let manager = SessionManager::new(adapters, config.session.clone())
        .context("invalid session configuration")?;

    let app = build_app(AppState {
        manager: manager.clone(),
    });

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(target: "parley::gateway", "Parley gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal(manager: SessionManager) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "parley::gateway", "ctrl-c handler failed: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "parley::gateway", "Shutdown requested (Ctrl+C received)");
    manager.shutdown();
}

fn build_app(state: AppState) -> Router {
    // Browser clients connect from any origin.
    let cors = CorsLayer::permissive();

    Router::new()
        .route("/health", get(health))
        .route("/ws/audio", get(ws::ws_audio))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", delete(terminate_session))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_sessions": state.manager.active_sessions(),
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.manager.sessions())
}

async fn terminate_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.manager.terminate(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
