// =============================================================================
// REST API Endpoints: Axum 0.7, read-only
// =============================================================================
//
// All endpoints live under `/api/v1/`. The surface is strictly read-only:
// statistics, state and trade exports keep serving in SAFE_MODE and during
// invariant lockouts. CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::engine_state::EngineState;
use crate::types::now_ms;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/trades", get(trades_json))
        .route("/api/v1/trades.csv", get(trades_csv))
        .route("/api/v1/trades.jsonl", get(trades_jsonl))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/events", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    uptime_s: u64,
}

async fn health(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: now_ms(),
        uptime_s: state.start_time.elapsed().as_secs(),
    })
}

async fn full_state(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.portfolio.positions())
}

async fn trades_json(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.ledger.trades())
}

async fn trades_csv(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    let body = state.ledger.export_csv();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        body,
    )
}

async fn trades_jsonl(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    let body = state.ledger.export_json();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
}

async fn metrics(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.ledger.metrics(now_ms()))
}
