//! API route definitions. Read-only status surface over the store and the
//! detection engine.

use crate::api::state::AppState;
use crate::baseline::BaselineError;
use crate::storage;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/findings", get(list_findings))
        .route("/triggers", get(list_triggers))
        .route("/stats", get(detection_stats))
        .route("/baseline", get(baseline))
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

async fn health() -> Json<Value> {
    envelope(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn list_findings(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let findings = storage::recent_findings(&state.pool, params.limit.unwrap_or(50))
        .map_err(internal_error)?;
    Ok(envelope(json!({ "total": findings.len(), "findings": findings })))
}

async fn list_triggers(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let triggers = storage::recent_triggers(&state.pool, params.limit.unwrap_or(50))
        .map_err(internal_error)?;
    Ok(envelope(json!({ "total": triggers.len(), "triggers": triggers })))
}

#[derive(Deserialize)]
struct StatsParams {
    hours: Option<u32>,
}

async fn detection_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let stats = state
        .engine
        .detection_stats(params.hours.unwrap_or(24))
        .map_err(internal_error)?;
    Ok(envelope(serde_json::to_value(stats).map_err(internal_error)?))
}

#[derive(Deserialize)]
struct BaselineParams {
    refresh: Option<bool>,
}

async fn baseline(
    State(state): State<AppState>,
    Query(params): Query<BaselineParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.baseline_stats(params.refresh.unwrap_or(false)) {
        Ok(stats) => Ok(envelope(serde_json::to_value(stats).map_err(internal_error)?)),
        Err(BaselineError::InsufficientData { needed, have }) => Ok(envelope(json!({
            "ready": false,
            "needed": needed,
            "have": have,
        }))),
        Err(e) => Err(internal_error(e)),
    }
}
