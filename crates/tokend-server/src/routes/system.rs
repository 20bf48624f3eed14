//! Ambient system endpoints: an unauthenticated liveness probe and the
//! authenticated per-device stats read.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth_gate::AuthIdentity;
use crate::error::AppError;
use crate::state::AppState;
use tokend_core::repositories::StatsRepository;

/// Router for the unauthenticated health probe; mounted outside the
/// `AuthGate` layer.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new().route("/system/health", get(health))
}

/// Router for authenticated system endpoints; mounted behind the
/// `AuthGate` layer.
pub fn authenticated_router() -> Router<Arc<AppState>> {
    Router::new().route("/system/device/stats", get(device_stats))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    signing_key_store_initialized: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let signing_key_store_initialized = state.token_manager.signing_key_store_initialized().await;

    Json(HealthResponse { status: "ok", signing_key_store_initialized })
}

#[derive(Serialize)]
struct DeviceStatsResponse {
    device_id: String,
    request_count: i64,
    error_count: i64,
    endpoint_count: i64,
    last_activity: Option<DateTime<Utc>>,
}

async fn device_stats(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AuthIdentity>,
) -> Result<Json<DeviceStatsResponse>, AppError> {
    let device_id = identity.device_id.ok_or(AppError::BadRequest("device_id is required".into()))?;

    let stats = StatsRepository::get(state.db.pool(), &device_id).await?.ok_or(AppError::NotFound)?;

    Ok(Json(DeviceStatsResponse {
        device_id: stats.device_id,
        request_count: stats.request_count,
        error_count: stats.error_count,
        endpoint_count: stats.endpoint_count,
        last_activity: stats.last_activity,
    }))
}
