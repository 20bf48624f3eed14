//! `POST /auth/token` — the bootstrap endpoint.
//!
//! Loopback-only: the `AuthGate` enforces both the loopback restriction and
//! the HMAC signature before this handler ever runs.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/token", post(create_token))
}

#[derive(Deserialize)]
struct CreateTokenRequest {
    device_id: String,
}

#[derive(Serialize)]
struct CreateTokenResponse {
    access_token: String,
    token_type: &'static str,
}

async fn create_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTokenRequest>,
) -> Result<Json<CreateTokenResponse>, AppError> {
    if body.device_id.trim().is_empty() {
        return Err(AppError::BadRequest("device_id must not be empty".into()));
    }

    let (token, _claims) = state.token_manager.create_token(&body.device_id).await?;

    Ok(Json(CreateTokenResponse { access_token: token, token_type: "bearer" }))
}
