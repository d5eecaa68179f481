use axum::extract::State;
use axum::Json;

use crate::app::AppState;
use crate::settings::keys;

use super::error::ApiError;

/// `GET /api/v1/status` — the `pels_status` summary, read straight from the
/// settings store rather than recomputed (§6.1).
pub async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    match state.settings.get(keys::PELS_STATUS).await {
        Ok(Some(v)) => Ok(Json(v)),
        Ok(None) => Err(ApiError::not_ready("status")),
        Err(e) => Err(ApiError {
            status: axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }),
    }
}

/// `GET /api/v1/plan` — the full last-built `DevicePlan` (§6.1).
pub async fn plan(State(state): State<AppState>) -> Result<Json<crate::domain::plan::DevicePlan>, ApiError> {
    match state.last_plan.read().await.clone() {
        Some(plan) => Ok(Json(plan)),
        None => Err(ApiError::not_ready("plan")),
    }
}
