use axum::{Json, Router, extract::State, routing::get};

use crate::error::ApiError;
use crate::models::{ApiOk, AppState, OkData};

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Liveness plus a round trip to Postgres. No session required.
pub async fn health(State(state): State<AppState>) -> Result<Json<ApiOk<OkData>>, ApiError> {
    sqlx::query("SELECT 1")
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::Unavailable("STORE_UNAVAILABLE", format!("db error: {e}")))?;

    Ok(Json(ApiOk {
        data: OkData { ok: true },
    }))
}
