//! Health probe

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    // One round-trip proves the database is reachable
    sqlx::query("SELECT 1").execute(&state.pool).await?;

    Ok(Json(json!({ "status": "ok" })))
}
