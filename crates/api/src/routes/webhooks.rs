//! Gateway webhook endpoint
//!
//! Unauthenticated but signature-verified. Once the signature passes, the
//! delivery is always acknowledged with success: per-event failures are the
//! reconciler's problem to log, and returning an error here would only buy
//! gateway retry storms.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-gateway-signature";

pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing webhook signature".to_string()))?;

    // The body is never parsed before the signature checks out
    state
        .billing
        .webhooks
        .verify(&body, signature)
        .map_err(|_| ApiError::BadRequest("invalid webhook signature".to_string()))?;

    state.billing.webhooks.handle_event(&body).await;

    Ok(Json(json!({ "status": "success" })))
}
