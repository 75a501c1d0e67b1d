//! Bearer-token authentication
//!
//! The API treats the validated token claims as an opaque current-user
//! identity: `sub` is the user id, nothing else is inspected here.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// The authenticated caller, inserted as a request extension
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Uuid,
    #[allow(dead_code)]
    exp: usize,
}

/// Middleware: require a valid bearer token, expose `AuthUser` downstream
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized)?;

    request.extensions_mut().insert(AuthUser {
        user_id: data.claims.sub,
    });

    Ok(next.run(request).await)
}
