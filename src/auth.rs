//! `X-API-Key` authentication middleware: every endpoint requires the header
//! to match the configured shared secret, compared in constant time to avoid
//! leaking key bytes through response timing.

use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub api_key: String,
}

pub fn create_auth_state(config: &ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState {
        api_key: config.api_key.clone(),
    })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": "Invalid API key" })),
    )
        .into_response()
}

pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    // CORS preflight requests carry no custom headers; let them through.
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            warn!(path = request.uri().path(), "missing X-API-Key header");
            unauthorized()
        })?;

    let matches: bool = provided
        .as_bytes()
        .ct_eq(auth_state.api_key.as_bytes())
        .into();
    if !matches {
        warn!(path = request.uri().path(), "invalid X-API-Key header");
        return Err(unauthorized());
    }

    Ok(next.run(request).await)
}
