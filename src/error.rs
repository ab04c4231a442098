use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

/// Convenience alias for results carried through the dispatch core.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Unified error type for the dispatch core.
///
/// HTTP status mapping happens once, at the API boundary (`IntoResponse` below) —
/// component code never reasons about status codes.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid API key")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("range not satisfiable")]
    RangeNotSatisfiable { file_size: u64 },

    #[error("upstream annotation store unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("lease store unavailable: {0}")]
    KvUnavailable(String),

    #[error("durable store unavailable: {0}")]
    DbUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        DispatchError::UpstreamUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        DispatchError::DbUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        DispatchError::KvUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for DispatchError {
    fn from(err: config::ConfigError) -> Self {
        DispatchError::Internal(err.to_string())
    }
}

impl DispatchError {
    fn status(&self) -> StatusCode {
        match self {
            DispatchError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchError::Forbidden => StatusCode::FORBIDDEN,
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            DispatchError::UpstreamUnavailable(_)
            | DispatchError::KvUnavailable(_)
            | DispatchError::DbUnavailable(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text message safe to return to the caller. Never includes
    /// stack traces, file paths, or the identity of a lease's current owner.
    fn detail(&self) -> String {
        match self {
            DispatchError::Forbidden => "Forbidden".to_string(),
            DispatchError::Unauthorized => "Invalid API key".to_string(),
            DispatchError::UpstreamUnavailable(_) => {
                "Upstream annotation store unavailable".to_string()
            }
            DispatchError::KvUnavailable(_) => "Lease store unavailable".to_string(),
            DispatchError::DbUnavailable(_) => "Durable store unavailable".to_string(),
            DispatchError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "detail": self.detail() }));
        if let DispatchError::RangeNotSatisfiable { file_size } = &self {
            return (status, [("Content-Range", format!("bytes */{file_size}"))], body)
                .into_response();
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_never_discloses_owner() {
        let err = DispatchError::Forbidden;
        assert_eq!(err.detail(), "Forbidden");
    }

    #[test]
    fn range_not_satisfiable_maps_to_416() {
        let err = DispatchError::RangeNotSatisfiable { file_size: 1000 };
        assert_eq!(err.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }
}
