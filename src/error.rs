//! Unified error types
//!
//! One taxonomy for the whole gateway. Each kind maps to a stable HTTP
//! status and a stable error-code string in the JSON envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

/// Application-wide error kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient quota: {0}")]
    InsufficientQuota(String),

    /// No channel can serve (group, model) under the current filters.
    #[error("no candidate channel: {0}")]
    NoCandidate(String),

    /// Upstream failure that is worth retrying on another channel.
    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    /// Upstream failure that will not improve with a retry.
    #[error("upstream permanent error: {0}")]
    UpstreamPermanent(String),

    /// A terminal transaction was asked to transition again.
    #[error("transaction already finalized: {0}")]
    AlreadyFinalized(String),

    /// A transaction update named a column outside the allow-list.
    #[error("unsupported field: {0}")]
    UnsupportedField(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for the JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput(_) => "invalid_input",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::InsufficientQuota(_) => "insufficient_quota",
            GatewayError::NoCandidate(_) => "no_candidate",
            GatewayError::UpstreamTransient(_) => "upstream_transient",
            GatewayError::UpstreamPermanent(_) => "upstream_error",
            GatewayError::AlreadyFinalized(_) => "already_finalized",
            GatewayError::UnsupportedField(_) => "unsupported_field",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::InsufficientQuota(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::NoCandidate(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamPermanent(_) => StatusCode::BAD_GATEWAY,
            GatewayError::AlreadyFinalized(_) => StatusCode::CONFLICT,
            GatewayError::UnsupportedField(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the dispatcher may try another channel after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GatewayError::UpstreamTransient(_))
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Internal(format!("database error: {}", e))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Internal(format!("json error: {}", e))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            crate::logger::error("gateway", &self.to_string());
        }
        let body = Json(serde_json::json!({
            "error": {
                "type": self.code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_are_stable() {
        let cases = [
            (
                GatewayError::InsufficientQuota("t".into()),
                "insufficient_quota",
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                GatewayError::NoCandidate("t".into()),
                "no_candidate",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::AlreadyFinalized("t".into()),
                "already_finalized",
                StatusCode::CONFLICT,
            ),
            (
                GatewayError::UnsupportedField("t".into()),
                "unsupported_field",
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status);
        }
    }

    #[test]
    fn only_transient_is_retriable() {
        assert!(GatewayError::UpstreamTransient("x".into()).is_retriable());
        assert!(!GatewayError::UpstreamPermanent("x".into()).is_retriable());
        assert!(!GatewayError::NoCandidate("x".into()).is_retriable());
    }
}
