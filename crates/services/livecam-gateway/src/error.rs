//! HTTP-facing error type
//!
//! Module errors are folded into [`GatewayError`] at the API boundary. Every
//! token or path rejection on the artifact plane produces the same 403 body,
//! so responses carry no hint about why a token was refused.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::gateway::AccessError;
use crate::registry::SessionError;
use crate::session_key::IdError;
use crate::token::TokenError;

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    InvalidId(#[from] IdError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl GatewayError {
    /// Status code and response body for this error
    pub fn to_response_parts(&self) -> (StatusCode, ErrorResponse) {
        match self {
            GatewayError::Session(SessionError::AlreadyActive { .. }) => (
                StatusCode::CONFLICT,
                ErrorResponse::new("already_active", self.to_string()),
            ),
            GatewayError::Session(SessionError::NotActive { .. }) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("not_active", self.to_string()),
            ),
            GatewayError::Session(SessionError::Launch(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("launch_failed", self.to_string()),
            ),
            GatewayError::Session(SessionError::Token(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("token_generation_failed", "Could not issue playback token"),
            ),
            GatewayError::Access(e) if e.is_denial() => (
                StatusCode::FORBIDDEN,
                ErrorResponse::new("access_denied", "Access denied"),
            ),
            GatewayError::Access(AccessError::NotFound) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("not_found", "Artifact not found"),
            ),
            GatewayError::Access(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("internal_error", "Failed to read artifact"),
            ),
            GatewayError::InvalidId(_) | GatewayError::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("invalid_request", self.to_string()),
            ),
            GatewayError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("unauthorized", "Missing or invalid bearer token"),
            ),
        }
    }
}

impl From<TokenError> for GatewayError {
    fn from(e: TokenError) -> Self {
        GatewayError::Access(AccessError::Token(e))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = self.to_response_parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::LaunchError;

    fn parts(e: impl Into<GatewayError>) -> (StatusCode, ErrorResponse) {
        e.into().to_response_parts()
    }

    #[test]
    fn test_session_error_statuses() {
        let (status, body) = parts(SessionError::AlreadyActive {
            device: "0".into(),
            session_id: "sess_x".into(),
        });
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "already_active");

        let (status, _) = parts(SessionError::NotActive { device: "0".into() });
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = parts(SessionError::Launch(LaunchError::Spawn("boom".into())));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_denials_are_indistinguishable() {
        let denials: Vec<GatewayError> = vec![
            TokenError::Expired.into(),
            TokenError::Forged.into(),
            TokenError::Malformed("x".into()).into(),
            TokenError::SessionMismatch {
                expected: "a".into(),
                actual: "b".into(),
            }
            .into(),
            AccessError::PathTraversal("../x".into()).into(),
        ];

        let expected = (
            StatusCode::FORBIDDEN,
            ErrorResponse::new("access_denied", "Access denied"),
        );
        for denial in denials {
            assert_eq!(denial.to_response_parts(), expected);
        }
    }

    #[test]
    fn test_bad_input_is_400() {
        let (status, body) = parts(IdError::InvalidDevice("../x".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_request");

        let (status, _) = GatewayError::BadRequest("not json".into()).to_response_parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_is_distinct() {
        let (status, body) = parts(AccessError::NotFound);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "not_found");
    }
}
