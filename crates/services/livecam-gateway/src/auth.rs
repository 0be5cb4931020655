//! Control-plane authentication
//!
//! Starting, stopping and URL issuance are operator actions. When a control
//! secret is configured they require `Authorization: Bearer <jwt>` signed
//! with it (HS256). This is separate from playback tokens, which use their
//! own secret and are only ever checked against artifact reads.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::error::GatewayError;

/// Operator token claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorClaims {
    /// Operator name
    pub sub: String,

    /// Expiration timestamp (Unix epoch)
    pub exp: i64,
}

/// Verifies operator bearer tokens
pub struct ControlAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl ControlAuth {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint an operator token, e.g. for provisioning scripts
    pub fn issue(&self, operator: &str, ttl_seconds: i64) -> Result<String, GatewayError> {
        let claims = OperatorClaims {
            sub: operator.to_string(),
            exp: (Utc::now() + Duration::seconds(ttl_seconds)).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| GatewayError::Unauthorized(e.to_string()))
    }

    /// Check an `Authorization` header value
    pub fn verify_header(&self, header: Option<&str>) -> Result<OperatorClaims, GatewayError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| GatewayError::Unauthorized("no bearer token".to_string()))?;

        decode::<OperatorClaims>(token.trim(), &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| GatewayError::Unauthorized(e.to_string()))
    }
}

/// Middleware guarding control routes
pub async fn require_operator(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(auth) = state.control_auth.as_ref() else {
        return next.run(request).await;
    };

    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth.verify_header(header) {
        Ok(claims) => {
            tracing::debug!(operator = %claims.sub, path = %request.uri().path(), "Operator authenticated");
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), error = %e, "Control request rejected");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_bearer() {
        let auth = ControlAuth::new("control-secret");
        let token = auth.issue("ops", 60).unwrap();

        let claims = auth.verify_header(Some(&format!("Bearer {}", token))).unwrap();
        assert_eq!(claims.sub, "ops");
    }

    #[test]
    fn test_missing_or_bad_bearer() {
        let auth = ControlAuth::new("control-secret");
        let other = ControlAuth::new("other-secret").issue("ops", 60).unwrap();

        assert!(auth.verify_header(None).is_err());
        assert!(auth.verify_header(Some("Basic abc")).is_err());
        assert!(auth.verify_header(Some(&format!("Bearer {}", other))).is_err());
    }

    #[test]
    fn test_expired_bearer() {
        let auth = ControlAuth::new("control-secret");
        let token = auth.issue("ops", -10).unwrap();

        assert!(matches!(
            auth.verify_header(Some(&format!("Bearer {}", token))),
            Err(GatewayError::Unauthorized(_))
        ));
    }
}
