//! Capability token issuance and verification
//!
//! Playback URLs carry a short-lived HS256 JWT bound to one session. The
//! token is self-contained: verification needs only the token, the session
//! being accessed and the server-held secret.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Scope carried by every playback token
pub const READ_SCOPE: &str = "stream:read";

/// Source of the current time in Unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually driven clock, for tests and replay tooling
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capability token claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenClaims {
    /// Session ID this token grants read access to
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds)
    pub exp: i64,

    /// Issue timestamp (Unix epoch seconds)
    pub iat: i64,

    /// Granted scope, always [`READ_SCOPE`]
    pub scope: String,
}

impl TokenClaims {
    /// Claims for `session_id` issued at `now`, valid for `ttl_seconds`
    pub fn new(session_id: &str, now: i64, ttl_seconds: u64) -> Self {
        Self {
            sub: session_id.to_string(),
            exp: now.saturating_add(i64::try_from(ttl_seconds).unwrap_or(i64::MAX)),
            iat: now,
            scope: READ_SCOPE.to_string(),
        }
    }

    /// A token is valid up to and including its `exp` second.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.exp
    }
}

/// A freshly minted token
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    /// Encoded JWT
    pub token: String,

    /// Expiration timestamp (Unix epoch seconds)
    pub expires_at: i64,
}

/// Mints and verifies capability tokens
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    clock: Arc<dyn Clock>,
    max_ttl_seconds: u64,
}

impl TokenCodec {
    /// Create a codec using the wall clock
    pub fn new(secret: &str, max_ttl_seconds: u64) -> Self {
        Self::with_clock(secret, max_ttl_seconds, Arc::new(SystemClock))
    }

    /// Create a codec with an explicit time source
    pub fn with_clock(secret: &str, max_ttl_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against our own clock so the boundary is exact
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            clock,
            max_ttl_seconds: max_ttl_seconds.max(1),
        }
    }

    /// Issue a token for `session_id` valid for `ttl_seconds`
    ///
    /// The TTL is clamped to `1..=max_ttl_seconds`.
    pub fn issue(&self, session_id: &str, ttl_seconds: u64) -> Result<IssuedToken, TokenError> {
        let ttl = ttl_seconds.clamp(1, self.max_ttl_seconds);
        let claims = TokenClaims::new(session_id, self.clock.now(), ttl);
        let token = self.encode_claims(&claims)?;

        Ok(IssuedToken {
            token,
            expires_at: claims.exp,
        })
    }

    /// Encode arbitrary claims with the codec's secret
    pub fn encode_claims(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Generation(e.to_string()))
    }

    /// Verify a token and check it is bound to `expected_session_id`
    ///
    /// # Errors
    /// * `TokenError::Malformed` - not a well-formed token for this service
    /// * `TokenError::Forged` - signature or algorithm does not match
    /// * `TokenError::Expired` - current time is past `exp`
    /// * `TokenError::SessionMismatch` - token is for another session
    pub fn verify(&self, token: &str, expected_session_id: &str) -> Result<TokenClaims, TokenError> {
        let data = decode::<TokenClaims>(token, &self.decoding, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => TokenError::Forged,
                _ => TokenError::Malformed(e.to_string()),
            },
        )?;
        let claims = data.claims;

        if claims.scope != READ_SCOPE {
            return Err(TokenError::Malformed(format!("unexpected scope {}", claims.scope)));
        }

        if claims.is_expired_at(self.clock.now()) {
            return Err(TokenError::Expired);
        }

        if claims.sub != expected_session_id {
            return Err(TokenError::SessionMismatch {
                expected: expected_session_id.to_string(),
                actual: claims.sub,
            });
        }

        Ok(claims)
    }
}

/// Token-related errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TokenError {
    #[error("Token has expired")]
    Expired,

    #[error("Token signature is invalid")]
    Forged,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Session ID mismatch: expected {expected}, got {actual}")]
    SessionMismatch { expected: String, actual: String },

    #[error("Token generation failed: {0}")]
    Generation(String),
}
