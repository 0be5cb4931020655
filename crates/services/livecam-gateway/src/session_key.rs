//! Device and session identifiers
//!
//! Session IDs double as directory names under the output root and as token
//! subjects, so both generated and externally supplied IDs are restricted to
//! a fixed `sess_<device-tag>_<nonce>` shape over `[a-z0-9_]`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

const SESSION_PREFIX: &str = "sess_";
const DEVICE_TAG_LEN: usize = 8;
const NONCE_LEN: usize = 16;
const MAX_DEVICE_ID_LEN: usize = 64;

/// Caller-supplied handle naming a capture source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Validate a device identifier: 1..=64 chars of `[A-Za-z0-9_-]`
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_DEVICE_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(IdError::InvalidDevice(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u32> for DeviceId {
    fn from(index: u32) -> Self {
        Self(index.to_string())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one encoder run for one device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Parse an externally supplied session ID, accepting only the generated shape
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let invalid = || IdError::InvalidSession(raw.to_string());

        let rest = raw.strip_prefix(SESSION_PREFIX).ok_or_else(invalid)?;
        let (tag, nonce) = rest.split_once('_').ok_or_else(invalid)?;
        if tag.len() != DEVICE_TAG_LEN || nonce.len() != NONCE_LEN {
            return Err(invalid());
        }
        if !tag.bytes().chain(nonce.bytes()).all(is_lower_hex) {
            return Err(invalid());
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// Derive the session ID for one start of `device`.
///
/// Pure: the registry passes a fresh nonce per start, so an ID is stable for
/// one start→stop cycle and distinct across cycles. The device tag keeps IDs
/// of the same camera recognisable in directory listings.
pub fn derive_session_id(device: &DeviceId, nonce: Uuid) -> SessionId {
    let digest = Sha256::digest(device.as_str().as_bytes());
    let tag = &hex::encode(digest)[..DEVICE_TAG_LEN];
    let nonce = &nonce.simple().to_string()[..NONCE_LEN];

    SessionId(format!("{SESSION_PREFIX}{tag}_{nonce}"))
}

/// Identifier validation errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IdError {
    #[error("Invalid device identifier: {0:?}")]
    InvalidDevice(String),

    #[error("Invalid session identifier: {0:?}")]
    InvalidSession(String),
}
