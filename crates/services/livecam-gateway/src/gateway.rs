//! Artifact access gateway
//!
//! Every playlist or segment read goes through [`AccessGateway::serve`]:
//! the capability token is verified against the requested session first,
//! then the file name is checked lexically so no request can name a path
//! outside the session directory. Only then is the filesystem touched.

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

use crate::metrics::global_metrics;
use crate::session_key::SessionId;
use crate::token::{TokenCodec, TokenError};

const MAX_FILE_NAME_LEN: usize = 128;

/// Content of a served artifact
#[derive(Debug)]
pub enum ArtifactBody {
    /// Playlist text, rewritten with the caller's token
    Playlist(Bytes),

    /// Segment file, opened and streamed as-is
    File(tokio::fs::File),
}

/// A file from a session directory
#[derive(Debug)]
pub struct Artifact {
    pub body: ArtifactBody,
    /// Size in bytes when the artifact was opened
    pub len: u64,
    pub content_type: &'static str,
    /// Playlists are rewritten continuously and must not be cached
    pub is_manifest: bool,
}

/// Serves encoder output to token holders
pub struct AccessGateway {
    codec: Arc<TokenCodec>,
    output_root: PathBuf,
}

impl AccessGateway {
    pub fn new(codec: Arc<TokenCodec>, output_root: PathBuf) -> Self {
        Self { codec, output_root }
    }

    /// Read `file_name` from `session_id`'s output directory
    ///
    /// # Errors
    /// * `AccessError::Token` - token missing, invalid, expired or for another session
    /// * `AccessError::PathTraversal` - session ID or file name could escape the directory
    /// * `AccessError::NotFound` - no such artifact
    pub async fn serve(
        &self,
        session_id: &str,
        file_name: &str,
        token: &str,
    ) -> Result<Artifact, AccessError> {
        let result = self.serve_inner(session_id, file_name, token).await;

        match &result {
            Ok(artifact) => global_metrics().artifact_served(artifact.len),
            Err(e) if e.is_denial() => {
                global_metrics().access_denied();
                tracing::warn!(session_id = %session_id, file = %file_name, reason = %e, "Artifact access denied");
            }
            Err(e) => {
                tracing::debug!(session_id = %session_id, file = %file_name, error = %e, "Artifact not served");
            }
        }

        result
    }

    /// Count and log a request refused before it could reach [`AccessGateway::serve`]
    pub fn deny(&self, error: AccessError) -> AccessError {
        global_metrics().access_denied();
        tracing::warn!(reason = %error, "Artifact access denied");
        error
    }

    async fn serve_inner(
        &self,
        session_id: &str,
        file_name: &str,
        token: &str,
    ) -> Result<Artifact, AccessError> {
        self.codec.verify(token, session_id)?;

        let session_id = SessionId::parse(session_id)
            .map_err(|_| AccessError::PathTraversal(session_id.to_string()))?;
        check_file_name(file_name)?;

        let path = self.output_root.join(session_id.as_str()).join(file_name);
        let content_type = content_type_for(file_name);

        if file_name.ends_with(".m3u8") {
            let raw = tokio::fs::read(&path).await.map_err(read_error)?;
            let playlist = Bytes::from(append_token_to_uris(&String::from_utf8_lossy(&raw), token));
            return Ok(Artifact {
                len: playlist.len() as u64,
                body: ArtifactBody::Playlist(playlist),
                content_type,
                is_manifest: true,
            });
        }

        let file = tokio::fs::File::open(&path).await.map_err(read_error)?;
        let metadata = file.metadata().await.map_err(read_error)?;
        if !metadata.is_file() {
            return Err(AccessError::NotFound);
        }

        Ok(Artifact {
            body: ArtifactBody::File(file),
            len: metadata.len(),
            content_type,
            is_manifest: false,
        })
    }
}

fn read_error(e: std::io::Error) -> AccessError {
    match e.kind() {
        std::io::ErrorKind::NotFound => AccessError::NotFound,
        _ => AccessError::Io(e.to_string()),
    }
}

/// Carry the token onto every URI line of a playlist
///
/// Players resolve segment URIs relative to the playlist URL and drop its
/// query string, so without this every segment request would be denied.
pub fn append_token_to_uris(playlist: &str, token: &str) -> String {
    let mut out = String::with_capacity(playlist.len() + 64);
    for line in playlist.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            let sep = if trimmed.contains('?') { '&' } else { '?' };
            out.push_str(trimmed);
            out.push(sep);
            out.push_str("token=");
            out.push_str(token);
        }
        out.push('\n');
    }
    out
}

/// Reject anything but a plain file name
///
/// Purely lexical; does not consult the filesystem.
pub fn check_file_name(file_name: &str) -> Result<(), AccessError> {
    let rejected = file_name.is_empty()
        || file_name.len() > MAX_FILE_NAME_LEN
        || file_name.starts_with('.')
        || file_name.contains("..")
        || file_name.contains(['/', '\\', ':', '\0'])
        || file_name.chars().any(char::is_control);

    if rejected {
        return Err(AccessError::PathTraversal(file_name.to_string()));
    }
    Ok(())
}

/// MIME type by extension
pub fn content_type_for(file_name: &str) -> &'static str {
    match file_name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Artifact access errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AccessError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Path traversal rejected: {0:?}")]
    PathTraversal(String),

    #[error("Artifact not found")]
    NotFound,

    #[error("Failed to read artifact: {0}")]
    Io(String),
}

impl AccessError {
    /// Security rejections, all reported to callers as the same denial
    pub fn is_denial(&self) -> bool {
        matches!(self, AccessError::Token(_) | AccessError::PathTraversal(_))
    }
}
