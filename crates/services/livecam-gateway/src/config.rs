//! Configuration for the Live Camera Gateway
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an optional TOML config file
pub const CONFIG_PATH_ENV: &str = "LIVECAM_CONFIG";

/// Main configuration for the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Capability token configuration
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Control-plane authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Encoder output storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Encoder process parameters
    #[serde(default)]
    pub encoder: EncoderConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_http_port() -> u16 {
    3001
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            host: default_host(),
        }
    }
}

/// Capability token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Secret key for signing playback tokens
    #[serde(default = "default_url_secret")]
    pub secret: String,

    /// Token lifetime used when a caller does not ask for one
    #[serde(default = "default_token_ttl")]
    pub default_ttl_seconds: u64,

    /// Upper bound on any requested token lifetime
    #[serde(default = "default_max_token_ttl")]
    pub max_ttl_seconds: u64,
}

/// Placeholder secret; startup logs a warning while it is in use.
pub const DEV_URL_SECRET: &str = "livecam-dev-secret-change-in-production";

fn default_url_secret() -> String {
    DEV_URL_SECRET.to_string()
}

fn default_token_ttl() -> u64 {
    300 // 5 minutes
}

fn default_max_token_ttl() -> u64 {
    3600 // 1 hour
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: default_url_secret(),
            default_ttl_seconds: default_token_ttl(),
            max_ttl_seconds: default_max_token_ttl(),
        }
    }
}

/// Control-plane authentication
///
/// When `control_secret` is set, `/stream/*` routes require an
/// `Authorization: Bearer <jwt>` header signed with it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub control_secret: Option<String>,
}

/// Encoder output storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; each session writes to `<output_root>/<session-id>/`
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./streams")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
        }
    }
}

/// Encoder process parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Encoder executable
    #[serde(default = "default_encoder_program")]
    pub program: String,

    /// Capture source path; `{device}` is replaced by the device identifier
    #[serde(default = "default_device_path_template")]
    pub device_path_template: String,

    /// Capture input format passed to the encoder (`-f`)
    #[serde(default = "default_input_format")]
    pub input_format: String,

    /// Capture frame rate
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Target HLS segment duration in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Number of segments kept in the playlist (older ones are deleted)
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,

    /// Playlist file name inside the session directory
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,

    /// How long a stopping encoder gets before it is killed
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_encoder_program() -> String {
    "ffmpeg".to_string()
}

fn default_device_path_template() -> String {
    "/dev/video{device}".to_string()
}

fn default_input_format() -> String {
    "v4l2".to_string()
}

fn default_framerate() -> u32 {
    30
}

fn default_segment_seconds() -> u32 {
    2
}

fn default_playlist_size() -> u32 {
    5
}

fn default_manifest_name() -> String {
    "index.m3u8".to_string()
}

fn default_stop_grace_ms() -> u64 {
    5000
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_encoder_program(),
            device_path_template: default_device_path_template(),
            input_format: default_input_format(),
            framerate: default_framerate(),
            segment_seconds: default_segment_seconds(),
            playlist_size: default_playlist_size(),
            manifest_name: default_manifest_name(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        // Server
        if let Ok(port) = std::env::var("LIVECAM_HTTP_PORT") {
            if let Ok(p) = port.parse() {
                config.server.http_port = p;
            }
        }
        if let Ok(host) = std::env::var("LIVECAM_HOST") {
            config.server.host = host;
        }

        // Tokens
        if let Ok(secret) = std::env::var("LIVECAM_URL_SECRET") {
            config.tokens.secret = secret;
        }
        if let Ok(ttl) = std::env::var("LIVECAM_URL_TTL") {
            if let Ok(t) = ttl.parse() {
                config.tokens.default_ttl_seconds = t;
            }
        }
        if let Ok(ttl) = std::env::var("LIVECAM_URL_MAX_TTL") {
            if let Ok(t) = ttl.parse() {
                config.tokens.max_ttl_seconds = t;
            }
        }

        // Auth
        if let Ok(secret) = std::env::var("LIVECAM_CONTROL_SECRET") {
            if !secret.is_empty() {
                config.auth.control_secret = Some(secret);
            }
        }

        // Storage
        if let Ok(root) = std::env::var("LIVECAM_OUTPUT_ROOT") {
            config.storage.output_root = PathBuf::from(root);
        }

        // Encoder
        if let Ok(program) = std::env::var("LIVECAM_ENCODER") {
            config.encoder.program = program;
        }
        if let Ok(template) = std::env::var("LIVECAM_DEVICE_TEMPLATE") {
            config.encoder.device_path_template = template;
        }
        if let Ok(grace) = std::env::var("LIVECAM_STOP_GRACE_MS") {
            if let Ok(g) = grace.parse() {
                config.encoder.stop_grace_ms = g;
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    /// Whether the placeholder URL secret is still in use
    pub fn uses_dev_secret(&self) -> bool {
        self.tokens.secret == DEV_URL_SECRET
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
