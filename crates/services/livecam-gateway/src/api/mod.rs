//! HTTP API for the Live Camera Gateway
//!
//! Control plane (operator bearer token when a control secret is configured):
//! - `POST /stream/start` - Start the encoder for a device
//! - `POST /stream/stop` - Stop a device's encoder
//! - `GET /stream/url` - Mint a signed playback URL
//! - `GET /stream/sessions` - List sessions
//!
//! Artifact plane (playback token in the query string):
//! - `GET /live/:session_id/:file_name` - Playlist or segment bytes
//!
//! - `GET /health`, `GET /metrics`

pub mod live;
pub mod stream;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{require_operator, ControlAuth};
use crate::config::Config;
use crate::gateway::AccessGateway;
use crate::metrics::{global_metrics, MetricsSnapshot};
use crate::registry::SessionRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub gateway: Arc<AccessGateway>,
    /// `None` leaves the control plane open
    pub control_auth: Option<Arc<ControlAuth>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gateway: Arc<AccessGateway>,
        config: Arc<Config>,
    ) -> Self {
        let control_auth = config
            .auth
            .control_secret
            .as_deref()
            .map(|secret| Arc::new(ControlAuth::new(secret)));

        Self {
            registry,
            gateway,
            control_auth,
            config,
        }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // Players are typically served from another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let control = Router::new()
        .route("/stream/start", post(stream::start_stream))
        .route("/stream/stop", post(stream::stop_stream))
        .route("/stream/url", get(stream::stream_url))
        .route("/stream/sessions", get(stream::list_sessions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    Router::new()
        .merge(control)
        .route("/live/:session_id/:file_name", get(live::serve_artifact))
        // Health and metrics
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Metrics endpoint
async fn metrics_handler() -> Json<MetricsSnapshot> {
    Json(global_metrics().snapshot())
}
