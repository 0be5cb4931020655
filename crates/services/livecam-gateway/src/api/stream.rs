//! Stream control endpoints
//!
//! Starting and stopping device encoders, minting playback URLs and listing
//! sessions.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::GatewayError;
use crate::registry::SessionInfo;
use crate::session_key::{DeviceId, IdError};

/// Device selector, either a capture index (`0`) or a name (`"front-door"`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DeviceParam {
    Index(u32),
    Name(String),
}

impl Default for DeviceParam {
    fn default() -> Self {
        DeviceParam::Index(0)
    }
}

impl DeviceParam {
    pub fn into_device_id(self) -> Result<DeviceId, IdError> {
        match self {
            DeviceParam::Index(index) => Ok(DeviceId::from(index)),
            DeviceParam::Name(name) => DeviceId::parse(&name),
        }
    }
}

/// Request body for start and stop
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    #[serde(default)]
    pub device_id: DeviceParam,
}

impl DeviceRequest {
    /// Parse a request body; an empty body selects device 0
    pub fn from_body(body: &[u8]) -> Result<Self, GatewayError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| GatewayError::BadRequest(e.to_string()))
    }
}

/// Query for `GET /stream/url`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlQuery {
    #[serde(default)]
    pub device_id: Option<String>,

    /// Token lifetime in seconds; clamped to the configured maximum
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlResponse {
    /// Relative playback URL including the token
    pub url: String,
    pub session_id: String,
    /// Token expiration (ISO 8601)
    pub expires_at: String,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

/// Start streaming a device
///
/// POST /stream/start
pub async fn start_stream(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, GatewayError> {
    let device = DeviceRequest::from_body(&body)?.device_id.into_device_id()?;
    let session_id = state.registry.start_session(&device).await?;

    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            session_id: session_id.to_string(),
            message: format!("Stream started for device {}", device),
        }),
    ))
}

/// Stop streaming a device
///
/// POST /stream/stop
pub async fn stop_stream(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, GatewayError> {
    let device = DeviceRequest::from_body(&body)?.device_id.into_device_id()?;
    let session_id = state.registry.stop_session(&device).await?;

    Ok(Json(StopResponse {
        session_id: session_id.to_string(),
        message: format!("Stream stopped for device {}", device),
    }))
}

/// Mint a playback URL for a live device
///
/// GET /stream/url?deviceId=0&ttl=300
pub async fn stream_url(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let device = match query.device_id.as_deref() {
        Some(raw) => DeviceId::parse(raw)?,
        None => DeviceId::from(0),
    };
    let ttl = query
        .ttl
        .unwrap_or(state.config.tokens.default_ttl_seconds);

    let access = state.registry.access_url(&device, ttl).await?;

    Ok(Json(UrlResponse {
        url: access.url,
        session_id: access.session_id.to_string(),
        expires_at: format_expiry(access.expires_at),
    }))
}

/// List all sessions
///
/// GET /stream/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry.sessions().await,
    })
}

fn format_expiry(epoch_seconds: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_seconds, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| epoch_seconds.to_string())
}


#[cfg(all(test, unix))]
mod router_tests {
    use super::super::build_router;
    use super::super::test_support::*;
    use crate::auth::ControlAuth;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const ENCODER_SCRIPT: &str =
        "printf '#EXTM3U\\n' > \"$OUTPUT_DIR/index.m3u8\"; exec sleep 30";

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_conflict_url_stop() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(ENCODER_SCRIPT, tmp.path(), Config::default());
        let router = build_router(app.state.clone());

        let (status, json) = send(&router, post_json("/stream/start", r#"{"deviceId": 0}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = json["sessionId"].as_str().unwrap().to_string();
        assert!(session_id.starts_with("sess_"));

        let (status, json) = send(&router, post_json("/stream/start", r#"{"deviceId": 0}"#)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "already_active");

        let (status, json) = send(
            &router,
            Request::get("/stream/url?deviceId=0&ttl=60")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let url = json["url"].as_str().unwrap();
        assert!(url.starts_with(&format!("/live/{}/index.m3u8?token=", session_id)));
        assert_eq!(json["expiresAt"], "2023-11-14T22:14:20+00:00");

        let (status, json) = send(
            &router,
            Request::get("/stream/sessions").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessions"].as_array().unwrap().len(), 1);

        let (status, json) = send(&router, post_json("/stream/stop", r#"{"deviceId": 0}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessionId"], session_id.as_str());

        let (status, json) = send(&router, post_json("/stream/stop", r#"{"deviceId": 0}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_active");

        app.state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_url_for_inactive_device_is_404() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(ENCODER_SCRIPT, tmp.path(), Config::default());
        let router = build_router(app.state);

        let (status, _) = send(
            &router,
            Request::get("/stream/url?deviceId=7").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_device_is_400() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(ENCODER_SCRIPT, tmp.path(), Config::default());
        let router = build_router(app.state);

        let (status, json) = send(
            &router,
            post_json("/stream/start", r#"{"deviceId": "../../etc"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_request");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_control_plane_requires_bearer_when_configured() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.auth.control_secret = Some("ops-secret".to_string());
        let app = test_app(ENCODER_SCRIPT, tmp.path(), config);
        let router = build_router(app.state.clone());

        let (status, json) = send(&router, post_json("/stream/start", "{}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "unauthorized");

        let token = ControlAuth::new("ops-secret").issue("ops", 60).unwrap();
        let request = Request::post("/stream/start")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::CREATED);

        // Health stays open
        let response = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        app.state.registry.shutdown().await;
    }
}
