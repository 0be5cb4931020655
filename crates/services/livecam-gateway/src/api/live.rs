//! Artifact endpoint
//!
//! `GET /live/:session_id/:file_name?token=...`

use axum::{
    body::Body,
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::AppState;
use crate::error::GatewayError;
use crate::gateway::{AccessError, ArtifactBody};
use crate::token::TokenError;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Serve a playlist or segment to a token holder
///
/// Requests whose path or query cannot be extracted are denied the same
/// way as a bad token.
pub async fn serve_artifact(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<TokenQuery>, QueryRejection>,
) -> Result<Response, GatewayError> {
    let Path((session_id, file_name)) =
        path.map_err(|e| state.gateway.deny(AccessError::PathTraversal(e.body_text())))?;
    let Query(query) = query.map_err(|e| {
        state
            .gateway
            .deny(AccessError::Token(TokenError::Malformed(e.body_text())))
    })?;

    // A missing token fails verification like any other bad token
    let token = query.token.unwrap_or_default();
    let artifact = state.gateway.serve(&session_id, &file_name, &token).await?;

    let cache_control = if artifact.is_manifest {
        "no-cache"
    } else {
        "private, max-age=60"
    };
    let body = match artifact.body {
        ArtifactBody::Playlist(bytes) => Body::from(bytes),
        ArtifactBody::File(file) => Body::from_stream(ReaderStream::new(file)),
    };

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(artifact.content_type)),
            (header::CACHE_CONTROL, HeaderValue::from_static(cache_control)),
        ],
        body,
    )
        .into_response())
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::build_router;
    use super::super::test_support::*;
    use crate::config::Config;
    use crate::metrics::global_metrics;
    use crate::token::TokenCodec;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SESSION: &str = "sess_0123abcd_0123456789abcdef";

    async fn get(router: &Router, uri: &str) -> (StatusCode, Option<String>, bytes::Bytes) {
        let response = router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let cache = response
            .headers()
            .get(header::CACHE_CONTROL)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, cache, body)
    }

    fn setup() -> (TempDir, TestApp, Router, TokenCodec) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(SESSION);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.m3u8"), "#EXTM3U\nsegment00000.ts\n").unwrap();
        std::fs::write(dir.join("segment00000.ts"), [0x47u8; 376]).unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "outside").unwrap();

        let config = Config::default();
        let app = test_app("exec sleep 30", tmp.path(), config.clone());
        let router = build_router(app.state.clone());
        // Signs with the app's secret and clock
        let codec = TokenCodec::with_clock(
            &config.tokens.secret,
            config.tokens.max_ttl_seconds,
            app.clock.clone(),
        );
        (tmp, app, router, codec)
    }

    #[tokio::test]
    async fn test_valid_token_serves_manifest_and_segment() {
        let (_tmp, _app, router, codec) = setup();
        let token = codec.issue(SESSION, 300).unwrap().token;

        let (status, cache, body) =
            get(&router, &format!("/live/{}/index.m3u8?token={}", SESSION, token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cache.as_deref(), Some("no-cache"));
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(&format!("segment00000.ts?token={}", token)));

        let (status, _, body) = get(
            &router,
            &format!("/live/{}/segment00000.ts?token={}", SESSION, token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], &[0x47u8; 376][..]);
    }

    #[tokio::test]
    async fn test_extractor_rejections_are_counted_as_denials() {
        let (_tmp, _app, router, codec) = setup();
        let valid = codec.issue(SESSION, 300).unwrap().token;

        let before = global_metrics().snapshot().access_denied;
        let (status, _, _) = get(
            &router,
            &format!("/live/{}/index.m3u8?token={}&token=x", SESSION, valid),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(global_metrics().snapshot().access_denied > before);
    }

    #[tokio::test]
    async fn test_denials_share_one_body() {
        let (_tmp, app, router, codec) = setup();
        let valid = codec.issue(SESSION, 300).unwrap().token;
        let other = codec
            .issue("sess_0123abcd_fedcba9876543210", 300)
            .unwrap()
            .token;
        let short = codec.issue(SESSION, 10).unwrap().token;
        app.clock.advance(11);

        let uris = [
            format!("/live/{}/index.m3u8", SESSION),
            format!("/live/{}/index.m3u8?token=", SESSION),
            format!("/live/{}/index.m3u8?token=garbage", SESSION),
            format!("/live/{}/index.m3u8?token={}", SESSION, other),
            format!("/live/{}/index.m3u8?token={}", SESSION, short),
            format!("/live/{}/..%2Fsecret.txt?token={}", SESSION, valid),
            // Rejected by the extractors before the gateway runs
            format!("/live/{}/index.m3u8?token={}&token=x", SESSION, valid),
            format!("/live/{}/%FF?token={}", SESSION, valid),
        ];

        let mut bodies = Vec::new();
        for uri in &uris {
            let (status, _, body) = get(&router, uri).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
            bodies.push(body);
        }
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
        let json: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(json["error"], "access_denied");
        assert_eq!(json["message"], "Access denied");
    }

    #[tokio::test]
    async fn test_missing_segment_is_404() {
        let (_tmp, _app, router, codec) = setup();
        let token = codec.issue(SESSION, 300).unwrap().token;

        let (status, _, _) = get(
            &router,
            &format!("/live/{}/segment09999.ts?token={}", SESSION, token),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
