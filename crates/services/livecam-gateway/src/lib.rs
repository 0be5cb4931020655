//! Live Camera Gateway
//!
//! Exposes capture devices as HLS streams. Each device gets at most one
//! encoder session at a time; playback URLs carry short-lived signed
//! capability tokens, and every playlist/segment read is checked against
//! them before bytes leave the output directory.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           livecam-gateway                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐                                                   │
//! │  │  HTTP API Server │ ← POST /stream/start, /stream/stop                │
//! │  │  (axum)          │ ← GET  /stream/url                                │
//! │  └───┬──────────┬───┘ ← GET  /live/:session_id/:file_name?token=...     │
//! │      │ control  │ artifacts                                             │
//! │      ▼          ▼                                                       │
//! │  ┌──────────┐  ┌────────────────┐   ┌──────────────────┐                │
//! │  │ Session  │  │ Access Gateway │──▶│  Token Codec     │                │
//! │  │ Registry │──┼────────────────┼──▶│  (jsonwebtoken)  │                │
//! │  └────┬─────┘  └───────┬────────┘   └──────────────────┘                │
//! │       │ spawns/stops   │ reads                                          │
//! │       ▼                ▼                                                │
//! │  ┌──────────────────┐   ┌───────────────────────────────┐               │
//! │  │ Encoder          │──▶│ <output_root>/<session-id>/   │               │
//! │  │ Supervisor       │   │   index.m3u8, segment*.ts     │               │
//! │  │ (ffmpeg child)   │   └───────────────────────────────┘               │
//! │  └──────────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod registry;
pub mod session_key;
pub mod supervisor;
pub mod token;
