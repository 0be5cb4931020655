//! Session registry
//!
//! Authoritative table of encoder sessions keyed by device. A single lock
//! covers every check-then-act sequence, so two concurrent starts for the
//! same device cannot both pass the "not active" check. The lock is held
//! for bookkeeping and the (non-blocking) spawn only; waiting for a stopped
//! encoder to exit happens outside it.
//!
//! A session's output directory is removed once its encoder is gone: after
//! a stop, when a failed record is reaped, and on shutdown.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::metrics::global_metrics;
use crate::session_key::{derive_session_id, DeviceId, SessionId};
use crate::supervisor::{
    EncoderEvent, EncoderHandle, LaunchError, StopWaiter, Supervisor, SupervisorEvent,
};
use crate::token::{TokenCodec, TokenError};

/// Attempts at finding a session ID whose output directory does not exist yet
const MAX_ID_ATTEMPTS: usize = 3;

/// Session lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Record claimed, encoder launched, not yet confirmed running
    Starting,

    /// Encoder confirmed running
    Running,

    /// Stop requested, waiting for the encoder to exit
    Stopping,

    /// Encoder exited after a stop request
    Stopped,

    /// Encoder crashed or exited on its own
    Failed {
        /// What the supervisor reported
        reason: String,
    },
}

impl SessionState {
    /// `Stopped` and `Failed` no longer hold the device
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed { .. })
    }

    /// Whether playback URLs may be issued
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed { .. } => "failed",
        }
    }
}

/// One device's session
#[derive(Debug)]
pub struct SessionRecord {
    pub device_id: DeviceId,
    pub session_id: SessionId,
    pub output_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    /// Released (and the process with it) when the record goes terminal
    handle: Option<EncoderHandle>,
}

impl SessionRecord {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state.as_str().to_string(),
            failure: match &self.state {
                SessionState::Failed { reason } => Some(reason.clone()),
                _ => None,
            },
            pid: self.handle.as_ref().and_then(|h| h.pid()),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Serializable view of a [`SessionRecord`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionInfo {
    pub device_id: DeviceId,
    pub session_id: SessionId,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: String,
}

/// A playback URL for a live session
#[derive(Debug, Clone, PartialEq)]
pub struct AccessUrl {
    /// `/live/<session-id>/<manifest>?token=<token>`
    pub url: String,
    pub session_id: SessionId,
    /// Token expiry (Unix epoch seconds)
    pub expires_at: i64,
}

/// Device-keyed session table
pub struct SessionRegistry {
    sessions: Mutex<HashMap<DeviceId, SessionRecord>>,
    supervisor: Supervisor,
    codec: Arc<TokenCodec>,
    output_root: PathBuf,
    manifest_name: String,
}

impl SessionRegistry {
    /// Create a registry
    ///
    /// Events from `supervisor` must be fed back through
    /// [`SessionRegistry::run_event_loop`] or [`SessionRegistry::handle_event`].
    pub fn new(
        supervisor: Supervisor,
        codec: Arc<TokenCodec>,
        output_root: PathBuf,
        manifest_name: String,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            supervisor,
            codec,
            output_root,
            manifest_name,
        }
    }

    /// Start an encoder session for `device`
    ///
    /// # Errors
    /// * `SessionError::AlreadyActive` - the device has a non-terminal session
    /// * `SessionError::Launch` - the encoder could not be launched
    pub async fn start_session(&self, device: &DeviceId) -> Result<SessionId, SessionError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(device) {
            if !existing.state.is_terminal() {
                return Err(SessionError::AlreadyActive {
                    device: device.to_string(),
                    session_id: existing.session_id.to_string(),
                });
            }
            tracing::debug!(
                device_id = %device,
                session_id = %existing.session_id,
                state = existing.state.as_str(),
                "Reaping terminal session"
            );
            if let Some(reaped) = sessions.remove(device) {
                remove_output_dir(&reaped.session_id, &reaped.output_dir).await;
            }
        }

        let (session_id, output_dir) = self.allocate_session_id(device).await?;

        sessions.insert(
            device.clone(),
            SessionRecord {
                device_id: device.clone(),
                session_id: session_id.clone(),
                output_dir: output_dir.clone(),
                created_at: Utc::now(),
                state: SessionState::Starting,
                handle: None,
            },
        );

        match self.supervisor.start(device, &session_id, &output_dir).await {
            Ok(handle) => {
                if let Some(record) = sessions.get_mut(device) {
                    record.handle = Some(handle);
                }
                global_metrics().session_started();
                global_metrics().set_active_sessions(live_count(&sessions));
                tracing::info!(device_id = %device, session_id = %session_id, "Stream started");
                Ok(session_id)
            }
            Err(e) => {
                sessions.remove(device);
                remove_output_dir(&session_id, &output_dir).await;
                global_metrics().session_failed();
                tracing::error!(device_id = %device, session_id = %session_id, error = %e, "Encoder launch failed");
                Err(SessionError::Launch(e))
            }
        }
    }

    /// Stop the session for `device`
    ///
    /// Waits for the encoder to exit, bounded by the supervisor's grace
    /// period, then removes the record and the session's output directory.
    ///
    /// # Errors
    /// * `SessionError::NotActive` - no running session for the device
    pub async fn stop_session(&self, device: &DeviceId) -> Result<SessionId, SessionError> {
        let (session_id, output_dir, waiter) = {
            let mut sessions = self.sessions.lock().await;
            let not_active = || SessionError::NotActive {
                device: device.to_string(),
            };

            // Failed records stay visible until the next start reaps them
            let record = sessions.get_mut(device).ok_or_else(not_active)?;
            if record.state == SessionState::Stopping || record.state.is_terminal() {
                return Err(not_active());
            }

            record.state = SessionState::Stopping;
            let waiter: Option<StopWaiter> = record.handle.as_mut().and_then(|h| h.stop().ok());
            (record.session_id.clone(), record.output_dir.clone(), waiter)
        };

        if let Some(waiter) = waiter {
            waiter.wait().await;
        }

        {
            let mut sessions = self.sessions.lock().await;
            if sessions
                .get(device)
                .is_some_and(|r| r.session_id == session_id)
            {
                sessions.remove(device);
            }
            global_metrics().session_stopped();
            global_metrics().set_active_sessions(live_count(&sessions));
        }
        remove_output_dir(&session_id, &output_dir).await;

        tracing::info!(device_id = %device, session_id = %session_id, "Stream stopped");
        Ok(session_id)
    }

    /// Mint a playback URL for the live session of `device`
    ///
    /// # Errors
    /// * `SessionError::NotActive` - no starting/running session
    /// * `SessionError::Token` - token could not be encoded
    pub async fn access_url(
        &self,
        device: &DeviceId,
        ttl_seconds: u64,
    ) -> Result<AccessUrl, SessionError> {
        let session_id = {
            let sessions = self.sessions.lock().await;
            match sessions.get(device) {
                Some(record) if record.state.is_live() => record.session_id.clone(),
                _ => {
                    return Err(SessionError::NotActive {
                        device: device.to_string(),
                    })
                }
            }
        };

        let issued = self.codec.issue(session_id.as_str(), ttl_seconds)?;
        global_metrics().token_issued();

        Ok(AccessUrl {
            url: format!(
                "/live/{}/{}?token={}",
                session_id, self.manifest_name, issued.token
            ),
            session_id,
            expires_at: issued.expires_at,
        })
    }

    /// Snapshot of the session for `device`, if any
    pub async fn session(&self, device: &DeviceId) -> Option<SessionInfo> {
        self.sessions.lock().await.get(device).map(SessionRecord::info)
    }

    /// Snapshot of every session, ordered by device
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(SessionRecord::info).collect();
        infos.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        infos
    }

    /// Number of sessions currently holding a device
    pub async fn active_count(&self) -> usize {
        live_count(&*self.sessions.lock().await) as usize
    }

    /// Apply one supervisor event to the table
    pub async fn handle_event(&self, event: SupervisorEvent) {
        let mut sessions = self.sessions.lock().await;

        let Some(device) = sessions
            .iter()
            .find(|(_, r)| r.session_id == event.session_id)
            .map(|(d, _)| d.clone())
        else {
            tracing::debug!(session_id = %event.session_id, event = ?event.event, "Event for unknown session");
            return;
        };

        let Some(record) = sessions.get_mut(&device) else {
            return;
        };

        match event.event {
            EncoderEvent::Started { pid } => {
                if record.state == SessionState::Starting {
                    record.state = SessionState::Running;
                    tracing::debug!(device_id = %device, session_id = %record.session_id, ?pid, "Encoder running");
                }
            }
            EncoderEvent::Errored(reason) => self.encoder_exited(&mut sessions, &device, reason),
            EncoderEvent::Ended { code } => {
                let reason = match code {
                    Some(code) => format!("encoder exited with code {}", code),
                    None => "encoder terminated by signal".to_string(),
                };
                self.encoder_exited(&mut sessions, &device, reason)
            }
        }
    }

    fn encoder_exited(
        &self,
        sessions: &mut HashMap<DeviceId, SessionRecord>,
        device: &DeviceId,
        reason: String,
    ) {
        let Some(record) = sessions.get_mut(device) else {
            return;
        };

        match record.state {
            SessionState::Stopping => {
                record.state = SessionState::Stopped;
                tracing::debug!(device_id = %device, session_id = %record.session_id, "Encoder exited after stop");
                sessions.remove(device);
            }
            SessionState::Starting | SessionState::Running => {
                tracing::warn!(
                    device_id = %device,
                    session_id = %record.session_id,
                    reason = %reason,
                    "Encoder exited without a stop request"
                );
                record.state = SessionState::Failed { reason };
                record.handle = None;
                global_metrics().session_failed();
            }
            SessionState::Stopped | SessionState::Failed { .. } => {}
        }

        global_metrics().set_active_sessions(live_count(sessions));
    }

    /// Consume supervisor events until shutdown
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SupervisorEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tracing::info!("Session event loop started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Session event loop shutting down");
                    break;
                }
            }
        }
    }

    /// Stop every session and wait for all encoders to exit
    pub async fn shutdown(&self) {
        let waiters: Vec<(SessionId, StopWaiter)> = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .values_mut()
                .filter_map(|record| {
                    let waiter = record.handle.as_mut()?.stop().ok()?;
                    record.state = SessionState::Stopping;
                    Some((record.session_id.clone(), waiter))
                })
                .collect()
        };

        for (session_id, waiter) in waiters {
            waiter.wait().await;
            tracing::info!(session_id = %session_id, "Encoder stopped on shutdown");
        }

        let records: Vec<SessionRecord> = {
            let mut sessions = self.sessions.lock().await;
            global_metrics().set_active_sessions(0);
            sessions.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            remove_output_dir(&record.session_id, &record.output_dir).await;
        }
    }

    /// Pick a fresh session ID whose directory does not exist yet
    async fn allocate_session_id(
        &self,
        device: &DeviceId,
    ) -> Result<(SessionId, PathBuf), SessionError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let session_id = derive_session_id(device, Uuid::new_v4());
            let output_dir = self.output_root.join(session_id.as_str());
            if !tokio::fs::try_exists(&output_dir).await.unwrap_or(true) {
                return Ok((session_id, output_dir));
            }
            tracing::warn!(session_id = %session_id, "Session directory already exists, re-deriving");
        }

        Err(SessionError::Launch(LaunchError::OutputDir(
            "no unused session directory available".to_string(),
        )))
    }
}

async fn remove_output_dir(session_id: &SessionId, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(session_id = %session_id, "Removed session output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            session_id = %session_id,
            dir = %dir.display(),
            error = %e,
            "Failed to remove session output"
        ),
    }
}

fn live_count(sessions: &HashMap<DeviceId, SessionRecord>) -> u64 {
    sessions
        .values()
        .filter(|r| !r.state.is_terminal())
        .count() as u64
}

/// Session-related errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionError {
    #[error("Stream already active for device {device} (session {session_id})")]
    AlreadyActive { device: String, session_id: String },

    #[error("No active stream for device {device}")]
    NotActive { device: String },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Token(#[from] TokenError),
}
