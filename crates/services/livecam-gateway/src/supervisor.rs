//! Encoder process supervision
//!
//! Each session runs one external encoder process that reads a capture
//! device and writes an HLS playlist plus segments into the session's output
//! directory. The supervisor launches it, hands the child to a monitor task,
//! and reports lifecycle events on a channel. The monitor task is the only
//! owner of the child, so every session's events are produced in order by a
//! single task.
//!
//! Stopping sends SIGINT (the encoder finalises its playlist on it), waits a
//! bounded grace period and then kills the process.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::EncoderConfig;
use crate::session_key::{DeviceId, SessionId};

/// Event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Describes how to run the encoder for a device
pub trait EncoderCommand: Send + Sync {
    /// Check that the capture source can be opened before spawning anything
    fn preflight(&self, device: &DeviceId) -> Result<(), LaunchError>;

    /// Build the encoder invocation writing into `output_dir`
    fn command(&self, device: &DeviceId, output_dir: &Path) -> Command;
}

/// ffmpeg capturing from a video4linux device into a rolling HLS playlist
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
    device_path_template: String,
    input_format: String,
    framerate: u32,
    segment_seconds: u32,
    playlist_size: u32,
    manifest_name: String,
}

impl FfmpegEncoder {
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            program: config.program.clone(),
            device_path_template: config.device_path_template.clone(),
            input_format: config.input_format.clone(),
            framerate: config.framerate,
            segment_seconds: config.segment_seconds.max(1),
            playlist_size: config.playlist_size.max(1),
            manifest_name: config.manifest_name.clone(),
        }
    }

    /// Capture source for `device`
    pub fn device_path(&self, device: &DeviceId) -> PathBuf {
        PathBuf::from(self.device_path_template.replace("{device}", device.as_str()))
    }

    /// Full argument list for one session
    pub fn args(&self, device: &DeviceId, output_dir: &Path) -> Vec<String> {
        let gop = self.framerate * self.segment_seconds;
        let segment_pattern = output_dir.join("segment%05d.ts");
        let manifest = output_dir.join(&self.manifest_name);

        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            self.input_format.clone(),
            "-framerate".into(),
            self.framerate.to_string(),
            "-i".into(),
            self.device_path(device).to_string_lossy().into_owned(),
            "-an".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-g".into(),
            gop.to_string(),
            "-keyint_min".into(),
            gop.to_string(),
            "-sc_threshold".into(),
            "0".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            self.segment_seconds.to_string(),
            "-hls_list_size".into(),
            self.playlist_size.to_string(),
            "-hls_flags".into(),
            "delete_segments".into(),
            "-hls_segment_filename".into(),
            segment_pattern.to_string_lossy().into_owned(),
            manifest.to_string_lossy().into_owned(),
        ]
    }
}

impl EncoderCommand for FfmpegEncoder {
    fn preflight(&self, device: &DeviceId) -> Result<(), LaunchError> {
        let path = self.device_path(device);
        if path.is_absolute() && !path.exists() {
            return Err(LaunchError::Device {
                device: device.to_string(),
                reason: format!("{} does not exist", path.display()),
            });
        }
        Ok(())
    }

    fn command(&self, device: &DeviceId, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(device, output_dir));
        cmd
    }
}

/// Runs a `/bin/sh` script as the encoder
///
/// `OUTPUT_DIR` and `DEVICE` are exported to the script. Handy for demos on
/// machines without a camera and for exercising the supervisor.
#[derive(Debug, Clone)]
pub struct ScriptEncoder {
    script: String,
}

impl ScriptEncoder {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl EncoderCommand for ScriptEncoder {
    fn preflight(&self, _device: &DeviceId) -> Result<(), LaunchError> {
        Ok(())
    }

    fn command(&self, device: &DeviceId, output_dir: &Path) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&self.script)
            .env("OUTPUT_DIR", output_dir)
            .env("DEVICE", device.as_str());
        cmd
    }
}

/// Lifecycle event emitted by a monitor task
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    /// Process is running
    Started { pid: Option<u32> },

    /// Process failed or exited unsuccessfully
    Errored(String),

    /// Process exited cleanly or after a stop request
    Ended { code: Option<i32> },
}

/// An [`EncoderEvent`] tagged with the session it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorEvent {
    pub session_id: SessionId,
    pub event: EncoderEvent,
}

/// Owned handle to a running encoder
///
/// Dropping the handle without calling [`EncoderHandle::stop`] also
/// terminates the process.
#[derive(Debug)]
pub struct EncoderHandle {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

impl EncoderHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has not yet been reaped
    pub fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }

    /// Request termination
    ///
    /// Returns immediately; the returned [`StopWaiter`] resolves once the
    /// process is gone, which is bounded by the grace period plus a kill.
    ///
    /// # Errors
    /// * `SupervisorError::NotRunning` - process already exited or a stop
    ///   was already requested
    pub fn stop(&mut self) -> Result<StopWaiter, SupervisorError> {
        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        let stop_tx = self.stop_tx.take().ok_or(SupervisorError::NotRunning)?;
        // The monitor may have exited between the check and here; waiting
        // on `exited` still resolves.
        let _ = stop_tx.send(());

        Ok(StopWaiter(self.exited.clone()))
    }
}

/// Resolves when a stopped encoder has exited
#[derive(Debug)]
pub struct StopWaiter(watch::Receiver<bool>);

impl StopWaiter {
    pub async fn wait(mut self) {
        // Err means the monitor is gone, which also means the child is gone
        let _ = self.0.wait_for(|exited| *exited).await;
    }
}

/// Launches encoders and forwards their lifecycle events
pub struct Supervisor {
    encoder: Arc<dyn EncoderCommand>,
    events: mpsc::Sender<SupervisorEvent>,
    stop_grace: Duration,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its event channel
    pub fn new(
        encoder: Arc<dyn EncoderCommand>,
        stop_grace: Duration,
    ) -> (Self, mpsc::Receiver<SupervisorEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                encoder,
                events,
                stop_grace,
            },
            events_rx,
        )
    }

    /// Launch the encoder for `device` writing into `output_dir`
    ///
    /// Creates `output_dir` (recursively, idempotently), spawns the process
    /// and returns without waiting on it.
    pub async fn start(
        &self,
        device: &DeviceId,
        session_id: &SessionId,
        output_dir: &Path,
    ) -> Result<EncoderHandle, LaunchError> {
        self.encoder.preflight(device)?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| LaunchError::OutputDir(format!("{}: {}", output_dir.display(), e)))?;

        let mut cmd = self.encoder.command(device, output_dir);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;
        let pid = child.id();

        tracing::info!(
            device_id = %device,
            session_id = %session_id,
            pid = ?pid,
            output_dir = %output_dir.display(),
            "Encoder spawned"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        tokio::spawn(monitor(
            child,
            session_id.clone(),
            self.events.clone(),
            stop_rx,
            exited_tx,
            self.stop_grace,
        ));

        Ok(EncoderHandle {
            pid,
            stop_tx: Some(stop_tx),
            exited: exited_rx,
        })
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    StopRequested,
}

/// Own the child until it exits, emitting events in order
async fn monitor(
    mut child: Child,
    session_id: SessionId,
    events: mpsc::Sender<SupervisorEvent>,
    mut stop_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    stop_grace: Duration,
) {
    let emit = |event: EncoderEvent| SupervisorEvent {
        session_id: session_id.clone(),
        event,
    };

    let _ = events
        .send(emit(EncoderEvent::Started { pid: child.id() }))
        .await;

    // A dropped handle counts as a stop request
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        _ = &mut stop_rx => Wake::StopRequested,
    };

    let event = match wake {
        Wake::Exited(Ok(status)) if status.success() => EncoderEvent::Ended {
            code: status.code(),
        },
        Wake::Exited(Ok(status)) => {
            EncoderEvent::Errored(format!("encoder exited with {}", status))
        }
        Wake::Exited(Err(e)) => EncoderEvent::Errored(format!("failed to wait on encoder: {}", e)),
        Wake::StopRequested => match terminate(&mut child, &session_id, stop_grace).await {
            Ok(status) => EncoderEvent::Ended {
                code: status.code(),
            },
            Err(e) => EncoderEvent::Errored(format!("failed to terminate encoder: {}", e)),
        },
    };

    let _ = exited_tx.send(true);
    let _ = events.send(emit(event)).await;
}

/// SIGINT, bounded wait, then SIGKILL
async fn terminate(
    child: &mut Child,
    session_id: &SessionId,
    stop_grace: Duration,
) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(stop_grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(
                session_id = %session_id,
                grace_ms = stop_grace.as_millis() as u64,
                "Encoder did not exit gracefully, forcing kill"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Encoder launch failures
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LaunchError {
    #[error("Cannot open capture device {device}: {reason}")]
    Device { device: String, reason: String },

    #[error("Cannot create output directory {0}")]
    OutputDir(String),

    #[error("Failed to spawn encoder: {0}")]
    Spawn(String),
}

/// Supervisor errors
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SupervisorError {
    #[error("Encoder is not running")]
    NotRunning,
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut mpsc::Receiver<SupervisorEvent>) -> EncoderEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
            .event
    }

    fn ids() -> (DeviceId, SessionId) {
        (
            DeviceId::from(0),
            SessionId::parse("sess_0123abcd_0123456789abcdef").unwrap(),
        )
    }

    #[test]
    fn test_ffmpeg_args() {
        let encoder = FfmpegEncoder::from_config(&EncoderConfig::default());
        let args = encoder.args(&DeviceId::from(2), Path::new("/tmp/out"));
        let joined = args.join(" ");

        assert!(joined.contains("-f v4l2 -framerate 30 -i /dev/video2"));
        assert!(joined.contains("-preset ultrafast"));
        assert!(joined.contains("-tune zerolatency"));
        assert!(joined.contains("-hls_time 2"));
        assert!(joined.contains("-hls_list_size 5"));
        assert!(joined.contains("-hls_flags delete_segments"));
        assert_eq!(args.last().unwrap(), "/tmp/out/index.m3u8");
    }

    #[test]
    fn test_ffmpeg_preflight_missing_device() {
        let config = EncoderConfig {
            device_path_template: "/nonexistent/video{device}".to_string(),
            ..Default::default()
        };
        let encoder = FfmpegEncoder::from_config(&config);

        match encoder.preflight(&DeviceId::from(0)) {
            Err(LaunchError::Device { device, .. }) => assert_eq!(device, "0"),
            other => panic!("Expected Device error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_creates_output_dir_and_reports_started() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("nested").join("sess");
        let (device, session) = ids();
        let (supervisor, mut rx) = Supervisor::new(
            Arc::new(ScriptEncoder::new("touch \"$OUTPUT_DIR/index.m3u8\"; exec sleep 30")),
            Duration::from_secs(2),
        );

        let mut handle = supervisor.start(&device, &session, &out).await.unwrap();
        assert!(out.is_dir());
        assert!(matches!(next_event(&mut rx).await, EncoderEvent::Started { .. }));
        assert!(handle.is_running());

        handle.stop().unwrap().wait().await;
        assert!(!handle.is_running());
        assert!(matches!(next_event(&mut rx).await, EncoderEvent::Ended { .. }));
    }

    #[tokio::test]
    async fn test_crash_is_reported_as_errored() {
        let tmp = TempDir::new().unwrap();
        let (device, session) = ids();
        let (supervisor, mut rx) =
            Supervisor::new(Arc::new(ScriptEncoder::new("exit 3")), Duration::from_secs(1));

        let mut handle = supervisor.start(&device, &session, tmp.path()).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, EncoderEvent::Started { .. }));
        assert!(matches!(next_event(&mut rx).await, EncoderEvent::Errored(_)));
        assert_eq!(handle.stop().unwrap_err(), SupervisorError::NotRunning);
    }

    #[tokio::test]
    async fn test_wedged_encoder_is_killed_after_grace() {
        let tmp = TempDir::new().unwrap();
        let (device, session) = ids();
        let (supervisor, mut rx) = Supervisor::new(
            Arc::new(ScriptEncoder::new("trap '' INT; while :; do sleep 1; done")),
            Duration::from_millis(200),
        );

        let mut handle = supervisor.start(&device, &session, tmp.path()).await.unwrap();
        next_event(&mut rx).await;

        tokio::time::timeout(WAIT, handle.stop().unwrap().wait())
            .await
            .expect("stop should be bounded by the grace period");
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_double_stop_is_not_running() {
        let tmp = TempDir::new().unwrap();
        let (device, session) = ids();
        let (supervisor, _rx) =
            Supervisor::new(Arc::new(ScriptEncoder::new("exec sleep 30")), Duration::from_secs(1));

        let mut handle = supervisor.start(&device, &session, tmp.path()).await.unwrap();
        let waiter = handle.stop().unwrap();
        assert_eq!(handle.stop().unwrap_err(), SupervisorError::NotRunning);
        waiter.wait().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let tmp = TempDir::new().unwrap();
        let (device, session) = ids();
        let config = EncoderConfig {
            program: "/nonexistent/ffmpeg".to_string(),
            device_path_template: "testsrc".to_string(),
            ..Default::default()
        };
        let (supervisor, _rx) = Supervisor::new(
            Arc::new(FfmpegEncoder::from_config(&config)),
            Duration::from_secs(1),
        );

        let result = supervisor.start(&device, &session, tmp.path()).await;
        assert!(matches!(result, Err(LaunchError::Spawn(_))));
    }
}
