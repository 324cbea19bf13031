//! Periodic still capture feeding the frame ring buffer.
//!
//! The camera itself is an external program that writes one encoded image to
//! stdout. A failed capture skips the cycle; it never stops the loop.

use crate::config::CameraConfig;
use crate::debounce::SequenceGenerator;
use crate::frame_buffer::{Frame, SharedFrameBuffer};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that can occur while capturing a frame.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to launch capture command: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Capture command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Capture produced no image data")]
    EmptyImage,

    #[error("Capture timed out after {0:?}")]
    Timeout(Duration),
}

/// An encoded image returned by a capture source.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub captured_at: DateTime<Utc>,
    pub data: Bytes,
}

/// Source of still images.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(&self) -> Result<CapturedImage, CaptureError>;
}

/// Captures stills by running an external program such as `rpicam-still`.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            timeout: config.capture_timeout(),
        }
    }
}

#[async_trait]
impl CaptureSource for CommandCapture {
    async fn capture(&self) -> Result<CapturedImage, CaptureError> {
        let captured_at = Utc::now();

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| CaptureError::Timeout(self.timeout))?
            .map_err(CaptureError::Launch)?;

        if !output.status.success() {
            return Err(CaptureError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if output.stdout.is_empty() {
            return Err(CaptureError::EmptyImage);
        }

        Ok(CapturedImage {
            captured_at,
            data: Bytes::from(output.stdout),
        })
    }
}

/// Statistics for the capture loop.
#[derive(Debug, Default, Clone)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_failed: u64,
    pub frames_persisted: u64,
    pub persist_failures: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
}

/// File name for a persisted frame. Names sort by capture time.
pub fn frame_file_name(captured_at: &DateTime<Utc>, sequence: u64) -> String {
    format!(
        "frame_{}_{:08}.jpg",
        captured_at.format("%Y%m%dT%H%M%S%.3fZ"),
        sequence
    )
}

/// Drives a capture source at a fixed interval into the ring buffer.
pub struct CaptureLoop {
    source: Arc<dyn CaptureSource>,
    buffer: SharedFrameBuffer,
    interval: Duration,
    frames_dir: Option<PathBuf>,
    sequence: Arc<SequenceGenerator>,
    stats: Arc<RwLock<CaptureStats>>,
}

impl CaptureLoop {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        buffer: SharedFrameBuffer,
        interval: Duration,
        frames_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            source,
            buffer,
            interval,
            frames_dir,
            sequence: Arc::new(SequenceGenerator::new()),
            stats: Arc::new(RwLock::new(CaptureStats::default())),
        }
    }

    /// Number frames from `sequence` instead of a private counter, so frames
    /// from successive loops sharing one buffer never repeat a number.
    pub fn with_sequence(mut self, sequence: Arc<SequenceGenerator>) -> Self {
        self.sequence = sequence;
        self
    }

    /// Get current capture statistics.
    pub fn stats(&self) -> CaptureStats {
        self.stats.read().clone()
    }

    /// Capture until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            persist = self.frames_dir.is_some(),
            "Capture loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.capture_once() => {}
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            frames_captured = stats.frames_captured,
            frames_failed = stats.frames_failed,
            "Capture loop stopped"
        );
    }

    /// Capture one frame and push it into the buffer.
    pub async fn capture_once(&self) -> Option<u64> {
        let image = match self.source.capture().await {
            Ok(image) => image,
            Err(e) => {
                self.stats.write().frames_failed += 1;
                warn!(error = %e, "Frame capture failed, skipping cycle");
                return None;
            }
        };

        let sequence = self.sequence.next();
        let mut frame = Frame::new(sequence, image.captured_at, image.data);

        if let Some(dir) = &self.frames_dir {
            match persist_frame(dir, &frame).await {
                Ok(path) => {
                    self.stats.write().frames_persisted += 1;
                    frame.path = Some(path);
                }
                Err(e) => {
                    self.stats.write().persist_failures += 1;
                    warn!(sequence, error = %e, "Failed to persist frame");
                }
            }
        }

        {
            let mut stats = self.stats.write();
            stats.frames_captured += 1;
            stats.last_frame_at = Some(frame.captured_at);
        }

        debug!(sequence, bytes = frame.data.len(), "Frame captured");
        self.buffer.write().push(frame);
        Some(sequence)
    }
}

async fn persist_frame(dir: &Path, frame: &Frame) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(frame_file_name(&frame.captured_at, frame.sequence));
    tokio::fs::write(&path, &frame.data).await?;
    Ok(path)
}
