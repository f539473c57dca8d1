//! Capture engine boundary.
//!
//! Abstracts the platform AR capture session behind a command trait and a
//! push-based event stream. The orchestrator issues commands through
//! [`CaptureSession`] and mirrors the engine's lifecycle from the
//! [`SessionEvent`] stream; it never guesses the engine's phase.

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

/// Default capacity of a session's event channel.
pub const SESSION_EVENT_BUFFER: usize = 64;

/// The capture engine's own lifecycle phase, as reported on its state stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Session object created, not yet scanning.
    Initializing,
    /// Live camera feed up, waiting for detection or capture to begin.
    Ready,
    /// Object bounding-box detection in progress.
    Detecting,
    /// Actively taking shots.
    Capturing,
    /// `finish()` issued, engine is flushing its last shots.
    Finishing,
    /// All captured images are on disk; the session is over.
    Completed,
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePhase::Initializing => write!(f, "Initializing"),
            EnginePhase::Ready => write!(f, "Ready"),
            EnginePhase::Detecting => write!(f, "Detecting"),
            EnginePhase::Capturing => write!(f, "Capturing"),
            EnginePhase::Finishing => write!(f, "Finishing"),
            EnginePhase::Completed => write!(f, "Completed"),
        }
    }
}

/// Events pushed by a live capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The engine moved to a new lifecycle phase.
    StateChanged(EnginePhase),
    /// Shot counters changed. Only meaningful while capturing/finishing.
    ShotCountChanged { taken: u32, max: u32 },
    /// The user completed one full scan pass around the subject.
    ScanPassCompleted,
    /// Engine-side failure. Terminal for the session.
    Error(String),
}

/// Per-session engine configuration.
///
/// Over-capture keeps the engine shooting past the guided pass so a later
/// reconstruction has extra coverage; it is enabled for object mode only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub over_capture_enabled: bool,
}

/// Capture engine errors.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to start capture session: {0}")]
    StartFailed(String),
    #[error("capture command failed: {0}")]
    CommandFailed(String),
}

/// Factory for live capture sessions.
///
/// A brand-new session is acquired per pipeline activation; the mode-reset
/// path discards the old handle and opens a fresh one.
#[async_trait]
pub trait CaptureBackend: Send + Sync + 'static {
    /// Start a new session writing shots into `images_dir`.
    ///
    /// Returns the command handle and the session's event stream. The engine
    /// reports `Ready` on the stream once the session is live.
    async fn open_session(
        &self,
        images_dir: &Path,
        config: SessionConfig,
    ) -> Result<(Box<dyn CaptureSession>, mpsc::Receiver<SessionEvent>), CaptureError>;
}

/// Command surface of a live capture session.
///
/// Commands are quick engine calls; lifecycle progress arrives on the event
/// stream, not in the command results.
#[async_trait]
pub trait CaptureSession: Send {
    /// Begin object detection. Returns `false` when the engine could not
    /// lock onto the subject. Recoverable: the caller may retry or fall
    /// back to direct capture.
    async fn start_detecting(&mut self) -> Result<bool, CaptureError>;

    /// Begin taking shots.
    async fn start_capturing(&mut self) -> Result<(), CaptureError>;

    /// Stop capturing and let the engine flush its remaining shots.
    async fn finish(&mut self) -> Result<(), CaptureError>;

    /// Suspend the live camera feed (blocking overlay shown).
    async fn pause(&mut self) -> Result<(), CaptureError>;

    /// Resume a paused feed.
    async fn resume(&mut self) -> Result<(), CaptureError>;
}
