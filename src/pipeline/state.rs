//! Pipeline State
//!
//! The single source of truth for the capture-to-model pipeline, owned and
//! mutated exclusively by the orchestrator task. Everything else, the
//! presentation layer included, sees read-only snapshots republished on a
//! watch channel.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Phase Enums
// ============================================================================

/// Capture strategy. Selects the engine configuration: over-capture is
/// enabled for object mode only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    /// Orbit a single object on a surface.
    Object,
    /// Sweep a surrounding area.
    Area,
}

impl CaptureMode {
    /// The other mode; toggling flips between the two.
    pub fn toggled(self) -> Self {
        match self {
            CaptureMode::Object => CaptureMode::Area,
            CaptureMode::Area => CaptureMode::Object,
        }
    }
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureMode::Object => write!(f, "Object"),
            CaptureMode::Area => write!(f, "Area"),
        }
    }
}

/// The orchestrator's authoritative view of the capture session lifecycle.
///
/// Updated only from the engine's state stream, never guessed from the
/// commands we issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No live session yet (or a reset is in progress).
    NotStarted,
    /// Session live, waiting for detection or capture to begin.
    Ready,
    /// Object detection in progress.
    Detecting,
    /// Actively taking shots.
    Capturing,
    /// Finish issued; engine flushing remaining shots.
    Finishing,
    /// Capture done, staged images complete on disk.
    Completed,
    /// Engine-side failure. Terminal until the next reset.
    Failed(String),
}

impl SessionPhase {
    /// Phases in which the live camera feed is running and may be resumed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, SessionPhase::Detecting | SessionPhase::Capturing)
    }

    /// Phases in which shot counters are refreshed from the engine.
    pub fn tracks_shots(&self) -> bool {
        matches!(self, SessionPhase::Capturing | SessionPhase::Finishing)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::NotStarted => write!(f, "NotStarted"),
            SessionPhase::Ready => write!(f, "Ready"),
            SessionPhase::Detecting => write!(f, "Detecting"),
            SessionPhase::Capturing => write!(f, "Capturing"),
            SessionPhase::Finishing => write!(f, "Finishing"),
            SessionPhase::Completed => write!(f, "Completed"),
            SessionPhase::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Reconstruction progress as surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconstructionStatus {
    /// No reconstruction requested for this activation.
    Idle,
    /// Request accepted, engine session opening.
    Preparing,
    /// Engine reported a progress fraction in `[0, 1]`.
    Progressing(f64),
    /// Model written to the given path. Terminal.
    Complete(PathBuf),
    /// Engine reported an error. Terminal, retried only via reset.
    Failed(String),
}

impl ReconstructionStatus {
    /// Whether an engine session is currently working.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ReconstructionStatus::Preparing | ReconstructionStatus::Progressing(_)
        )
    }
}

/// Upload progress as surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    /// No upload requested yet (or state was reset).
    Idle,
    /// Single attempt running; no second attempt may start.
    InFlight,
    /// Server accepted the model.
    Succeeded(String),
    /// Transport error or server rejection. Retried only by an explicit
    /// new upload intent.
    Failed(String),
}

// ============================================================================
// Pipeline State
// ============================================================================

/// The pipeline's single mutable entity.
///
/// Owned by the orchestrator; consumers receive clones via the watch
/// channel. `PartialEq` lets the orchestrator skip republishing unchanged
/// snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Selected capture strategy.
    pub capture_mode: CaptureMode,
    /// Authoritative session lifecycle phase.
    pub session_phase: SessionPhase,
    /// Shots taken so far; refreshed only while capturing/finishing.
    pub shots_taken: u32,
    /// Engine's shot ceiling; refreshed alongside `shots_taken`.
    pub shots_max: u32,
    /// True while a blocking review/onboarding surface is up. While true
    /// the engine has been paused.
    pub overlay_visible: bool,
    /// Last `start_detecting` attempt failed. Recoverable; cleared by a
    /// successful retry or a reset.
    pub detection_failed: bool,
    /// The engine signaled a completed scan pass; presentation may show a
    /// mid-capture review. Cleared when the overlay hides and on reset.
    pub scan_pass_pending_review: bool,
    /// Reconstruction progress.
    pub reconstruction: ReconstructionStatus,
    /// Upload progress.
    pub upload: UploadStatus,
    /// Location of the completed model; set only when reconstruction
    /// completed.
    pub model_path: Option<PathBuf>,
}

impl PipelineState {
    /// Fresh state for a new activation in the given mode.
    pub fn new(capture_mode: CaptureMode) -> Self {
        Self {
            capture_mode,
            session_phase: SessionPhase::NotStarted,
            shots_taken: 0,
            shots_max: 0,
            overlay_visible: false,
            detection_failed: false,
            scan_pass_pending_review: false,
            reconstruction: ReconstructionStatus::Idle,
            upload: UploadStatus::Idle,
            model_path: None,
        }
    }

    /// Full reset for a new activation, keeping only the capture mode.
    ///
    /// Restores the entire record: phase, counters, overlay and detection
    /// flags, reconstruction, upload, and the model path all return to
    /// their initial values.
    pub fn reset_for_activation(&mut self) {
        *self = Self::new(self.capture_mode);
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new(CaptureMode::Object)
    }
}

/// Clamp a reported progress fraction into `[0, 1]`.
///
/// Engines are trusted to send sane fractions but the state machine never
/// republishes an out-of-range value. NaN maps to 0.
pub fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        return 0.0;
    }
    fraction.clamp(0.0, 1.0)
}
