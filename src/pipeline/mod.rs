//! Capture-to-model pipeline orchestration.
//!
//! The orchestrator owns the pipeline's single source of truth and
//! coordinates the capture engine, the reconstruction engine, the uploader,
//! and the file store through one serialized event loop.

pub mod intent;
pub mod orchestrator;
pub mod state;

pub use intent::PipelineIntent;
pub use orchestrator::{PipelineDeps, PipelineHandle, PipelineOrchestrator, PipelineStats};
pub use state::{
    clamp_fraction, CaptureMode, PipelineState, ReconstructionStatus, SessionPhase, UploadStatus,
};
