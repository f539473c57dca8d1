//! scanforge: Capture-to-Model Pipeline Orchestrator
//!
//! Drives a physical photo-capture workflow end to end: a platform capture
//! engine fills a staging directory with shots, a reconstruction engine
//! turns them into a 3D model file, and an uploader ships the result to a
//! collection server.
//!
//! ## Architecture
//!
//! - **Pipeline Orchestrator**: single-owner state machine coordinating all
//!   collaborators through one serialized event loop
//! - **Capture boundary**: command trait + push-based session event stream
//! - **Reconstruction boundary**: finite progress/terminal event source
//! - **Upload boundary**: single-attempt multipart transfer
//! - **Scripted engines**: deterministic collaborator doubles for demos and
//!   tests

pub mod capture;
pub mod config;
pub mod pipeline;
pub mod reconstruction;
pub mod sim;
pub mod storage;
pub mod upload;

// Re-export pipeline configuration
pub use config::PipelineConfig;

// Re-export the orchestrator surface
pub use pipeline::{
    CaptureMode, PipelineDeps, PipelineHandle, PipelineIntent, PipelineOrchestrator,
    PipelineState, PipelineStats, ReconstructionStatus, SessionPhase, UploadStatus,
};

// Re-export collaborator boundaries
pub use capture::{
    CaptureBackend, CaptureError, CaptureSession, EnginePhase, SessionConfig, SessionEvent,
};
pub use reconstruction::{
    ReconstructionEngine, ReconstructionError, ReconstructionEvent, ReconstructionJob,
};
pub use storage::{DiskStore, FileStore, StoreError};
pub use upload::{HttpUploader, UploadError, UploadResponse, Uploader};
