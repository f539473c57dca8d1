//! Reconstruction engine boundary.
//!
//! The engine turns a directory of staged shots into a single model file.
//! It is finite but push-based: after `process()` the job emits any number
//! of progress fractions followed by exactly one terminal event (complete
//! or error), then the stream ends.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Events emitted by an in-flight reconstruction job.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconstructionEvent {
    /// Fraction of the work done, nominally in `[0, 1]`. Consumers clamp.
    Progress(f64),
    /// The model file was written to `output`. Terminal.
    Complete { output: PathBuf },
    /// The job failed. Terminal.
    Error(String),
}

/// Reconstruction engine errors.
#[derive(Debug, thiserror::Error)]
pub enum ReconstructionError {
    #[error("failed to open reconstruction session: {0}")]
    OpenFailed(String),
    #[error("failed to submit reconstruction request: {0}")]
    RequestFailed(String),
}

/// Factory for reconstruction jobs.
#[async_trait]
pub trait ReconstructionEngine: Send + Sync + 'static {
    /// Open a job over the staged images in `input_dir`.
    ///
    /// An invalid or empty input directory fails here, which the caller
    /// treats like an immediate error terminal event.
    async fn open(&self, input_dir: &Path) -> Result<Box<dyn ReconstructionJob>, ReconstructionError>;
}

/// A single reconstruction job.
///
/// Same shape as a pull-based packet source: `next_event()` yields events
/// in arrival order and returns `None` once the job's stream has ended.
#[async_trait]
pub trait ReconstructionJob: Send + 'static {
    /// Submit the model-file request. Must be called once before polling.
    async fn process(&mut self, output: &Path) -> Result<(), ReconstructionError>;

    /// Next event from the job, or `None` after the terminal event.
    async fn next_event(&mut self) -> Option<ReconstructionEvent>;
}
