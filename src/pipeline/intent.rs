//! Presentation intents.
//!
//! The intent sink is the only write path into the pipeline. Each intent is
//! validated against the current state; an intent that arrives in a state
//! that does not permit it is rejected as a logged no-op.

/// Commands accepted from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineIntent {
    /// Flip object/area mode. Forces a full pipeline reset.
    ToggleCaptureMode,
    /// Begin object detection (object mode only).
    StartDetecting,
    /// Begin taking shots.
    StartCapturing,
    /// Stop capturing and flush.
    FinishCapturing,
    /// Show or hide a blocking overlay. Edge-triggered; repeated calls
    /// with the current value are no-ops.
    SetOverlayVisible(bool),
    /// Turn the staged shots into a model file.
    StartReconstruction,
    /// Upload the completed model, one attempt.
    UploadModel,
    /// Full pipeline reset in the current mode.
    Reset,
}

impl std::fmt::Display for PipelineIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineIntent::ToggleCaptureMode => write!(f, "ToggleCaptureMode"),
            PipelineIntent::StartDetecting => write!(f, "StartDetecting"),
            PipelineIntent::StartCapturing => write!(f, "StartCapturing"),
            PipelineIntent::FinishCapturing => write!(f, "FinishCapturing"),
            PipelineIntent::SetOverlayVisible(v) => write!(f, "SetOverlayVisible({v})"),
            PipelineIntent::StartReconstruction => write!(f, "StartReconstruction"),
            PipelineIntent::UploadModel => write!(f, "UploadModel"),
            PipelineIntent::Reset => write!(f, "Reset"),
        }
    }
}
