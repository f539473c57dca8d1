//! Pipeline Orchestrator: the coordinating event loop.
//!
//! One task owns [`PipelineState`] and serializes every mutation. Intents
//! from the presentation layer and events from the capture engine, the
//! reconstruction engine, and the uploader all arrive through channels and
//! are handled in arrival order inside a single `select!` loop; a snapshot
//! is republished on a watch channel whenever the state changed.
//!
//! Each activation (initial start, explicit reset, mode toggle) gets a
//! generation number and a child cancellation token. Resetting cancels the
//! forwarder tasks of the superseded activation and bumps the generation;
//! any event still in flight from the old activation is discarded at the
//! loop entry instead of mutating the new state.

use crate::capture::{CaptureBackend, CaptureError, CaptureSession, SessionConfig, SessionEvent};
use crate::pipeline::intent::PipelineIntent;
use crate::pipeline::state::{
    clamp_fraction, CaptureMode, PipelineState, ReconstructionStatus, SessionPhase, UploadStatus,
};
use crate::reconstruction::{ReconstructionEngine, ReconstructionEvent};
use crate::storage::FileStore;
use crate::upload::{UploadError, UploadResponse, Uploader};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capacity of the intent channel.
const INTENT_BUFFER: usize = 32;

/// Capacity of the merged collaborator event channel.
const ENGINE_EVENT_BUFFER: usize = 128;

// ============================================================================
// Collaborator Bundle
// ============================================================================

/// The orchestrator's external collaborators.
#[derive(Clone)]
pub struct PipelineDeps {
    pub capture: Arc<dyn CaptureBackend>,
    pub reconstruction: Arc<dyn ReconstructionEngine>,
    pub uploader: Arc<dyn Uploader>,
    pub store: Arc<dyn FileStore>,
}

// ============================================================================
// Internal Events
// ============================================================================

/// Collaborator events merged onto the orchestrator's single event channel.
///
/// Every event carries the generation of the activation that produced it;
/// events from a superseded activation are discarded on arrival.
enum EngineEvent {
    Capture {
        generation: u64,
        event: SessionEvent,
    },
    Reconstruction {
        generation: u64,
        event: ReconstructionEvent,
    },
    UploadSettled {
        generation: u64,
        result: Result<UploadResponse, UploadError>,
    },
}

// ============================================================================
// Statistics
// ============================================================================

/// Orchestrator statistics, returned when the loop exits.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub intents_received: u64,
    pub intents_rejected: u64,
    pub capture_events: u64,
    pub activations: u64,
    pub reconstructions_started: u64,
    pub uploads_attempted: u64,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            started_at: chrono::Utc::now(),
            intents_received: 0,
            intents_rejected: 0,
            capture_events: 0,
            activations: 0,
            reconstructions_started: 0,
            uploads_attempted: 0,
        }
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let uptime = chrono::Utc::now().signed_duration_since(self.started_at);
        write!(
            f,
            "Pipeline: {} intents ({} rejected), {} capture events, {} activations, {} reconstructions, {} uploads, up {}s",
            self.intents_received,
            self.intents_rejected,
            self.capture_events,
            self.activations,
            self.reconstructions_started,
            self.uploads_attempted,
            uptime.num_seconds()
        )
    }
}

// ============================================================================
// Presentation Handle
// ============================================================================

/// The presentation layer's view of the pipeline: an intent sink plus a
/// continuously-updated read-only state snapshot.
#[derive(Clone)]
pub struct PipelineHandle {
    intent_tx: mpsc::Sender<PipelineIntent>,
    state_rx: watch::Receiver<PipelineState>,
}

impl PipelineHandle {
    /// Send an intent. Returns `false` when the orchestrator has shut down.
    pub async fn send(&self, intent: PipelineIntent) -> bool {
        self.intent_tx.send(intent).await.is_ok()
    }

    /// Current state snapshot.
    pub fn state(&self) -> PipelineState {
        self.state_rx.borrow().clone()
    }

    /// A watch receiver following every published snapshot.
    pub fn watch(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Owns the pipeline state and the coordinating event loop.
pub struct PipelineOrchestrator {
    deps: PipelineDeps,
    state: PipelineState,
    state_tx: watch::Sender<PipelineState>,
    intent_rx: mpsc::Receiver<PipelineIntent>,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    session: Option<Box<dyn CaptureSession>>,
    generation: u64,
    activation_token: CancellationToken,
    shutdown: CancellationToken,
    stats: PipelineStats,
}

impl PipelineOrchestrator {
    /// Spawn the orchestrator task.
    ///
    /// Returns the presentation handle and the join handle resolving to the
    /// final statistics once `shutdown` is cancelled (or every handle is
    /// dropped).
    pub fn spawn(
        deps: PipelineDeps,
        initial_mode: CaptureMode,
        shutdown: CancellationToken,
    ) -> (PipelineHandle, JoinHandle<PipelineStats>) {
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_BUFFER);
        let state = PipelineState::new(initial_mode);
        let (state_tx, state_rx) = watch::channel(state.clone());

        let orchestrator = Self {
            deps,
            state,
            state_tx,
            intent_rx,
            events_tx,
            events_rx,
            session: None,
            generation: 0,
            activation_token: shutdown.child_token(),
            shutdown,
            stats: PipelineStats::new(),
        };

        let handle = PipelineHandle {
            intent_tx,
            state_rx,
        };
        let join = tokio::spawn(orchestrator.run());
        (handle, join)
    }

    async fn run(mut self) -> PipelineStats {
        info!(mode = %self.state.capture_mode, "Pipeline orchestrator started");
        self.reset_activation().await;
        self.publish();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                intent = self.intent_rx.recv() => {
                    match intent {
                        Some(intent) => {
                            self.stats.intents_received += 1;
                            self.handle_intent(intent).await;
                            self.publish();
                        }
                        None => {
                            info!("Intent channel closed, shutting down");
                            break;
                        }
                    }
                }
                event = self.events_rx.recv() => {
                    // events_tx lives on self, so the channel never closes
                    // while the loop runs.
                    if let Some(event) = event {
                        self.handle_event(event);
                        self.publish();
                    }
                }
            }
        }

        self.activation_token.cancel();
        info!(stats = %self.stats, "Pipeline orchestrator stopped");
        self.stats
    }

    /// Republish the state snapshot when it changed.
    fn publish(&self) {
        if *self.state_tx.borrow() != self.state {
            let _ = self.state_tx.send(self.state.clone());
        }
    }

    /// Record a rejected intent. Precondition violations are logged no-ops.
    fn reject(&mut self, intent: &PipelineIntent, reason: &str) {
        self.stats.intents_rejected += 1;
        warn!(
            intent = %intent,
            phase = %self.state.session_phase,
            reason,
            "Intent rejected"
        );
    }

    /// A capture command failed at the engine boundary. Session-fatal,
    /// same as an engine error event.
    fn fail_session(&mut self, err: &CaptureError) {
        warn!(error = %err, "Capture command failed, session failed");
        self.state.session_phase = SessionPhase::Failed(err.to_string());
    }

    // ------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------

    async fn handle_intent(&mut self, intent: PipelineIntent) {
        debug!(intent = %intent, "Intent received");
        match intent {
            PipelineIntent::ToggleCaptureMode => {
                self.state.capture_mode = self.state.capture_mode.toggled();
                info!(mode = %self.state.capture_mode, "Capture mode toggled, resetting pipeline");
                self.reset_activation().await;
            }
            PipelineIntent::Reset => {
                info!("Pipeline reset requested");
                self.reset_activation().await;
            }
            PipelineIntent::StartDetecting => self.handle_start_detecting().await,
            PipelineIntent::StartCapturing => self.handle_start_capturing().await,
            PipelineIntent::FinishCapturing => self.handle_finish_capturing().await,
            PipelineIntent::SetOverlayVisible(visible) => self.handle_set_overlay(visible).await,
            PipelineIntent::StartReconstruction => self.handle_start_reconstruction().await,
            PipelineIntent::UploadModel => self.handle_upload_model().await,
        }
    }

    async fn handle_start_detecting(&mut self) {
        if self.state.capture_mode != CaptureMode::Object {
            self.reject(&PipelineIntent::StartDetecting, "detection is object-mode only");
            return;
        }
        if !matches!(
            self.state.session_phase,
            SessionPhase::Ready | SessionPhase::Detecting
        ) {
            self.reject(&PipelineIntent::StartDetecting, "session not ready for detection");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            self.reject(&PipelineIntent::StartDetecting, "no live capture session");
            return;
        };
        match session.start_detecting().await {
            Ok(true) => {
                self.state.detection_failed = false;
            }
            Ok(false) => {
                // Recoverable: the user may retry or capture directly.
                info!("Object detection failed, surfacing flag");
                self.state.detection_failed = true;
            }
            Err(e) => self.fail_session(&e),
        }
    }

    async fn handle_start_capturing(&mut self) {
        if !matches!(
            self.state.session_phase,
            SessionPhase::Ready | SessionPhase::Detecting
        ) {
            self.reject(&PipelineIntent::StartCapturing, "session not ready to capture");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            self.reject(&PipelineIntent::StartCapturing, "no live capture session");
            return;
        };
        if let Err(e) = session.start_capturing().await {
            self.fail_session(&e);
        }
    }

    async fn handle_finish_capturing(&mut self) {
        if self.state.session_phase != SessionPhase::Capturing {
            self.reject(&PipelineIntent::FinishCapturing, "not capturing");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            self.reject(&PipelineIntent::FinishCapturing, "no live capture session");
            return;
        };
        // The engine's terminal event is authoritative for Completed;
        // this only asks it to stop.
        if let Err(e) = session.finish().await {
            self.fail_session(&e);
        }
    }

    async fn handle_set_overlay(&mut self, visible: bool) {
        if visible == self.state.overlay_visible {
            debug!(visible, "Overlay already in requested state, no-op");
            return;
        }
        if visible {
            self.state.overlay_visible = true;
            if let Some(session) = self.session.as_mut() {
                debug!("Overlay shown, pausing capture session");
                if let Err(e) = session.pause().await {
                    self.fail_session(&e);
                }
            }
        } else {
            self.state.overlay_visible = false;
            self.state.scan_pass_pending_review = false;
            if self.state.session_phase.is_resumable() {
                if let Some(session) = self.session.as_mut() {
                    debug!("Overlay hidden, resuming capture session");
                    if let Err(e) = session.resume().await {
                        self.fail_session(&e);
                    }
                }
            } else {
                debug!(
                    phase = %self.state.session_phase,
                    "Resume suppressed, session not running"
                );
            }
        }
    }

    async fn handle_start_reconstruction(&mut self) {
        if self.state.session_phase != SessionPhase::Completed {
            self.reject(&PipelineIntent::StartReconstruction, "capture not completed");
            return;
        }
        if self.state.reconstruction.is_in_flight() {
            self.reject(&PipelineIntent::StartReconstruction, "reconstruction already in flight");
            return;
        }
        if self.state.reconstruction != ReconstructionStatus::Idle
            || self.state.model_path.is_some()
        {
            self.reject(&PipelineIntent::StartReconstruction, "reconstruction already ran");
            return;
        }

        let input_dir = self.deps.store.scans_dir();
        let output = self.deps.store.model_output_path();
        self.state.reconstruction = ReconstructionStatus::Preparing;
        self.stats.reconstructions_started += 1;
        info!(
            input = %input_dir.display(),
            output = %output.display(),
            "Reconstruction requested"
        );

        // A failed open or request submission is an immediate error
        // terminal event.
        let mut job = match self.deps.reconstruction.open(&input_dir).await {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Reconstruction session failed to open");
                self.state.reconstruction = ReconstructionStatus::Failed(e.to_string());
                return;
            }
        };
        if let Err(e) = job.process(&output).await {
            warn!(error = %e, "Reconstruction request failed");
            self.state.reconstruction = ReconstructionStatus::Failed(e.to_string());
            return;
        }

        let tx = self.events_tx.clone();
        let generation = self.generation;
        let token = self.activation_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = job.next_event() => match event {
                        Some(event) => {
                            if tx
                                .send(EngineEvent::Reconstruction { generation, event })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    async fn handle_upload_model(&mut self) {
        let Some(path) = self.state.model_path.clone() else {
            self.reject(&PipelineIntent::UploadModel, "no model to upload");
            return;
        };
        if self.state.upload == UploadStatus::InFlight {
            self.reject(&PipelineIntent::UploadModel, "upload already in flight");
            return;
        }

        self.state.upload = UploadStatus::InFlight;
        self.stats.uploads_attempted += 1;
        info!(file = %path.display(), "Upload started");

        // Single attempt; never cancelled. A result arriving after a reset
        // carries a stale generation and is discarded.
        let uploader = Arc::clone(&self.deps.uploader);
        let tx = self.events_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = uploader.upload(&path).await;
            let _ = tx
                .send(EngineEvent::UploadSettled { generation, result })
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Collaborator Events
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Capture { generation, event } => {
                if generation != self.generation {
                    trace!(generation, "Discarding stale capture event");
                    return;
                }
                self.stats.capture_events += 1;
                self.handle_session_event(event);
            }
            EngineEvent::Reconstruction { generation, event } => {
                if generation != self.generation {
                    trace!(generation, "Discarding stale reconstruction event");
                    return;
                }
                self.handle_reconstruction_event(event);
            }
            EngineEvent::UploadSettled { generation, result } => {
                if generation != self.generation {
                    trace!(generation, "Discarding upload result for superseded activation");
                    return;
                }
                self.handle_upload_settled(result);
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        if matches!(self.state.session_phase, SessionPhase::Failed(_)) {
            // A failed session stays failed until the next reset.
            debug!("Ignoring capture event after session failure");
            return;
        }
        match event {
            SessionEvent::StateChanged(engine_phase) => {
                let phase = SessionPhase::from(engine_phase);
                if phase != self.state.session_phase {
                    debug!(from = %self.state.session_phase, to = %phase, "Session phase changed");
                    self.state.session_phase = phase;
                }
            }
            SessionEvent::ShotCountChanged { taken, max } => {
                // Stale counters outside capture are expected; leave them.
                if self.state.session_phase.tracks_shots() {
                    self.state.shots_taken = taken;
                    self.state.shots_max = max;
                }
            }
            SessionEvent::ScanPassCompleted => {
                if self.state.session_phase == SessionPhase::Capturing {
                    info!(shots = self.state.shots_taken, "Scan pass completed, review available");
                    self.state.scan_pass_pending_review = true;
                }
            }
            SessionEvent::Error(reason) => {
                warn!(reason = %reason, "Capture engine error, session failed");
                self.state.session_phase = SessionPhase::Failed(reason);
            }
        }
    }

    fn handle_reconstruction_event(&mut self, event: ReconstructionEvent) {
        if !self.state.reconstruction.is_in_flight() {
            debug!("Ignoring reconstruction event, no job in flight");
            return;
        }
        match event {
            ReconstructionEvent::Progress(fraction) => {
                self.state.reconstruction =
                    ReconstructionStatus::Progressing(clamp_fraction(fraction));
            }
            ReconstructionEvent::Complete { output } => {
                info!(output = %output.display(), "Reconstruction complete");
                self.state.model_path = Some(output.clone());
                self.state.reconstruction = ReconstructionStatus::Complete(output);
            }
            ReconstructionEvent::Error(reason) => {
                warn!(reason = %reason, "Reconstruction failed");
                self.state.reconstruction = ReconstructionStatus::Failed(reason);
            }
        }
    }

    fn handle_upload_settled(&mut self, result: Result<UploadResponse, UploadError>) {
        if self.state.upload != UploadStatus::InFlight {
            debug!("Ignoring upload result, no upload in flight");
            return;
        }
        match result {
            Ok(response) if response.success => {
                info!(
                    message = %response.message,
                    file_id = response.file_id.as_deref().unwrap_or("-"),
                    "Upload succeeded"
                );
                self.state.upload = UploadStatus::Succeeded(response.message);
            }
            Ok(response) => {
                warn!(message = %response.message, "Upload rejected by server");
                self.state.upload = UploadStatus::Failed(response.message);
            }
            Err(e) => {
                warn!(error = %e, "Upload transport error");
                self.state.upload = UploadStatus::Failed(e.to_string());
            }
        }
    }

    // ------------------------------------------------------------------
    // Activation / Reset
    // ------------------------------------------------------------------

    /// Tear down the current activation and start a fresh one.
    ///
    /// Runs to completion before the loop touches another message, so the
    /// presentation layer can never observe a half-reset snapshot: the
    /// single publish after this call already carries the new mode, the
    /// cleared fields, and the fresh session's generation.
    async fn reset_activation(&mut self) {
        self.generation += 1;
        self.stats.activations += 1;
        self.activation_token.cancel();
        self.activation_token = self.shutdown.child_token();
        self.session = None;
        self.state.reset_for_activation();

        let scans = self.deps.store.scans_dir();
        if let Err(e) = self.deps.store.clear_dir(&scans) {
            warn!(error = %e, "Failed to clear staging directory, continuing");
        }

        let config = SessionConfig {
            over_capture_enabled: self.state.capture_mode == CaptureMode::Object,
        };
        match self.deps.capture.open_session(&scans, config).await {
            Ok((session, events)) => {
                self.session = Some(session);
                self.spawn_capture_forwarder(events);
                info!(
                    mode = %self.state.capture_mode,
                    generation = self.generation,
                    over_capture = config.over_capture_enabled,
                    "New capture session acquired"
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to acquire capture session");
                self.state.session_phase = SessionPhase::Failed(e.to_string());
            }
        }
    }

    /// Forward the session's event stream onto the merged channel until the
    /// activation is superseded or the stream ends.
    fn spawn_capture_forwarder(&self, mut events: mpsc::Receiver<SessionEvent>) {
        let tx = self.events_tx.clone();
        let generation = self.generation;
        let token = self.activation_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if tx
                                .send(EngineEvent::Capture { generation, event })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }
}

impl From<crate::capture::EnginePhase> for SessionPhase {
    fn from(phase: crate::capture::EnginePhase) -> Self {
        use crate::capture::EnginePhase;
        match phase {
            EnginePhase::Initializing => SessionPhase::NotStarted,
            EnginePhase::Ready => SessionPhase::Ready,
            EnginePhase::Detecting => SessionPhase::Detecting,
            EnginePhase::Capturing => SessionPhase::Capturing,
            EnginePhase::Finishing => SessionPhase::Finishing,
            EnginePhase::Completed => SessionPhase::Completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{
        CaptureScript, RecordedCommand, ReconstructionOutcome, ReconstructionScript,
        ScriptedCaptureBackend, ScriptedReconstruction, ScriptedUploader,
    };
    use crate::storage::DiskStore;
    use std::time::Duration;

    struct TestPipeline {
        handle: PipelineHandle,
        capture: Arc<ScriptedCaptureBackend>,
        reconstruction: Arc<ScriptedReconstruction>,
        uploader: Arc<ScriptedUploader>,
        shutdown: CancellationToken,
        join: JoinHandle<PipelineStats>,
        _tmp: tempfile::TempDir,
    }

    impl TestPipeline {
        async fn stop(self) -> PipelineStats {
            self.shutdown.cancel();
            self.join.await.expect("orchestrator task panicked")
        }
    }

    fn spawn_pipeline(
        script: CaptureScript,
        recon: ReconstructionScript,
        uploads: Vec<Result<UploadResponse, String>>,
    ) -> TestPipeline {
        let tmp = tempfile::tempdir().expect("tempdir");
        let capture = Arc::new(ScriptedCaptureBackend::new(script));
        let reconstruction = Arc::new(ScriptedReconstruction::new(recon));
        let uploader = Arc::new(ScriptedUploader::scripted(uploads));
        let store = Arc::new(DiskStore::new(tmp.path(), false));
        let shutdown = CancellationToken::new();
        let deps = PipelineDeps {
            capture: capture.clone(),
            reconstruction: reconstruction.clone(),
            uploader: uploader.clone(),
            store,
        };
        let (handle, join) =
            PipelineOrchestrator::spawn(deps, CaptureMode::Object, shutdown.clone());
        TestPipeline {
            handle,
            capture,
            reconstruction,
            uploader,
            shutdown,
            join,
            _tmp: tmp,
        }
    }

    async fn wait_state(
        handle: &PipelineHandle,
        pred: impl FnMut(&PipelineState) -> bool,
    ) -> PipelineState {
        let mut rx = handle.watch();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for pipeline state")
            .expect("orchestrator stopped")
            .clone();
        state
    }

    async fn send(handle: &PipelineHandle, intent: PipelineIntent) {
        assert!(handle.send(intent).await, "orchestrator gone");
    }

    /// Barrier: all previously-sent intents have been processed once the
    /// overlay round-trip below is visible in the state stream.
    async fn sync_intents(handle: &PipelineHandle) {
        send(handle, PipelineIntent::SetOverlayVisible(true)).await;
        wait_state(handle, |s| s.overlay_visible).await;
        send(handle, PipelineIntent::SetOverlayVisible(false)).await;
        wait_state(handle, |s| !s.overlay_visible).await;
    }

    async fn drive_to_capturing(p: &TestPipeline) {
        wait_state(&p.handle, |s| {
            matches!(
                s.session_phase,
                SessionPhase::Ready | SessionPhase::Detecting
            )
        })
        .await;
        send(&p.handle, PipelineIntent::StartCapturing).await;
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Capturing).await;
    }

    async fn drive_to_completed(p: &TestPipeline, shots: u32) {
        drive_to_capturing(p).await;
        wait_state(&p.handle, |s| s.shots_taken >= shots).await;
        send(&p.handle, PipelineIntent::FinishCapturing).await;
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Completed).await;
    }

    async fn drive_to_model(p: &TestPipeline, shots: u32) -> PipelineState {
        drive_to_completed(p, shots).await;
        send(&p.handle, PipelineIntent::StartReconstruction).await;
        wait_state(&p.handle, |s| {
            matches!(s.reconstruction, ReconstructionStatus::Complete(_))
        })
        .await
    }

    #[tokio::test]
    async fn test_happy_path_capture_to_model() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 5,
                ..CaptureScript::default()
            },
            ReconstructionScript {
                progress_steps: vec![0.2, 0.6],
                ..ReconstructionScript::default()
            },
            Vec::new(),
        );

        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Ready).await;
        send(&p.handle, PipelineIntent::StartDetecting).await;
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Detecting).await;

        let state = drive_to_model(&p, 5).await;
        let expected = p._tmp.path().join("model.usdz");
        assert_eq!(state.reconstruction, ReconstructionStatus::Complete(expected.clone()));
        assert_eq!(state.model_path, Some(expected));
        assert_eq!(state.upload, UploadStatus::Idle);
        assert!(!state.detection_failed);

        let stats = p.stop().await;
        assert_eq!(stats.activations, 1);
        assert_eq!(stats.reconstructions_started, 1);
        assert_eq!(stats.uploads_attempted, 0);
    }

    #[tokio::test]
    async fn test_overlay_edges_map_to_pause_resume_exactly_once() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 3,
                ..CaptureScript::default()
            },
            ReconstructionScript::default(),
            Vec::new(),
        );
        drive_to_capturing(&p).await;

        // Two true edges and two false edges, with idempotent duplicates
        // interleaved.
        send(&p.handle, PipelineIntent::SetOverlayVisible(true)).await;
        send(&p.handle, PipelineIntent::SetOverlayVisible(true)).await;
        wait_state(&p.handle, |s| s.overlay_visible).await;
        send(&p.handle, PipelineIntent::SetOverlayVisible(false)).await;
        send(&p.handle, PipelineIntent::SetOverlayVisible(false)).await;
        wait_state(&p.handle, |s| !s.overlay_visible).await;
        send(&p.handle, PipelineIntent::SetOverlayVisible(true)).await;
        wait_state(&p.handle, |s| s.overlay_visible).await;
        send(&p.handle, PipelineIntent::SetOverlayVisible(false)).await;
        wait_state(&p.handle, |s| !s.overlay_visible).await;

        let log = p.capture.log();
        assert_eq!(log.count(RecordedCommand::Pause), 2);
        assert_eq!(log.count(RecordedCommand::Resume), 2);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_resume_suppressed_outside_running_phases() {
        let p = spawn_pipeline(
            CaptureScript::default(),
            ReconstructionScript::default(),
            Vec::new(),
        );
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Ready).await;

        // Overlay round-trip while merely Ready: pause fires, resume is
        // suppressed because the session is not running.
        send(&p.handle, PipelineIntent::SetOverlayVisible(true)).await;
        wait_state(&p.handle, |s| s.overlay_visible).await;
        send(&p.handle, PipelineIntent::SetOverlayVisible(false)).await;
        wait_state(&p.handle, |s| !s.overlay_visible).await;

        let log = p.capture.log();
        assert_eq!(log.count(RecordedCommand::Pause), 1);
        assert_eq!(log.count(RecordedCommand::Resume), 0);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_toggle_mode_resets_everything() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 4,
                ..CaptureScript::default()
            },
            ReconstructionScript::default(),
            vec![ScriptedUploader::acceptance("stored")],
        );

        drive_to_model(&p, 4).await;
        send(&p.handle, PipelineIntent::UploadModel).await;
        wait_state(&p.handle, |s| {
            matches!(s.upload, UploadStatus::Succeeded(_))
        })
        .await;

        send(&p.handle, PipelineIntent::ToggleCaptureMode).await;
        let state = wait_state(&p.handle, |s| {
            s.capture_mode == CaptureMode::Area && s.session_phase == SessionPhase::Ready
        })
        .await;

        assert_eq!(state.reconstruction, ReconstructionStatus::Idle);
        assert_eq!(state.upload, UploadStatus::Idle);
        assert!(state.model_path.is_none());
        assert_eq!(state.shots_taken, 0);
        assert!(!state.overlay_visible);
        assert!(!state.scan_pass_pending_review);
        // A brand-new engine session was acquired for the new mode.
        assert_eq!(p.capture.sessions_opened(), 2);

        let stats = p.stop().await;
        assert_eq!(stats.activations, 2);
    }

    #[tokio::test]
    async fn test_reconstruction_at_most_one_in_flight() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 3,
                ..CaptureScript::default()
            },
            ReconstructionScript {
                step_delay_ms: 200,
                ..ReconstructionScript::default()
            },
            Vec::new(),
        );
        drive_to_completed(&p, 3).await;

        send(&p.handle, PipelineIntent::StartReconstruction).await;
        send(&p.handle, PipelineIntent::StartReconstruction).await;
        sync_intents(&p.handle).await;

        assert_eq!(p.reconstruction.sessions_opened(), 1);
        wait_state(&p.handle, |s| {
            matches!(s.reconstruction, ReconstructionStatus::Complete(_))
        })
        .await;
        // Still exactly one engine session after the first one finished.
        assert_eq!(p.reconstruction.sessions_opened(), 1);

        let stats = p.stop().await;
        assert_eq!(stats.reconstructions_started, 1);
        assert!(stats.intents_rejected >= 1);
    }

    #[tokio::test]
    async fn test_upload_failure_then_retry() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 3,
                ..CaptureScript::default()
            },
            ReconstructionScript::default(),
            vec![
                ScriptedUploader::rejection("quota exceeded"),
                ScriptedUploader::acceptance("stored"),
            ],
        );
        drive_to_model(&p, 3).await;

        send(&p.handle, PipelineIntent::UploadModel).await;
        let state = wait_state(&p.handle, |s| {
            matches!(s.upload, UploadStatus::Failed(_))
        })
        .await;
        assert_eq!(state.upload, UploadStatus::Failed("quota exceeded".to_string()));

        // A new explicit intent is accepted once the attempt settled.
        send(&p.handle, PipelineIntent::UploadModel).await;
        wait_state(&p.handle, |s| {
            matches!(s.upload, UploadStatus::Succeeded(_))
        })
        .await;
        assert_eq!(p.uploader.uploads_attempted(), 2);

        let stats = p.stop().await;
        assert_eq!(stats.uploads_attempted, 2);
    }

    #[tokio::test]
    async fn test_detection_failure_is_reported_not_fatal() {
        let p = spawn_pipeline(
            CaptureScript {
                detect_result: false,
                shots: 3,
                ..CaptureScript::default()
            },
            ReconstructionScript::default(),
            Vec::new(),
        );
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Ready).await;

        send(&p.handle, PipelineIntent::StartDetecting).await;
        let state = wait_state(&p.handle, |s| s.detection_failed).await;
        assert_eq!(state.session_phase, SessionPhase::Ready);

        // Fall back to direct capture.
        send(&p.handle, PipelineIntent::StartCapturing).await;
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Capturing).await;
        p.stop().await;
    }

    #[tokio::test]
    async fn test_progress_fractions_are_clamped() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 3,
                ..CaptureScript::default()
            },
            ReconstructionScript {
                progress_steps: vec![1.7],
                step_delay_ms: 100,
                ..ReconstructionScript::default()
            },
            Vec::new(),
        );
        drive_to_completed(&p, 3).await;

        // Subscribe before sending so the Progressing snapshot between the
        // delayed events cannot be missed.
        let mut rx = p.handle.watch();
        send(&p.handle, PipelineIntent::StartReconstruction).await;
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| matches!(s.reconstruction, ReconstructionStatus::Progressing(_))),
        )
        .await
        .expect("timed out waiting for progress")
        .expect("orchestrator stopped")
        .clone();
        assert_eq!(state.reconstruction, ReconstructionStatus::Progressing(1.0));
        p.stop().await;
    }

    #[tokio::test]
    async fn test_stale_reconstruction_discarded_after_reset() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 3,
                ..CaptureScript::default()
            },
            ReconstructionScript {
                progress_steps: vec![0.3, 0.6],
                step_delay_ms: 150,
                ..ReconstructionScript::default()
            },
            Vec::new(),
        );
        drive_to_completed(&p, 3).await;
        send(&p.handle, PipelineIntent::StartReconstruction).await;
        wait_state(&p.handle, |s| s.reconstruction.is_in_flight()).await;

        // Reset abandons the job; whatever it still emits must not touch
        // the new activation's state.
        send(&p.handle, PipelineIntent::Reset).await;
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Ready).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        let state = p.handle.state();
        assert_eq!(state.reconstruction, ReconstructionStatus::Idle);
        assert!(state.model_path.is_none());
        p.stop().await;
    }

    #[tokio::test]
    async fn test_capture_engine_error_is_session_fatal() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 10,
                // Paced so the Capturing snapshot is observable before the
                // scripted engine error lands.
                shot_interval_ms: 20,
                fail_after_shots: Some(3),
                ..CaptureScript::default()
            },
            ReconstructionScript::default(),
            Vec::new(),
        );
        drive_to_capturing(&p).await;

        let state = wait_state(&p.handle, |s| {
            matches!(s.session_phase, SessionPhase::Failed(_))
        })
        .await;
        assert_eq!(
            state.session_phase,
            SessionPhase::Failed("tracking lost".to_string())
        );

        // No auto-retry: further capture intents are rejected.
        send(&p.handle, PipelineIntent::StartCapturing).await;
        sync_intents(&p.handle).await;
        assert!(matches!(
            p.handle.state().session_phase,
            SessionPhase::Failed(_)
        ));

        // An explicit reset recovers with a fresh session.
        send(&p.handle, PipelineIntent::Reset).await;
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Ready).await;
        assert_eq!(p.capture.sessions_opened(), 2);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_reconstruction_requires_completed_capture() {
        let p = spawn_pipeline(
            CaptureScript::default(),
            ReconstructionScript::default(),
            Vec::new(),
        );
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Ready).await;

        send(&p.handle, PipelineIntent::StartReconstruction).await;
        sync_intents(&p.handle).await;

        assert_eq!(p.handle.state().reconstruction, ReconstructionStatus::Idle);
        assert_eq!(p.reconstruction.sessions_opened(), 0);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_reconstruction_open_failure_is_immediate_error() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 3,
                ..CaptureScript::default()
            },
            ReconstructionScript {
                fail_open: true,
                ..ReconstructionScript::default()
            },
            Vec::new(),
        );
        drive_to_completed(&p, 3).await;

        send(&p.handle, PipelineIntent::StartReconstruction).await;
        let state = wait_state(&p.handle, |s| {
            matches!(s.reconstruction, ReconstructionStatus::Failed(_))
        })
        .await;
        assert!(state.model_path.is_none());
        p.stop().await;
    }

    #[tokio::test]
    async fn test_reconstruction_job_error_surfaces_as_failed() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 3,
                ..CaptureScript::default()
            },
            ReconstructionScript {
                progress_steps: vec![0.4],
                outcome: ReconstructionOutcome::Error("mesh solve failed".to_string()),
                ..ReconstructionScript::default()
            },
            Vec::new(),
        );
        drive_to_completed(&p, 3).await;

        send(&p.handle, PipelineIntent::StartReconstruction).await;
        let state = wait_state(&p.handle, |s| {
            matches!(s.reconstruction, ReconstructionStatus::Failed(_))
        })
        .await;
        assert_eq!(
            state.reconstruction,
            ReconstructionStatus::Failed("mesh solve failed".to_string())
        );
        assert!(state.model_path.is_none());
        // No automatic retry happened.
        assert_eq!(p.reconstruction.sessions_opened(), 1);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_upload_requires_model() {
        let p = spawn_pipeline(
            CaptureScript::default(),
            ReconstructionScript::default(),
            Vec::new(),
        );
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Ready).await;

        send(&p.handle, PipelineIntent::UploadModel).await;
        sync_intents(&p.handle).await;

        assert_eq!(p.handle.state().upload, UploadStatus::Idle);
        assert_eq!(p.uploader.uploads_attempted(), 0);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_scan_pass_sets_pending_review_until_overlay_hides() {
        let p = spawn_pipeline(
            CaptureScript {
                shots: 5,
                scan_pass_after: Some(2),
                ..CaptureScript::default()
            },
            ReconstructionScript::default(),
            Vec::new(),
        );
        drive_to_capturing(&p).await;

        wait_state(&p.handle, |s| s.scan_pass_pending_review).await;

        // Presentation shows the review overlay, then dismisses it; the
        // pending flag clears with the overlay.
        send(&p.handle, PipelineIntent::SetOverlayVisible(true)).await;
        wait_state(&p.handle, |s| s.overlay_visible).await;
        send(&p.handle, PipelineIntent::SetOverlayVisible(false)).await;
        let state = wait_state(&p.handle, |s| !s.overlay_visible).await;
        assert!(!state.scan_pass_pending_review);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_area_mode_rejects_detection() {
        let p = spawn_pipeline(
            CaptureScript::default(),
            ReconstructionScript::default(),
            Vec::new(),
        );
        wait_state(&p.handle, |s| s.session_phase == SessionPhase::Ready).await;
        send(&p.handle, PipelineIntent::ToggleCaptureMode).await;
        wait_state(&p.handle, |s| {
            s.capture_mode == CaptureMode::Area && s.session_phase == SessionPhase::Ready
        })
        .await;

        send(&p.handle, PipelineIntent::StartDetecting).await;
        sync_intents(&p.handle).await;

        // No detection command reached the engine, phase unchanged.
        assert_eq!(p.capture.log().count(RecordedCommand::StartDetecting), 0);
        assert_eq!(p.handle.state().session_phase, SessionPhase::Ready);
        p.stop().await;
    }

    #[tokio::test]
    async fn test_session_open_failure_reports_failed_phase() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let capture = Arc::new(ScriptedCaptureBackend::failing_open());
        let reconstruction = Arc::new(ScriptedReconstruction::new(ReconstructionScript::default()));
        let uploader = Arc::new(ScriptedUploader::succeeding());
        let store = Arc::new(DiskStore::new(tmp.path(), false));
        let shutdown = CancellationToken::new();
        let deps = PipelineDeps {
            capture,
            reconstruction,
            uploader,
            store,
        };
        let (handle, join) =
            PipelineOrchestrator::spawn(deps, CaptureMode::Object, shutdown.clone());

        let mut rx = handle.watch();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| matches!(s.session_phase, SessionPhase::Failed(_))),
        )
        .await
        .expect("timed out")
        .expect("orchestrator stopped")
        .clone();
        assert!(matches!(state.session_phase, SessionPhase::Failed(_)));

        shutdown.cancel();
        join.await.expect("orchestrator task panicked");
    }
}
