//! Scripted collaborator engines.
//!
//! Deterministic stand-ins for the platform capture engine, the
//! reconstruction engine, and the uploader. The demo binary drives the full
//! pipeline against these, and the orchestrator tests use them to script
//! failure injection and to record the commands the orchestrator issued.

use crate::capture::{
    CaptureBackend, CaptureError, CaptureSession, EnginePhase, SessionConfig, SessionEvent,
    SESSION_EVENT_BUFFER,
};
use crate::reconstruction::{
    ReconstructionEngine, ReconstructionError, ReconstructionEvent, ReconstructionJob,
};
use crate::upload::{UploadError, UploadResponse, Uploader};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

// ============================================================================
// Command Log
// ============================================================================

/// A capture command observed by a scripted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedCommand {
    StartDetecting,
    StartCapturing,
    Finish,
    Pause,
    Resume,
}

/// Shared record of every command issued to scripted sessions.
///
/// Cloned into each session a backend opens, so command counts survive a
/// mode-reset that discards the session handle.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    inner: Arc<Mutex<Vec<RecordedCommand>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, command: RecordedCommand) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
    }

    /// All commands in issue order.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times `command` was issued.
    pub fn count(&self, command: RecordedCommand) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| **c == command)
            .count()
    }
}

// ============================================================================
// Scripted Capture Engine
// ============================================================================

/// Behavior script for scripted capture sessions.
#[derive(Debug, Clone)]
pub struct CaptureScript {
    /// Result of `start_detecting`.
    pub detect_result: bool,
    /// Shots emitted after `start_capturing`.
    pub shots: u32,
    /// Engine shot ceiling reported with every shot event.
    pub max_shots: u32,
    /// Milliseconds between simulated shots (0 = emit back-to-back).
    pub shot_interval_ms: u64,
    /// Jitter shot pacing by up to ±50% for demo realism.
    pub jitter: bool,
    /// Signal a completed scan pass after this many shots.
    pub scan_pass_after: Option<u32>,
    /// Emit a session-fatal engine error after this many shots.
    pub fail_after_shots: Option<u32>,
}

impl Default for CaptureScript {
    fn default() -> Self {
        Self {
            detect_result: true,
            shots: 20,
            max_shots: 100,
            shot_interval_ms: 0,
            jitter: false,
            scan_pass_after: None,
            fail_after_shots: None,
        }
    }
}

/// Scripted capture backend. Each `open_session` hands out a fresh session
/// wired to the shared command log.
pub struct ScriptedCaptureBackend {
    script: CaptureScript,
    log: CommandLog,
    sessions_opened: AtomicUsize,
    fail_open: bool,
}

impl ScriptedCaptureBackend {
    pub fn new(script: CaptureScript) -> Self {
        Self {
            script,
            log: CommandLog::new(),
            sessions_opened: AtomicUsize::new(0),
            fail_open: false,
        }
    }

    /// A backend whose `open_session` always fails.
    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::new(CaptureScript::default())
        }
    }

    /// Shared command log across all sessions this backend opened.
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// Number of sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for ScriptedCaptureBackend {
    async fn open_session(
        &self,
        _images_dir: &Path,
        _config: SessionConfig,
    ) -> Result<(Box<dyn CaptureSession>, mpsc::Receiver<SessionEvent>), CaptureError> {
        if self.fail_open {
            return Err(CaptureError::StartFailed(
                "scripted session start failure".to_string(),
            ));
        }
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);

        let (events, rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        // The engine reports Ready once the session is live.
        let _ = events.try_send(SessionEvent::StateChanged(EnginePhase::Ready));

        let session = ScriptedCaptureSession {
            script: self.script.clone(),
            events,
            log: self.log.clone(),
            shot_task: None,
        };
        Ok((Box::new(session), rx))
    }
}

/// A scripted live session. Phase events are emitted in response to
/// commands; shots stream from a paced background task.
pub struct ScriptedCaptureSession {
    script: CaptureScript,
    events: mpsc::Sender<SessionEvent>,
    log: CommandLog,
    shot_task: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for ScriptedCaptureSession {
    fn drop(&mut self) {
        if let Some(task) = self.shot_task.take() {
            task.abort();
        }
    }
}

async fn emit_shots(script: CaptureScript, events: mpsc::Sender<SessionEvent>) {
    for shot in 1..=script.shots {
        if script.shot_interval_ms > 0 {
            let delay = if script.jitter {
                let lo = script.shot_interval_ms / 2;
                let hi = script.shot_interval_ms * 3 / 2;
                rand::thread_rng().gen_range(lo..=hi)
            } else {
                script.shot_interval_ms
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if events
            .send(SessionEvent::ShotCountChanged {
                taken: shot,
                max: script.max_shots,
            })
            .await
            .is_err()
        {
            return;
        }
        if Some(shot) == script.scan_pass_after
            && events.send(SessionEvent::ScanPassCompleted).await.is_err()
        {
            return;
        }
        if Some(shot) == script.fail_after_shots {
            let _ = events
                .send(SessionEvent::Error("tracking lost".to_string()))
                .await;
            return;
        }
    }
}

#[async_trait]
impl CaptureSession for ScriptedCaptureSession {
    async fn start_detecting(&mut self) -> Result<bool, CaptureError> {
        self.log.record(RecordedCommand::StartDetecting);
        if self.script.detect_result {
            let _ = self
                .events
                .send(SessionEvent::StateChanged(EnginePhase::Detecting))
                .await;
        }
        Ok(self.script.detect_result)
    }

    async fn start_capturing(&mut self) -> Result<(), CaptureError> {
        self.log.record(RecordedCommand::StartCapturing);
        let _ = self
            .events
            .send(SessionEvent::StateChanged(EnginePhase::Capturing))
            .await;
        let script = self.script.clone();
        let events = self.events.clone();
        self.shot_task = Some(tokio::spawn(emit_shots(script, events)));
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), CaptureError> {
        self.log.record(RecordedCommand::Finish);
        if let Some(task) = self.shot_task.take() {
            task.abort();
        }
        let _ = self
            .events
            .send(SessionEvent::StateChanged(EnginePhase::Finishing))
            .await;
        let _ = self
            .events
            .send(SessionEvent::StateChanged(EnginePhase::Completed))
            .await;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), CaptureError> {
        self.log.record(RecordedCommand::Pause);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), CaptureError> {
        self.log.record(RecordedCommand::Resume);
        Ok(())
    }
}

// ============================================================================
// Scripted Reconstruction Engine
// ============================================================================

/// Terminal outcome of a scripted reconstruction job.
#[derive(Debug, Clone)]
pub enum ReconstructionOutcome {
    /// Emit `Complete` pointing at the requested output path.
    Complete,
    /// Emit `Error` with the given reason.
    Error(String),
}

/// Behavior script for scripted reconstruction jobs.
#[derive(Debug, Clone)]
pub struct ReconstructionScript {
    /// Progress fractions emitted before the terminal event.
    pub progress_steps: Vec<f64>,
    /// Terminal event.
    pub outcome: ReconstructionOutcome,
    /// Delay before each emitted event.
    pub step_delay_ms: u64,
    /// `open()` fails as if the input directory were unusable.
    pub fail_open: bool,
    /// Write a placeholder model file at the output path on completion.
    pub write_output: bool,
}

impl Default for ReconstructionScript {
    fn default() -> Self {
        Self {
            progress_steps: vec![0.25, 0.5, 0.75],
            outcome: ReconstructionOutcome::Complete,
            step_delay_ms: 0,
            fail_open: false,
            write_output: false,
        }
    }
}

/// Scripted reconstruction engine.
pub struct ScriptedReconstruction {
    script: ReconstructionScript,
    sessions_opened: AtomicUsize,
}

impl ScriptedReconstruction {
    pub fn new(script: ReconstructionScript) -> Self {
        Self {
            script,
            sessions_opened: AtomicUsize::new(0),
        }
    }

    /// Number of engine sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReconstructionEngine for ScriptedReconstruction {
    async fn open(
        &self,
        input_dir: &Path,
    ) -> Result<Box<dyn ReconstructionJob>, ReconstructionError> {
        if self.script.fail_open {
            return Err(ReconstructionError::OpenFailed(format!(
                "input directory unusable: {}",
                input_dir.display()
            )));
        }
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedReconstructionJob {
            script: self.script.clone(),
            pending: VecDeque::new(),
        }))
    }
}

struct ScriptedReconstructionJob {
    script: ReconstructionScript,
    pending: VecDeque<ReconstructionEvent>,
}

#[async_trait]
impl ReconstructionJob for ScriptedReconstructionJob {
    async fn process(&mut self, output: &Path) -> Result<(), ReconstructionError> {
        for fraction in &self.script.progress_steps {
            self.pending
                .push_back(ReconstructionEvent::Progress(*fraction));
        }
        match &self.script.outcome {
            ReconstructionOutcome::Complete => self.pending.push_back(ReconstructionEvent::Complete {
                output: output.to_path_buf(),
            }),
            ReconstructionOutcome::Error(reason) => self
                .pending
                .push_back(ReconstructionEvent::Error(reason.clone())),
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ReconstructionEvent> {
        let event = self.pending.pop_front()?;
        if self.script.step_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.script.step_delay_ms)).await;
        }
        if self.script.write_output {
            if let ReconstructionEvent::Complete { output } = &event {
                if let Err(e) = tokio::fs::write(output, b"scripted model output").await {
                    warn!(path = %output.display(), error = %e, "Failed to write scripted model file");
                }
            }
        }
        Some(event)
    }
}

// ============================================================================
// Scripted Uploader
// ============================================================================

/// Scripted uploader. Pops queued results in order; once the queue is
/// empty every upload succeeds with a generated file id.
pub struct ScriptedUploader {
    responses: Mutex<VecDeque<Result<UploadResponse, String>>>,
    uploads_attempted: AtomicUsize,
}

impl ScriptedUploader {
    /// An uploader that always succeeds.
    pub fn succeeding() -> Self {
        Self::scripted(Vec::new())
    }

    /// An uploader that replays the given results in order. `Err(msg)`
    /// entries become transport errors.
    pub fn scripted(responses: Vec<Result<UploadResponse, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            uploads_attempted: AtomicUsize::new(0),
        }
    }

    /// A server-side rejection with the given message.
    pub fn rejection(message: &str) -> Result<UploadResponse, String> {
        Ok(UploadResponse {
            success: false,
            message: message.to_string(),
            file_id: None,
        })
    }

    /// A server-side acceptance with the given message.
    pub fn acceptance(message: &str) -> Result<UploadResponse, String> {
        Ok(UploadResponse {
            success: true,
            message: message.to_string(),
            file_id: Some(uuid::Uuid::new_v4().to_string()),
        })
    }

    /// Number of upload attempts observed.
    pub fn uploads_attempted(&self) -> usize {
        self.uploads_attempted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Uploader for ScriptedUploader {
    async fn upload(&self, file: &Path) -> Result<UploadResponse, UploadError> {
        self.uploads_attempted.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(UploadError::Io(std::io::Error::other(message))),
            None => Ok(UploadResponse {
                success: true,
                message: format!("stored {}", file_label(file)),
                file_id: Some(uuid::Uuid::new_v4().to_string()),
            }),
        }
    }
}

fn file_label(file: &Path) -> String {
    file.file_name()
        .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned())
}
