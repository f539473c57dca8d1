//! scanforge demo driver.
//!
//! Runs the orchestrator end to end against scripted engines: acquires a
//! capture session, streams simulated shots, reconstructs a model file, and
//! uploads it (scripted by default, live HTTP with `--live-upload`).
//!
//! # Usage
//!
//! ```bash
//! # Object-mode run with defaults
//! cargo run --release
//!
//! # Area mode, 40 shots, slower pacing
//! cargo run --release -- --area --shots 40 --shot-interval-ms 100
//!
//! # Upload to the configured collection server
//! cargo run --release -- --live-upload
//! ```
//!
//! # Environment Variables
//!
//! - `SCANFORGE_CONFIG`: Path to a TOML config file (default: ./scanforge.toml)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scanforge::config::{self, PipelineConfig};
use scanforge::pipeline::{
    CaptureMode, PipelineDeps, PipelineHandle, PipelineIntent, PipelineOrchestrator,
    PipelineState, ReconstructionStatus, SessionPhase, UploadStatus,
};
use scanforge::sim::{
    CaptureScript, ReconstructionScript, ScriptedCaptureBackend, ScriptedReconstruction,
    ScriptedUploader,
};
use scanforge::storage::DiskStore;
use scanforge::upload::{HttpUploader, Uploader};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "scanforge")]
#[command(about = "Capture-to-model pipeline orchestrator")]
#[command(version)]
struct CliArgs {
    /// Start in area mode instead of object mode
    #[arg(long)]
    area: bool,

    /// Number of simulated shots to take
    #[arg(long, default_value = "24")]
    shots: u32,

    /// Milliseconds between simulated shots (overrides config)
    #[arg(long)]
    shot_interval_ms: Option<u64>,

    /// Script the detection step to fail once (object mode only)
    #[arg(long)]
    fail_detection: bool,

    /// Upload to the configured collection server instead of the scripted uploader
    #[arg(long)]
    live_upload: bool,

    /// Skip the upload step entirely
    #[arg(long)]
    skip_upload: bool,
}

/// Upper bound for any single wait on the state stream.
const STEP_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let pipeline_config = PipelineConfig::load();
    config::init(pipeline_config);
    let cfg = config::get();

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  scanforge - Capture-to-Model Pipeline");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(data_dir = %cfg.storage.data_dir.display(), "Storage root");

    let mode = if args.area {
        CaptureMode::Area
    } else {
        CaptureMode::Object
    };

    let store = Arc::new(DiskStore::new(
        cfg.storage.data_dir.clone(),
        cfg.storage.unique_model_names,
    ));
    let capture = Arc::new(ScriptedCaptureBackend::new(CaptureScript {
        detect_result: !args.fail_detection,
        shots: args.shots,
        max_shots: cfg.capture.max_shots,
        shot_interval_ms: args.shot_interval_ms.unwrap_or(cfg.capture.shot_interval_ms),
        jitter: true,
        scan_pass_after: Some(args.shots / 2),
        fail_after_shots: None,
    }));
    let reconstruction = Arc::new(ScriptedReconstruction::new(ReconstructionScript {
        progress_steps: vec![0.1, 0.25, 0.45, 0.65, 0.85],
        step_delay_ms: 150,
        write_output: true,
        ..ReconstructionScript::default()
    }));
    let uploader: Arc<dyn Uploader> = if args.live_upload {
        info!(endpoint = %cfg.upload.endpoint, "Using live HTTP uploader");
        Arc::new(HttpUploader::new(&cfg.upload.endpoint).context("building HTTP uploader")?)
    } else {
        Arc::new(ScriptedUploader::succeeding())
    };

    let shutdown = CancellationToken::new();
    let deps = PipelineDeps {
        capture,
        reconstruction,
        uploader,
        store,
    };
    let (handle, join) = PipelineOrchestrator::spawn(deps, mode, shutdown.clone());

    let outcome = drive_pipeline(&handle, &args).await;

    shutdown.cancel();
    let stats = join.await.context("orchestrator task failed")?;
    info!(stats = %stats, "Run finished");

    outcome
}

// ============================================================================
// Intent Sequence
// ============================================================================

/// Drive the full intent sequence, following the state stream.
async fn drive_pipeline(handle: &PipelineHandle, args: &CliArgs) -> Result<()> {
    let cfg = config::get();
    let mut state_rx = handle.watch();

    wait_for(&mut state_rx, "session ready", |s| {
        s.session_phase == SessionPhase::Ready
            || matches!(s.session_phase, SessionPhase::Failed(_))
    })
    .await?;
    if let SessionPhase::Failed(reason) = &handle.state().session_phase {
        bail!("capture session failed to start: {reason}");
    }

    if handle.state().capture_mode == CaptureMode::Object {
        send(handle, PipelineIntent::StartDetecting).await?;
        if args.fail_detection {
            let state = wait_for(&mut state_rx, "detection result", |s| {
                s.detection_failed || s.session_phase == SessionPhase::Detecting
            })
            .await?;
            if state.detection_failed {
                info!("Detection failed, falling back to direct capture");
            }
        }
    }

    send(handle, PipelineIntent::StartCapturing).await?;
    info!(shots = args.shots, "Capturing…");

    // Follow the capture: show the review overlay once a scan pass
    // completes, stop when the scripted shots are all in.
    loop {
        let state = wait_for(&mut state_rx, "capture progress", |s| {
            s.scan_pass_pending_review
                || s.shots_taken >= args.shots
                || matches!(s.session_phase, SessionPhase::Failed(_))
        })
        .await?;

        if let SessionPhase::Failed(reason) = &state.session_phase {
            bail!("capture session failed: {reason}");
        }
        if state.scan_pass_pending_review && !state.overlay_visible {
            info!(shots = state.shots_taken, "Scan pass complete, showing review overlay");
            send(handle, PipelineIntent::SetOverlayVisible(true)).await?;
            tokio::time::sleep(Duration::from_millis(400)).await;
            send(handle, PipelineIntent::SetOverlayVisible(false)).await?;
            wait_for(&mut state_rx, "overlay hidden", |s| {
                !s.overlay_visible && !s.scan_pass_pending_review
            })
            .await?;
            continue;
        }
        if state.shots_taken >= args.shots {
            if state.shots_taken < cfg.capture.min_shots {
                warn!(
                    shots = state.shots_taken,
                    min = cfg.capture.min_shots,
                    "Finishing below the recommended shot minimum"
                );
            }
            break;
        }
    }

    send(handle, PipelineIntent::FinishCapturing).await?;
    wait_for(&mut state_rx, "capture completed", |s| {
        s.session_phase == SessionPhase::Completed
    })
    .await?;
    info!("Capture complete, starting reconstruction");

    send(handle, PipelineIntent::StartReconstruction).await?;
    let state = wait_for(&mut state_rx, "reconstruction terminal", |s| {
        matches!(
            s.reconstruction,
            ReconstructionStatus::Complete(_) | ReconstructionStatus::Failed(_)
        )
    })
    .await?;

    let model_path = match &state.reconstruction {
        ReconstructionStatus::Complete(path) => path.clone(),
        ReconstructionStatus::Failed(reason) => bail!("reconstruction failed: {reason}"),
        _ => unreachable!("wait_for returned a non-terminal reconstruction state"),
    };
    info!(model = %model_path.display(), "Model ready");

    if args.skip_upload {
        info!("Upload skipped (--skip-upload)");
        return Ok(());
    }

    send(handle, PipelineIntent::UploadModel).await?;
    let state = wait_for(&mut state_rx, "upload settled", |s| {
        matches!(s.upload, UploadStatus::Succeeded(_) | UploadStatus::Failed(_))
    })
    .await?;
    match &state.upload {
        UploadStatus::Succeeded(message) => info!(message = %message, "Upload succeeded"),
        UploadStatus::Failed(reason) => bail!("upload failed: {reason}"),
        _ => unreachable!("wait_for returned a non-terminal upload state"),
    }

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

async fn send(handle: &PipelineHandle, intent: PipelineIntent) -> Result<()> {
    if !handle.send(intent).await {
        bail!("orchestrator stopped unexpectedly");
    }
    Ok(())
}

async fn wait_for(
    rx: &mut watch::Receiver<PipelineState>,
    what: &str,
    pred: impl FnMut(&PipelineState) -> bool,
) -> Result<PipelineState> {
    let state = tokio::time::timeout(STEP_TIMEOUT, rx.wait_for(pred))
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
        .with_context(|| format!("state stream closed waiting for {what}"))?;
    Ok(state.clone())
}
