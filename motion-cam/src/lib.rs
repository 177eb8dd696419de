//! Record clips from a live video stream when motion is detected, or on
//! command.
//!
//! Frames are read in a dedicated thread and handled one at a time by the
//! frame processing task, which keeps the pre-roll [ring_buffer::RingBuffer],
//! scores motion and drives the [controller::RecordingController]. Clips are
//! encoded in a second thread fed through [handoff]. Commands are polled from
//! a control file by a third task.
use std::{path::PathBuf, time::Duration};

use motion_cam_types::{RecordingKind, StatusReport};
use motion_detector::MotionDetector;
use tracing::{debug, info, warn};

pub mod cli_app;
pub mod command_channel;
pub mod config;
pub mod controller;
pub mod encoder_task;
mod errors;
pub mod frame_process_task;
pub mod handoff;
pub mod notifier;
pub mod ring_buffer;
pub mod source_task;
pub mod storage_gate;

pub use config::Config;
pub use errors::{Error, Result};

use crate::{
    command_channel::{CommandFile, command_poll_task},
    controller::{ControllerSettings, RecordingController},
    encoder_task::{ClipNaming, EncoderBackend, EncoderProcess, FfmpegBackend, spawn_encoder_thread},
    frame_process_task::{FrameProcessor, frame_process_task},
    notifier::{JsonLinesNotifier, Notifier, TracingNotifier},
    ring_buffer::RingBuffer,
    source_task::{ReconnectPolicy, StopReader, spawn_reader_thread},
    storage_gate::{DiskSpaceGate, StorageGate},
};

/// Queue sizes and timings of the pipeline which are not user settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Frames which may wait between the reader thread and processing.
    pub frame_queue: usize,
    /// Frames waiting beyond this many are not scored.
    pub score_backlog_limit: usize,
    /// How often the post-motion countdown is checked when no frame arrives.
    pub tick_interval: Duration,
}

impl PipelineOptions {
    pub fn for_config(config: &Config) -> Self {
        let frame_queue = ((config.source.fps * 2.0).ceil() as usize).max(8);
        Self {
            frame_queue,
            score_backlog_limit: frame_queue / 2,
            tick_interval: Duration::from_millis(200),
        }
    }
}

/// The parts of the pipeline which are swapped out in tests.
pub struct PipelineParts<B> {
    pub source: Box<dyn frame_source::FrameSource>,
    pub backend: B,
    pub gate: Box<dyn StorageGate>,
    pub notifier: Box<dyn Notifier>,
}

fn create_output_dirs(config: &Config) -> Result<()> {
    for kind in [RecordingKind::Motion, RecordingKind::Manual] {
        let dir = config.kind_dir(kind);
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Configuration(format!("cannot create \"{}\": {e}", dir.display()))
        })?;
    }
    Ok(())
}

/// Run until the valve closes, the source ends or a fatal error occurs.
/// Returns the final status.
pub async fn run_pipeline<B: EncoderBackend>(
    config: &Config,
    parts: PipelineParts<B>,
    options: PipelineOptions,
    valve: stream_cancel::Valve,
) -> Result<StatusReport> {
    config.validate()?;
    create_output_dirs(config)?;

    let geometry = config.output_geometry()?;
    let (out_w, out_h) = geometry.output_size();
    info!(
        "detecting motion in {} of {}x{} frames, recording {out_w}x{out_h} ({:?})",
        config.detection_region(),
        config.source.width,
        config.source.height,
        geometry.origin,
    );

    let detector = MotionDetector::new(
        config.detector_config(),
        config.source.width,
        config.source.height,
    )?;
    let ring = RingBuffer::new(config.ring_buffer_capacity());
    debug!("pre-roll buffer holds {} frames", ring.capacity());
    let controller = RecordingController::new(
        ControllerSettings {
            min_motion_frames: config.recording.min_motion_frames,
            post_motion: config.post_motion(),
            detection_enabled: config.recording.auto_start_motion,
        },
        parts.gate,
        parts.notifier,
    );
    if controller.detection_enabled() {
        info!("motion detection enabled at startup");
    }

    let naming = ClipNaming {
        output_dir: config.output_dir.clone(),
        timezone: config.timezone()?,
        frame_interval: config.frame_interval(),
    };
    let (encoder_tx, encoder_rx) = handoff::channel(config.encoder.queue_frames);
    let (encoder_events_tx, encoder_events_rx) = tokio::sync::mpsc::unbounded_channel();
    let encoder_thread = spawn_encoder_thread(
        EncoderProcess::new(parts.backend, naming),
        encoder_rx,
        encoder_events_tx,
    )?;

    let command_file = CommandFile::new(&config.control_file);
    command_file.ensure_dir()?;
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel(8);
    let command_task = tokio::spawn(command_poll_task(
        command_file,
        config.command_poll_interval,
        valve.clone(),
        cmd_tx,
        config.status_file.clone(),
    ));

    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(options.frame_queue);
    let policy = ReconnectPolicy {
        max_read_retries: config.source.max_read_retries,
        max_reconnect_attempts: config.source.max_reconnect_attempts,
        delay: config.source.reconnect_delay,
    };
    let stop_reader = StopReader::new();
    let reader_thread = spawn_reader_thread(parts.source, policy, frame_tx, stop_reader.clone())?;

    let processor = FrameProcessor::new(
        detector,
        ring,
        controller,
        encoder_tx,
        options.score_backlog_limit,
    );
    let result = frame_process_task(
        processor,
        frame_rx,
        cmd_rx,
        encoder_events_rx,
        valve,
        options.tick_interval,
    )
    .await;

    // The reader closes the source on its way out.
    stop_reader.stop();
    let joined = tokio::task::spawn_blocking(move || reader_thread.join()).await;
    if !matches!(joined, Ok(Ok(()))) {
        warn!("frame reader thread panicked");
    }

    // Polling may be mid-sleep if processing ended on its own.
    command_task.abort();
    if let Err(e) = command_task.await {
        if !e.is_cancelled() {
            warn!("command task failed: {e}");
        }
    }
    let joined = tokio::task::spawn_blocking(move || encoder_thread.join()).await;
    if !matches!(joined, Ok(Ok(()))) {
        warn!("encoder thread panicked");
    }
    result
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {e}");
        futures::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}

/// Run with the real source, encoder, storage gate and notifiers until a
/// shutdown signal or fatal error.
pub async fn run(config: Config) -> Result<StatusReport> {
    config.validate()?;
    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(TracingNotifier)];
    if let Some(path) = &config.session_log {
        notifiers.push(Box::new(JsonLinesNotifier::new(path)));
    }
    let parts = PipelineParts {
        source: frame_source::open_source(&config.source_settings())?,
        backend: FfmpegBackend::new(config.writer_options()?),
        gate: Box::new(DiskSpaceGate::new(
            &config.output_dir,
            config.storage.min_free_gb,
            config.storage.max_used_percent,
        )),
        notifier: Box::new(notifiers),
    };
    let options = PipelineOptions::for_config(&config);

    let (quit_trigger, valve) = stream_cancel::Valve::new();
    let pipeline = run_pipeline(&config, parts, options, valve);
    tokio::pin!(pipeline);
    let finished = tokio::select! {
        result = &mut pipeline => Some(result),
        _ = shutdown_signal() => {
            info!("shutdown requested");
            None
        }
    };
    quit_trigger.cancel();
    match finished {
        Some(result) => result,
        None => pipeline.await,
    }
}

/// Build a runtime and [run] on it.
pub fn run_app(config: Config) -> Result<StatusReport> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

/// Expand `~` and environment variables in a path.
pub(crate) fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw)
        .map_err(|e| Error::Configuration(format!("cannot expand \"{raw}\": {e}")))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
