use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Local;
use frame_source::{MotionPattern, Pacing, TestPatternSource};
use machine_vision_formats::owned::OImage;
use motion_cam::{
    Config, Error, PipelineOptions, PipelineParts, Result,
    encoder_task::{ClipWriter, EncoderBackend},
    notifier::Notifier,
    run_pipeline,
    storage_gate::{StorageGate, Unlimited},
};
use motion_cam_types::{RecordingKind, RecordingSession, SessionStatus};
use parking_lot::Mutex;

/// Writes the frame number of each frame as a line of text.
struct LineWriter {
    fd: std::fs::File,
    fail_at: Option<u64>,
    n: u64,
}

impl ClipWriter for LineWriter {
    fn write(&mut self, frame: &frame_source::Frame) -> Result<()> {
        if Some(self.n) == self.fail_at {
            return Err(Error::Encoder("encoder exited".into()));
        }
        self.n += 1;
        writeln!(self.fd, "{}", frame.fno)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct LineBackend {
    fail_at: Option<u64>,
}

impl EncoderBackend for LineBackend {
    fn open(&mut self, path: &Path) -> Result<Box<dyn ClipWriter>> {
        Ok(Box::new(LineWriter {
            fd: std::fs::File::create(path)?,
            fail_at: self.fail_at,
            n: 0,
        }))
    }
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<RecordingSession>>>);

impl Notifier for Collect {
    fn notify(&mut self, session: &RecordingSession) -> Result<()> {
        self.0.lock().push(session.clone());
        Ok(())
    }
}

/// Refuses every start, counting the requests.
struct Full(Arc<AtomicUsize>);

impl StorageGate for Full {
    fn has_capacity(&self) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        false
    }
}

fn config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.source.url = frame_source::TEST_PATTERN_URL.into();
    cfg.source.width = 320;
    cfg.source.height = 240;
    cfg.source.fps = 10.0;
    cfg.output_dir = dir.join("recordings");
    cfg.control_file = dir.join("control").join("command");
    cfg.command_poll_interval = Duration::from_millis(10);
    cfg.recording.buffer_seconds = 1.0;
    cfg.recording.post_motion_seconds = 2.0;
    cfg.recording.min_motion_frames = 3;
    cfg.recording.auto_start_motion = true;
    cfg.detection.start_percent = 3.0;
    cfg.detection.extend_percent = 0.2;
    cfg.detection.background_alpha = 1.0;
    cfg
}

/// Frames as fast as they can be processed, stamped 0.1 s apart, with the
/// square moving during frames 30..40.
fn synthetic_source() -> Box<dyn frame_source::FrameSource> {
    Box::new(
        TestPatternSource::new(320, 240, 10.0, Pacing::Synthetic(Local::now()))
            .with_motion(MotionPattern::Frames(vec![30..40])),
    )
}

fn unhurried(cfg: &Config) -> PipelineOptions {
    PipelineOptions {
        score_backlog_limit: usize::MAX,
        ..PipelineOptions::for_config(cfg)
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out");
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn motion_burst_records_one_clip_with_preroll_and_tail() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path());
    let sessions = Collect::default();
    let parts = PipelineParts {
        source: synthetic_source(),
        backend: LineBackend { fail_at: None },
        gate: Box::new(Unlimited),
        notifier: Box::new(sessions.clone()),
    };
    let (trigger, valve) = stream_cancel::Valve::new();
    let pipeline = run_pipeline(&cfg, parts, unhurried(&cfg), valve);
    let stop = async {
        wait_for(|| !sessions.0.lock().is_empty()).await;
        trigger.cancel();
    };
    let (report, ()) = tokio::join!(pipeline, stop);
    let report = report.unwrap();

    let sessions = sessions.0.lock();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.kind, RecordingKind::Motion);
    assert_eq!(session.status, SessionStatus::Closed);
    // 10 frames of pre-roll (23..=32), live frames until the tail ends at 59
    assert_eq!(session.frames_written, 36);
    let path = session.output_path.as_ref().unwrap();
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("motion_"), "{name}");
    assert!(name.ends_with("_00m03s.mp4"), "{name}");
    let lines: Vec<u64> = std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| l.parse().unwrap())
        .collect();
    assert_eq!(lines, (23..59).collect::<Vec<_>>());
    assert_eq!(files_in(&cfg.output_dir.join("motion")), vec![path.clone()]);

    assert_eq!(report.stats.motion_events, 1);
    assert_eq!(report.stats.motion_sessions_saved, 1);
    assert_eq!(report.stats.sessions_failed, 0);
    assert!(report.active_session.is_none());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn encoder_failure_fails_session_without_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path());
    let sessions = Collect::default();
    let parts = PipelineParts {
        source: synthetic_source(),
        backend: LineBackend { fail_at: Some(15) },
        gate: Box::new(Unlimited),
        notifier: Box::new(sessions.clone()),
    };
    let (trigger, valve) = stream_cancel::Valve::new();
    let pipeline = run_pipeline(&cfg, parts, unhurried(&cfg), valve);
    let stop = async {
        wait_for(|| !sessions.0.lock().is_empty()).await;
        // give a retry the chance to show up
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    };
    let (report, ()) = tokio::join!(pipeline, stop);
    let report = report.unwrap();

    let sessions = sessions.0.lock();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert_eq!(sessions[0].frames_written, 15);
    assert!(
        sessions[0]
            .failure
            .as_deref()
            .unwrap()
            .contains("encoder exited")
    );
    assert_eq!(report.stats.sessions_failed, 1);
    assert_eq!(report.stats.motion_sessions_saved, 0);
    assert!(files_in(&cfg.output_dir.join("motion")).is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn full_disk_suppresses_recording() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path());
    let sessions = Collect::default();
    let asked = Arc::new(AtomicUsize::new(0));
    let parts = PipelineParts {
        source: synthetic_source(),
        backend: LineBackend { fail_at: None },
        gate: Box::new(Full(asked.clone())),
        notifier: Box::new(sessions.clone()),
    };
    let (trigger, valve) = stream_cancel::Valve::new();
    let pipeline = run_pipeline(&cfg, parts, unhurried(&cfg), valve);
    let stop = async {
        wait_for(|| asked.load(Ordering::SeqCst) > 0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    };
    let (report, ()) = tokio::join!(pipeline, stop);
    let report = report.unwrap();

    assert!(sessions.0.lock().is_empty());
    assert_eq!(report.stats.starts_suppressed, 1);
    assert_eq!(asked.load(Ordering::SeqCst), 1);
    assert!(files_in(&cfg.output_dir.join("motion")).is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn manual_recording_and_status_via_control_file() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.recording.auto_start_motion = false;
    cfg.source.fps = 100.0;
    cfg.status_file = Some(tmp.path().join("status.json"));
    let sessions = Collect::default();
    let parts = PipelineParts {
        source: Box::new(
            TestPatternSource::new(320, 240, 100.0, Pacing::Realtime)
                .with_motion(MotionPattern::Frames(vec![])),
        ),
        backend: LineBackend { fail_at: None },
        gate: Box::new(Unlimited),
        notifier: Box::new(sessions.clone()),
    };
    let (trigger, valve) = stream_cancel::Valve::new();
    let control = cfg.control_file.clone();
    let status_file = tmp.path().join("status.json");
    let pipeline = run_pipeline(&cfg, parts, PipelineOptions::for_config(&cfg), valve);
    let drive = async {
        wait_for(|| control.parent().unwrap().is_dir()).await;
        std::fs::write(&control, "RECORD_START\n").unwrap();
        wait_for(|| !control.exists()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&control, "STATUS").unwrap();
        wait_for(|| status_file.exists()).await;
        let status: motion_cam_types::StatusReport =
            serde_json::from_slice(&std::fs::read(&status_file).unwrap()).unwrap();
        assert_eq!(
            status.active_session.map(|s| s.kind),
            Some(RecordingKind::Manual)
        );
        assert!(!status.detection_enabled);

        std::fs::write(&control, "record_stop").unwrap();
        wait_for(|| !sessions.0.lock().is_empty()).await;
        trigger.cancel();
    };
    let (report, ()) = tokio::join!(pipeline, drive);
    let report = report.unwrap();

    let sessions = sessions.0.lock();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].kind, RecordingKind::Manual);
    assert_eq!(sessions[0].status, SessionStatus::Closed);
    assert!(sessions[0].frames_written > 0);
    let path = sessions[0].output_path.as_ref().unwrap();
    assert!(path.starts_with(cfg.output_dir.join("manual")));
    assert_eq!(report.stats.manual_sessions_saved, 1);
}

/// Takes 150 ms per frame and records whether it is open.
struct SlowSource {
    fno: u64,
    open: Arc<AtomicBool>,
}

impl frame_source::FrameSource for SlowSource {
    fn width(&self) -> u32 {
        320
    }
    fn height(&self) -> u32 {
        240
    }
    fn nominal_fps(&self) -> f64 {
        10.0
    }
    fn description(&self) -> String {
        "slow source".into()
    }
    fn open(&mut self) -> frame_source::Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn read_frame(&mut self) -> frame_source::Result<frame_source::Frame> {
        std::thread::sleep(Duration::from_millis(150));
        self.fno += 1;
        let image = OImage::new(320, 240, 320 * 3, vec![0; 320 * 240 * 3]).unwrap();
        Ok(frame_source::Frame::new(self.fno - 1, Local::now(), image))
    }
    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn shutdown_closes_the_source_before_returning() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path());
    let open = Arc::new(AtomicBool::new(false));
    let parts = PipelineParts {
        source: Box::new(SlowSource {
            fno: 0,
            open: open.clone(),
        }),
        backend: LineBackend { fail_at: None },
        gate: Box::new(Unlimited),
        notifier: Box::new(Collect::default()),
    };
    let (trigger, valve) = stream_cancel::Valve::new();
    let pipeline = run_pipeline(&cfg, parts, PipelineOptions::for_config(&cfg), valve);
    let stop = async {
        wait_for(|| open.load(Ordering::SeqCst)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    };
    let (report, ()) = tokio::join!(pipeline, stop);
    report.unwrap();
    assert!(!open.load(Ordering::SeqCst));
}

#[test_log::test(tokio::test)]
async fn invalid_configuration_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.detection.extend_percent = 10.0;
    let parts = PipelineParts {
        source: synthetic_source(),
        backend: LineBackend { fail_at: None },
        gate: Box::new(Unlimited),
        notifier: Box::new(Collect::default()),
    };
    let (_trigger, valve) = stream_cancel::Valve::new();
    let err = run_pipeline(&cfg, parts, unhurried(&cfg), valve)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.is_fatal());
}
