//! This module contains [spawn_encoder_thread], which writes sessions to
//! video files in a background thread. Everything here except the spawn runs
//! in that one thread.
//!
//! A clip is written to a hidden `.partial.mp4` file and renamed once the
//! encoder has finished, so a complete file under its final name is never
//! half written.
use std::{
    path::{Path, PathBuf},
    thread::JoinHandle,
};

use chrono::{DateTime, Local};
use ffmpeg_writer::{FfmpegWriter, WriterOptions};
use frame_source::Frame;
use motion_cam_types::{RecordingKind, RecordingSession};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::{
    Error, Result,
    config::OperatingTimezone,
    handoff::{EncoderMsg, HandoffReceiver},
};

/// The outcome of a session, reported by the encoder thread.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Finalized {
        session_id: u64,
        path: PathBuf,
        /// Timestamp of the first written frame.
        start: DateTime<Local>,
        /// Timestamp of the last written frame plus one frame interval.
        end: DateTime<Local>,
        frames: u64,
    },
    Failed {
        session_id: u64,
        reason: String,
        frames: u64,
    },
}

/// One output file being written.
pub trait ClipWriter: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;
    /// Finish the file. Dropping without finishing abandons it.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Creates a [ClipWriter] per session.
pub trait EncoderBackend: Send + 'static {
    fn open(&mut self, path: &Path) -> Result<Box<dyn ClipWriter>>;
}

impl ClipWriter for FfmpegWriter {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        Ok(self.write_frame(&*frame.image)?)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(self.close()?)
    }
}

/// Encodes with an ffmpeg child process per session.
pub struct FfmpegBackend {
    opts: WriterOptions,
}

impl FfmpegBackend {
    pub fn new(opts: WriterOptions) -> Self {
        Self { opts }
    }
}

impl EncoderBackend for FfmpegBackend {
    fn open(&mut self, path: &Path) -> Result<Box<dyn ClipWriter>> {
        Ok(Box::new(FfmpegWriter::new(path, &self.opts)?))
    }
}

/// Where clips are written and what they are called.
#[derive(Debug, Clone)]
pub struct ClipNaming {
    pub output_dir: PathBuf,
    pub timezone: OperatingTimezone,
    pub frame_interval: chrono::Duration,
}

impl ClipNaming {
    fn kind_dir(&self, kind: RecordingKind) -> PathBuf {
        self.output_dir.join(kind.as_str())
    }

    fn partial_path(&self, session: &RecordingSession) -> PathBuf {
        self.kind_dir(session.kind)
            .join(format!(".{}_{}.partial.mp4", session.kind, session.id))
    }

    /// `<kind>_<YYYY-MM-DD>_<HH-MM-SS>_<MMmSSs>.mp4` in the kind directory.
    /// If that name is taken, the session id is appended.
    pub fn final_path(
        &self,
        kind: RecordingKind,
        session_id: u64,
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> PathBuf {
        let stem = format!(
            "{kind}_{}_{}",
            self.timezone.format(&start, "%Y-%m-%d_%H-%M-%S"),
            format_duration(end - start)
        );
        let dir = self.kind_dir(kind);
        let path = dir.join(format!("{stem}.mp4"));
        if path.exists() {
            dir.join(format!("{stem}-{session_id}.mp4"))
        } else {
            path
        }
    }
}

/// Format as `MMmSSs`. Minutes are not wrapped into hours.
pub fn format_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    format!("{:02}m{:02}s", secs / 60, secs % 60)
}

struct OpenClip {
    session: RecordingSession,
    partial: PathBuf,
    writer: Box<dyn ClipWriter>,
    first_ts: Option<DateTime<Local>>,
    last_ts: Option<DateTime<Local>>,
    frames: u64,
}

/// Writes at most one session at a time.
pub struct EncoderProcess<B> {
    backend: B,
    naming: ClipNaming,
    current: Option<OpenClip>,
}

impl<B: EncoderBackend> EncoderProcess<B> {
    pub fn new(backend: B, naming: ClipNaming) -> Self {
        Self {
            backend,
            naming,
            current: None,
        }
    }

    pub fn current_session(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.session.id)
    }

    pub fn open(&mut self, session: RecordingSession) -> Result<()> {
        let dir = self.naming.kind_dir(session.kind);
        std::fs::create_dir_all(&dir)?;
        let partial = self.naming.partial_path(&session);
        let writer = self.backend.open(&partial)?;
        debug!(
            "session {} writing to \"{}\"",
            session.id,
            partial.display()
        );
        self.current = Some(OpenClip {
            session,
            partial,
            writer,
            first_ts: None,
            last_ts: None,
            frames: 0,
        });
        Ok(())
    }

    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        let Some(clip) = self.current.as_mut() else {
            return Err(Error::Encoder("no open session".into()));
        };
        if let Some(last) = clip.last_ts {
            if frame.timestamp < last {
                debug!("skipping out of order frame {}", frame.fno);
                return Ok(());
            }
        }
        clip.writer.write(frame)?;
        clip.first_ts.get_or_insert(frame.timestamp);
        clip.last_ts = Some(frame.timestamp);
        clip.frames += 1;
        Ok(())
    }

    /// Finish the current clip and move it to its final name.
    pub fn close(&mut self) -> Option<EncoderEvent> {
        let OpenClip {
            session,
            partial,
            writer,
            first_ts,
            last_ts,
            frames,
        } = self.current.take()?;
        let session_id = session.id;
        let (Some(first_ts), Some(last_ts)) = (first_ts, last_ts) else {
            drop(writer);
            remove_partial(&partial);
            return Some(EncoderEvent::Failed {
                session_id,
                reason: "no frames were written".into(),
                frames: 0,
            });
        };
        if let Err(e) = writer.finish() {
            remove_partial(&partial);
            return Some(EncoderEvent::Failed {
                session_id,
                reason: failure_reason(&e),
                frames,
            });
        }
        let end = last_ts + self.naming.frame_interval;
        let path = self
            .naming
            .final_path(session.kind, session_id, first_ts, end);
        if let Err(e) = std::fs::rename(&partial, &path) {
            error!(
                "cannot rename \"{}\" to \"{}\": {e}",
                partial.display(),
                path.display()
            );
            return Some(EncoderEvent::Failed {
                session_id,
                reason: e.to_string(),
                frames,
            });
        }
        info!("saved \"{}\"", path.display());
        Some(EncoderEvent::Finalized {
            session_id,
            path,
            start: first_ts,
            end,
            frames,
        })
    }

    /// Abandon the current clip and delete its partial file.
    pub fn discard(&mut self, reason: String) -> Option<EncoderEvent> {
        let OpenClip {
            session,
            partial,
            writer,
            frames,
            ..
        } = self.current.take()?;
        drop(writer);
        remove_partial(&partial);
        Some(EncoderEvent::Failed {
            session_id: session.id,
            reason,
            frames,
        })
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("cannot remove \"{}\": {e}", path.display());
        }
    }
}

fn failure_reason(e: &Error) -> String {
    match e {
        Error::Writer(w) => match w.ffmpeg_message() {
            Some(msg) => format!("{w}: {msg}"),
            None => w.to_string(),
        },
        e => e.to_string(),
    }
}

/// Handle one message. Runs inside the encoder thread loop.
fn handle_msg<B: EncoderBackend>(
    process: &mut EncoderProcess<B>,
    msg: EncoderMsg,
) -> Vec<EncoderEvent> {
    let mut events = Vec::new();
    match msg {
        EncoderMsg::Open { session, preroll } => {
            if let Some(old) = process.current_session() {
                warn!("session {old} still open when session {} starts", session.id);
                events.extend(process.close());
            }
            let session_id = session.id;
            if let Err(e) = process.open(session) {
                events.push(EncoderEvent::Failed {
                    session_id,
                    reason: failure_reason(&e),
                    frames: 0,
                });
                return events;
            }
            debug!("session {session_id} starts with {} pre-roll frames", preroll.len());
            for frame in preroll.iter() {
                if let Err(e) = process.write(frame) {
                    events.extend(process.discard(failure_reason(&e)));
                    break;
                }
            }
        }
        EncoderMsg::Frame { session_id, frame } => {
            if process.current_session() == Some(session_id) {
                if let Err(e) = process.write(&frame) {
                    events.extend(process.discard(failure_reason(&e)));
                }
            }
        }
        EncoderMsg::Close { session_id } => {
            if process.current_session() == Some(session_id) {
                events.extend(process.close());
            }
        }
    }
    events
}

fn encoder_thread_loop<B: EncoderBackend>(
    mut process: EncoderProcess<B>,
    rx: HandoffReceiver,
    events_tx: UnboundedSender<EncoderEvent>,
) {
    let send = |event: EncoderEvent| {
        if events_tx.send(event).is_err() {
            debug!("encoder event receiver gone");
        }
    };
    while let Some(msg) = rx.recv() {
        handle_msg(&mut process, msg).into_iter().for_each(&send);
    }
    // The sender is gone. Finish anything still open.
    if let Some(event) = process.close() {
        send(event);
    }
    debug!("encoder thread done");
}

/// Spawn the encoder thread. It runs until the handoff sender is dropped.
pub fn spawn_encoder_thread<B: EncoderBackend>(
    process: EncoderProcess<B>,
    rx: HandoffReceiver,
    events_tx: UnboundedSender<EncoderEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("encoder".into())
        .spawn(move || encoder_thread_loop(process, rx, events_tx))
}

#[cfg(test)]
mod test {
    use std::{io::Write, sync::Arc};

    use machine_vision_formats::owned::OImage;
    use parking_lot::Mutex;

    use super::*;

    /// Writes one line per frame number.
    struct LineWriter {
        fd: std::fs::File,
        fail_at: Option<u64>,
        n: u64,
    }

    impl ClipWriter for LineWriter {
        fn write(&mut self, frame: &Frame) -> Result<()> {
            if Some(self.n) == self.fail_at {
                return Err(Error::Encoder("pipe closed".into()));
            }
            self.n += 1;
            writeln!(self.fd, "{}", frame.fno)?;
            Ok(())
        }
        fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct LineBackend {
        fail_at: Option<u64>,
        opened: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl EncoderBackend for LineBackend {
        fn open(&mut self, path: &Path) -> Result<Box<dyn ClipWriter>> {
            self.opened.lock().push(path.to_path_buf());
            Ok(Box::new(LineWriter {
                fd: std::fs::File::create(path)?,
                fail_at: self.fail_at,
                n: 0,
            }))
        }
    }

    fn frame(fno: u64, t0: DateTime<Local>) -> Frame {
        let image = OImage::new(2, 2, 6, vec![0; 12]).unwrap();
        Frame::new(fno, t0 + chrono::Duration::seconds(fno as i64), image)
    }

    fn naming(dir: &Path) -> ClipNaming {
        ClipNaming {
            output_dir: dir.to_path_buf(),
            timezone: OperatingTimezone::Local,
            frame_interval: chrono::Duration::seconds(1),
        }
    }

    #[test]
    fn duration_format() {
        assert_eq!(format_duration(chrono::Duration::seconds(9)), "00m09s");
        assert_eq!(format_duration(chrono::Duration::seconds(125)), "02m05s");
        assert_eq!(format_duration(chrono::Duration::seconds(6000)), "100m00s");
        assert_eq!(format_duration(chrono::Duration::seconds(-3)), "00m00s");
    }

    #[test_log::test]
    fn clip_is_renamed_on_close() {
        let tmp = tempfile::tempdir().unwrap();
        let t0 = Local::now();
        let mut process = EncoderProcess::new(LineBackend::default(), naming(tmp.path()));
        let session = RecordingSession::new(1, RecordingKind::Motion, t0);
        let events = handle_msg(
            &mut process,
            EncoderMsg::Open {
                session,
                preroll: vec![frame(0, t0), frame(1, t0)],
            },
        );
        assert!(events.is_empty());
        handle_msg(
            &mut process,
            EncoderMsg::Frame {
                session_id: 1,
                frame: frame(2, t0),
            },
        );
        // frames of other sessions are ignored
        handle_msg(
            &mut process,
            EncoderMsg::Frame {
                session_id: 9,
                frame: frame(3, t0),
            },
        );
        let events = handle_msg(&mut process, EncoderMsg::Close { session_id: 1 });
        let [EncoderEvent::Finalized {
            path,
            start,
            end,
            frames,
            ..
        }] = &events[..]
        else {
            panic!("expected finalized, got {events:?}");
        };
        assert_eq!(*frames, 3);
        assert_eq!(*start, frame(0, t0).timestamp);
        assert_eq!(*end - *start, chrono::Duration::seconds(3));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("motion_"), "{name}");
        assert!(name.ends_with("_00m03s.mp4"), "{name}");
        assert_eq!(path.parent().unwrap(), tmp.path().join("motion"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "0\n1\n2\n");
        // no partial left behind
        let entries: Vec<_> = std::fs::read_dir(tmp.path().join("motion")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test_log::test]
    fn name_collision_appends_session_id() {
        let tmp = tempfile::tempdir().unwrap();
        let n = naming(tmp.path());
        let t0 = Local::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        let first = n.final_path(RecordingKind::Manual, 1, t0, t1);
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"").unwrap();
        let second = n.final_path(RecordingKind::Manual, 2, t0, t1);
        assert_ne!(first, second);
        assert!(second.to_str().unwrap().ends_with("_00m05s-2.mp4"));
    }

    #[test_log::test]
    fn empty_session_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut process = EncoderProcess::new(LineBackend::default(), naming(tmp.path()));
        let session = RecordingSession::new(4, RecordingKind::Manual, Local::now());
        handle_msg(
            &mut process,
            EncoderMsg::Open {
                session,
                preroll: vec![],
            },
        );
        let events = handle_msg(&mut process, EncoderMsg::Close { session_id: 4 });
        assert!(matches!(
            events[..],
            [EncoderEvent::Failed {
                session_id: 4,
                frames: 0,
                ..
            }]
        ));
        assert_eq!(std::fs::read_dir(tmp.path().join("manual")).unwrap().count(), 0);
    }

    #[test_log::test]
    fn write_failure_discards_session() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LineBackend {
            fail_at: Some(2),
            ..Default::default()
        };
        let t0 = Local::now();
        let mut process = EncoderProcess::new(backend, naming(tmp.path()));
        let session = RecordingSession::new(1, RecordingKind::Motion, t0);
        handle_msg(
            &mut process,
            EncoderMsg::Open {
                session,
                preroll: vec![frame(0, t0), frame(1, t0)],
            },
        );
        let events = handle_msg(
            &mut process,
            EncoderMsg::Frame {
                session_id: 1,
                frame: frame(2, t0),
            },
        );
        let [EncoderEvent::Failed { reason, frames, .. }] = &events[..] else {
            panic!("expected failure, got {events:?}");
        };
        assert_eq!(*frames, 2);
        assert!(reason.contains("pipe closed"));
        assert_eq!(process.current_session(), None);
        assert_eq!(std::fs::read_dir(tmp.path().join("motion")).unwrap().count(), 0);

        // late messages for the failed session do nothing
        assert!(
            handle_msg(&mut process, EncoderMsg::Close { session_id: 1 }).is_empty()
        );
    }

    #[test_log::test]
    fn thread_finishes_open_clip_when_sender_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let t0 = Local::now();
        let process = EncoderProcess::new(LineBackend::default(), naming(tmp.path()));
        let (tx, rx) = crate::handoff::channel(10);
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_encoder_thread(process, rx, events_tx).unwrap();
        tx.send_control(EncoderMsg::Open {
            session: RecordingSession::new(1, RecordingKind::Manual, t0),
            preroll: vec![],
        });
        tx.send_frame(1, frame(0, t0));
        tx.send_frame(1, frame(1, t0));
        drop(tx);
        handle.join().unwrap();
        let event = events_rx.try_recv().unwrap();
        assert!(matches!(
            event,
            EncoderEvent::Finalized {
                session_id: 1,
                frames: 2,
                ..
            }
        ));
        assert!(events_rx.try_recv().is_err());
    }
}
