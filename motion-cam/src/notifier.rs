use std::{io::Write, path::PathBuf};

use motion_cam_types::{RecordingSession, SessionStatus};
use tracing::{info, warn};

use crate::Result;

/// Told about every session which has ended, whether closed or failed.
///
/// Errors are logged by the caller and otherwise ignored.
pub trait Notifier: Send {
    fn notify(&mut self, session: &RecordingSession) -> Result<()>;
}

/// Logs each finished session.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&mut self, session: &RecordingSession) -> Result<()> {
        match session.status {
            SessionStatus::Failed => warn!(
                "{} session {} failed after {} frames: {}",
                session.kind,
                session.id,
                session.frames_written,
                session.failure.as_deref().unwrap_or("unknown error"),
            ),
            _ => {
                let path = session
                    .output_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                info!(
                    "{} session {} saved {} frames to \"{path}\"",
                    session.kind, session.id, session.frames_written,
                );
            }
        }
        Ok(())
    }
}

/// Appends each finished session as one line of JSON.
pub struct JsonLinesNotifier {
    path: PathBuf,
}

impl JsonLinesNotifier {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl Notifier for JsonLinesNotifier {
    fn notify(&mut self, session: &RecordingSession) -> Result<()> {
        let mut line = serde_json::to_vec(session)?;
        line.push(b'\n');
        let mut fd = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        fd.write_all(&line)?;
        Ok(())
    }
}

impl Notifier for Vec<Box<dyn Notifier>> {
    fn notify(&mut self, session: &RecordingSession) -> Result<()> {
        for notifier in self.iter_mut() {
            if let Err(e) = notifier.notify(session) {
                warn!("notifier failed for session {}: {e}", session.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Local;
    use motion_cam_types::RecordingKind;

    struct Failing;

    impl Notifier for Failing {
        fn notify(&mut self, _session: &RecordingSession) -> Result<()> {
            Err(crate::Error::Encoder("boom".into()))
        }
    }

    fn session(id: u64) -> RecordingSession {
        let mut s = RecordingSession::new(id, RecordingKind::Motion, Local::now());
        s.status = SessionStatus::Closed;
        s.output_path = Some(PathBuf::from("/recordings/motion/x.mp4"));
        s
    }

    #[test_log::test]
    fn json_lines_are_appended() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.jsonl");
        let mut n = JsonLinesNotifier::new(&path);
        n.notify(&session(1)).unwrap();
        n.notify(&session(2)).unwrap();
        let buf = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<RecordingSession> = buf
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].id, 2);
        assert_eq!(parsed[0].status, SessionStatus::Closed);
    }

    #[test_log::test]
    fn one_failing_notifier_does_not_stop_others() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sessions.jsonl");
        let mut all: Vec<Box<dyn Notifier>> = vec![
            Box::new(Failing),
            Box::new(TracingNotifier),
            Box::new(JsonLinesNotifier::new(&path)),
        ];
        all.notify(&session(7)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
