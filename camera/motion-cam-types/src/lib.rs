use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// A directive read from the command channel.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Command {
    /// Open a manual recording session.
    RecordStart,
    /// Close the active session, whatever opened it.
    RecordStop,
    /// Enable motion-triggered recording.
    EnableDetection,
    /// Disable motion-triggered recording.
    DisableDetection,
    /// Report the controller state.
    Status,
}

/// A token on the command channel which is not a known command.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized command token \"{0}\"")]
pub struct UnknownCommand(pub String);

impl Command {
    /// The canonical token for this command.
    pub fn as_token(&self) -> &'static str {
        use Command::*;
        match self {
            RecordStart => "RECORD_START",
            RecordStop => "RECORD_STOP",
            EnableDetection => "START",
            DisableDetection => "STOP",
            Status => "STATUS",
        }
    }
}

impl std::str::FromStr for Command {
    type Err = UnknownCommand;

    /// Parse a token. Surrounding whitespace and case are ignored.
    ///
    /// `MOTION_ON` and `MOTION_OFF` are accepted as aliases of `START` and
    /// `STOP`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Command::*;
        let token = s.trim().to_ascii_uppercase();
        match token.as_str() {
            "RECORD_START" => Ok(RecordStart),
            "RECORD_STOP" => Ok(RecordStop),
            "START" | "MOTION_ON" => Ok(EnableDetection),
            "STOP" | "MOTION_OFF" => Ok(DisableDetection),
            "STATUS" => Ok(Status),
            _ => Err(UnknownCommand(token)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_token())
    }
}

/// What opened a recording session.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingKind {
    Motion,
    Manual,
}

impl RecordingKind {
    /// Name used for the output subdirectory and the filename prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingKind::Motion => "motion",
            RecordingKind::Manual => "manual",
        }
    }
}

impl std::fmt::Display for RecordingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    /// Close requested, waiting for the encoder to finalize the file.
    Closing,
    Closed,
    Failed,
}

/// One contiguous recording.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: u64,
    pub kind: RecordingKind,
    pub start: DateTime<Local>,
    pub end: Option<DateTime<Local>>,
    /// Known once the encoder has finalized the file.
    pub output_path: Option<PathBuf>,
    pub frames_written: u64,
    pub status: SessionStatus,
    pub failure: Option<String>,
}

impl RecordingSession {
    pub fn new(id: u64, kind: RecordingKind, start: DateTime<Local>) -> Self {
        Self {
            id,
            kind,
            start,
            end: None,
            output_path: None,
            frames_written: 0,
            status: SessionStatus::Open,
            failure: None,
        }
    }

    /// Time covered so far, or in total once the session has ended.
    pub fn elapsed(&self, now: DateTime<Local>) -> chrono::Duration {
        let end = self.end.unwrap_or(now);
        (end - self.start).max(chrono::Duration::zero())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, SessionStatus::Closed | SessionStatus::Failed)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    #[default]
    Idle,
    Recording,
    /// Motion has ceased and the post-motion countdown is running.
    PostRoll,
}

impl std::fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControllerPhase::Idle => "idle",
            ControllerPhase::Recording => "recording",
            ControllerPhase::PostRoll => "post-roll",
        };
        write!(f, "{s}")
    }
}

/// Running counters kept by the recording controller.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct RecordingStats {
    pub frames_processed: u64,
    pub frames_scored: u64,
    /// Frames which were buffered and recorded but skipped by the motion
    /// detector to keep up with the source.
    pub frames_not_scored: u64,
    pub motion_frames: u64,
    pub motion_events: u64,
    pub motion_sessions_saved: u64,
    pub manual_sessions_saved: u64,
    pub sessions_failed: u64,
    /// Session starts refused by the storage gate.
    pub starts_suppressed: u64,
    pub last_motion: Option<DateTime<Local>>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ActiveSessionStatus {
    pub id: u64,
    pub kind: RecordingKind,
    pub start: DateTime<Local>,
    pub elapsed_secs: f64,
}

/// Answer to the `STATUS` command.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Local>,
    pub phase: ControllerPhase,
    pub detection_enabled: bool,
    pub active_session: Option<ActiveSessionStatus>,
    pub stats: RecordingStats,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let detection = if self.detection_enabled { "on" } else { "off" };
        write!(f, "phase: {}, detection: {detection}", self.phase)?;
        if let Some(active) = &self.active_session {
            write!(
                f,
                ", session {} ({}) for {:.1}s",
                active.id, active.kind, active.elapsed_secs
            )?;
        }
        write!(
            f,
            ", frames: {}, motion events: {}, saved: {} motion / {} manual, failed: {}",
            self.stats.frames_processed,
            self.stats.motion_events,
            self.stats.motion_sessions_saved,
            self.stats.manual_sessions_saved,
            self.stats.sessions_failed,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_tokens() {
        assert_eq!("RECORD_START".parse(), Ok(Command::RecordStart));
        assert_eq!("  record_stop\n".parse(), Ok(Command::RecordStop));
        assert_eq!("Start".parse(), Ok(Command::EnableDetection));
        assert_eq!("STOP".parse(), Ok(Command::DisableDetection));
        assert_eq!("status".parse(), Ok(Command::Status));
        assert_eq!("MOTION_ON".parse(), Ok(Command::EnableDetection));
        assert_eq!("motion_off".parse(), Ok(Command::DisableDetection));
    }

    #[test]
    fn unknown_token_is_reported_uppercased() {
        let err = "record".parse::<Command>().unwrap_err();
        assert_eq!(err, UnknownCommand("RECORD".into()));
        assert!("".parse::<Command>().is_err());
    }

    #[test]
    fn display_is_canonical_token() {
        for cmd in [
            Command::RecordStart,
            Command::RecordStop,
            Command::EnableDetection,
            Command::DisableDetection,
            Command::Status,
        ] {
            assert_eq!(cmd.to_string().parse(), Ok(cmd));
        }
    }

    #[test]
    fn session_elapsed() {
        let start = Local::now();
        let mut session = RecordingSession::new(1, RecordingKind::Manual, start);
        let later = start + chrono::Duration::seconds(7);
        assert_eq!(session.elapsed(later), chrono::Duration::seconds(7));
        session.end = Some(start + chrono::Duration::seconds(3));
        assert_eq!(session.elapsed(later), chrono::Duration::seconds(3));
        assert!(!session.is_finished());
    }

    #[test]
    fn status_report_json() {
        let report = StatusReport {
            timestamp: Local::now(),
            phase: ControllerPhase::PostRoll,
            detection_enabled: true,
            active_session: None,
            stats: RecordingStats::default(),
        };
        let buf = serde_json::to_string(&report).unwrap();
        assert!(buf.contains("\"phase\":\"post_roll\""));
        let parsed: StatusReport = serde_json::from_str(&buf).unwrap();
        assert_eq!(parsed, report);
    }
}
