//! The recording state machine.
//!
//! The controller never touches frames or files. It turns motion scores,
//! commands, clock ticks and encoder events into [Directive]s which the
//! frame processing task carries out.
use chrono::{DateTime, Local};
use motion_cam_types::{
    ActiveSessionStatus, Command, ControllerPhase, RecordingKind, RecordingSession,
    RecordingStats, SessionStatus, StatusReport,
};
use motion_detector::MotionScore;
use tracing::{debug, error, info, trace, warn};

use crate::{Error, encoder_task::EncoderEvent, notifier::Notifier, storage_gate::StorageGate};

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Begin encoding `session`. With pre-roll, the buffered frames are
    /// written first.
    Open {
        session: RecordingSession,
        with_preroll: bool,
    },
    /// Finish the file of this session.
    Close { session_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub min_motion_frames: u32,
    pub post_motion: chrono::Duration,
    /// Whether motion-triggered recording is enabled at startup.
    pub detection_enabled: bool,
}

struct ActiveSession {
    session: RecordingSession,
    last_extend: DateTime<Local>,
    /// Set while counting down the post-motion tail.
    post_roll_deadline: Option<DateTime<Local>>,
}

pub struct RecordingController {
    settings: ControllerSettings,
    detection_enabled: bool,
    active: Option<ActiveSession>,
    /// Sessions told to close whose files are not yet finalized.
    closing: Vec<RecordingSession>,
    consecutive_motion_frames: u32,
    /// The current motion burst already had its chance to start a session.
    burst_handled: bool,
    next_session_id: u64,
    stats: RecordingStats,
    gate: Box<dyn StorageGate>,
    notifier: Box<dyn Notifier>,
}

impl RecordingController {
    pub fn new(
        settings: ControllerSettings,
        gate: Box<dyn StorageGate>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            detection_enabled: settings.detection_enabled,
            settings,
            active: None,
            closing: Vec::new(),
            consecutive_motion_frames: 0,
            burst_handled: false,
            next_session_id: 1,
            stats: RecordingStats::default(),
            gate,
            notifier,
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        match &self.active {
            None => ControllerPhase::Idle,
            Some(a) if a.post_roll_deadline.is_some() => ControllerPhase::PostRoll,
            Some(_) => ControllerPhase::Recording,
        }
    }

    pub fn detection_enabled(&self) -> bool {
        self.detection_enabled
    }

    pub fn active_session(&self) -> Option<&RecordingSession> {
        self.active.as_ref().map(|a| &a.session)
    }

    /// Number of sessions waiting for the encoder to finish their files.
    pub fn num_closing(&self) -> usize {
        self.closing.len()
    }

    pub fn stats(&self) -> &RecordingStats {
        &self.stats
    }

    /// Count a frame from the source.
    pub fn note_frame(&mut self, scored: bool) {
        self.stats.frames_processed += 1;
        if scored {
            self.stats.frames_scored += 1;
        } else {
            self.stats.frames_not_scored += 1;
        }
    }

    /// Evaluate the motion score of the frame acquired at `now`.
    pub fn on_motion(&mut self, score: &MotionScore, now: DateTime<Local>) -> Option<Directive> {
        if score.starts {
            self.consecutive_motion_frames += 1;
            self.stats.motion_frames += 1;
        } else {
            self.consecutive_motion_frames = 0;
            self.burst_handled = false;
        }
        let min = self.settings.min_motion_frames;
        let significant = self.consecutive_motion_frames >= min;
        if self.consecutive_motion_frames == min {
            self.stats.motion_events += 1;
            self.stats.last_motion = Some(now);
            debug!(
                "significant motion: {:.2}% of region over {min} frames",
                score.area_percent
            );
        }

        if self.active.is_none() {
            if significant && !self.burst_handled && self.detection_enabled {
                self.burst_handled = true;
                return self.try_open(RecordingKind::Motion, now);
            }
            return None;
        }

        if significant {
            self.burst_handled = true;
        }
        if let Some(active) = self.active.as_mut() {
            if active.session.kind == RecordingKind::Motion {
                if score.extends {
                    active.last_extend = now;
                    if active.post_roll_deadline.take().is_some() {
                        debug!("motion resumed, session {} continues", active.session.id);
                    }
                } else if active.post_roll_deadline.is_none() {
                    match active
                        .last_extend
                        .checked_add_signed(self.settings.post_motion)
                    {
                        Some(deadline) => {
                            debug!(
                                "motion ceased, session {} ends at {deadline} unless it resumes",
                                active.session.id
                            );
                            active.post_roll_deadline = Some(deadline);
                        }
                        None => trace!(
                            "post-motion period is beyond the calendar, session {} continues",
                            active.session.id
                        ),
                    }
                }
            }
        }
        self.expire_post_roll(now)
    }

    /// Check the post-motion countdown against the clock.
    pub fn on_tick(&mut self, now: DateTime<Local>) -> Option<Directive> {
        self.expire_post_roll(now)
    }

    pub fn on_command(&mut self, command: Command, now: DateTime<Local>) -> Option<Directive> {
        match command {
            Command::RecordStart => {
                if let Some(session) = self.active_session() {
                    warn!(
                        "ignoring {command}: {} session {} in progress",
                        session.kind, session.id
                    );
                    return None;
                }
                self.try_open(RecordingKind::Manual, now)
            }
            Command::RecordStop => {
                if self.active.is_none() {
                    warn!("ignoring {command}: no recording in progress");
                    return None;
                }
                self.close_active(now)
            }
            Command::EnableDetection => {
                self.detection_enabled = true;
                info!("motion detection enabled");
                None
            }
            Command::DisableDetection => {
                self.detection_enabled = false;
                info!("motion detection disabled");
                if let Some(session) = self.active_session() {
                    info!(
                        "{} session {} continues until it ends normally",
                        session.kind, session.id
                    );
                }
                None
            }
            Command::Status => None,
        }
    }

    pub fn on_encoder_event(&mut self, event: EncoderEvent, now: DateTime<Local>) {
        match event {
            EncoderEvent::Finalized {
                session_id,
                path,
                start,
                end,
                frames,
            } => {
                let Some(idx) = self.closing.iter().position(|s| s.id == session_id) else {
                    warn!("encoder finalized unknown session {session_id}");
                    return;
                };
                let mut session = self.closing.remove(idx);
                session.status = SessionStatus::Closed;
                session.output_path = Some(path);
                session.start = start;
                session.end = Some(end);
                session.frames_written = frames;
                match session.kind {
                    RecordingKind::Motion => self.stats.motion_sessions_saved += 1,
                    RecordingKind::Manual => self.stats.manual_sessions_saved += 1,
                }
                self.notify(&session);
            }
            EncoderEvent::Failed {
                session_id,
                reason,
                frames,
            } => {
                let mut session = if self
                    .active
                    .as_ref()
                    .is_some_and(|a| a.session.id == session_id)
                {
                    match self.active.take() {
                        Some(active) => active.session,
                        None => return,
                    }
                } else if let Some(idx) = self.closing.iter().position(|s| s.id == session_id) {
                    self.closing.remove(idx)
                } else {
                    warn!("encoder failed for unknown session {session_id}: {reason}");
                    return;
                };
                error!(
                    "{}",
                    Error::Encoder(format!("{} session {session_id}: {reason}", session.kind))
                );
                session.status = SessionStatus::Failed;
                session.end.get_or_insert(now);
                session.frames_written = frames;
                session.failure = Some(reason);
                self.stats.sessions_failed += 1;
                self.notify(&session);
            }
        }
    }

    /// Close any open session.
    pub fn shutdown(&mut self, now: DateTime<Local>) -> Option<Directive> {
        self.close_active(now)
    }

    pub fn status(&self, now: DateTime<Local>) -> StatusReport {
        StatusReport {
            timestamp: now,
            phase: self.phase(),
            detection_enabled: self.detection_enabled,
            active_session: self.active_session().map(|s| ActiveSessionStatus {
                id: s.id,
                kind: s.kind,
                start: s.start,
                elapsed_secs: s.elapsed(now).num_milliseconds() as f64 / 1000.0,
            }),
            stats: self.stats.clone(),
        }
    }

    fn try_open(&mut self, kind: RecordingKind, now: DateTime<Local>) -> Option<Directive> {
        if !self.gate.has_capacity() {
            self.stats.starts_suppressed += 1;
            warn!(
                "not starting {kind} recording: {}",
                Error::StorageExhausted("output filesystem is over its configured limits".into())
            );
            return None;
        }
        let id = self.next_session_id;
        self.next_session_id += 1;
        let session = RecordingSession::new(id, kind, now);
        info!("starting {kind} recording, session {id}");
        self.active = Some(ActiveSession {
            session: session.clone(),
            last_extend: now,
            post_roll_deadline: None,
        });
        Some(Directive::Open {
            session,
            with_preroll: kind == RecordingKind::Motion,
        })
    }

    fn expire_post_roll(&mut self, now: DateTime<Local>) -> Option<Directive> {
        let deadline = self.active.as_ref()?.post_roll_deadline?;
        if now >= deadline {
            self.close_active(now)
        } else {
            None
        }
    }

    fn close_active(&mut self, now: DateTime<Local>) -> Option<Directive> {
        let mut session = self.active.take()?.session;
        session.status = SessionStatus::Closing;
        // commands and ticks may be stamped behind frame time
        session.end = Some(now.max(session.start));
        info!(
            "stopping {} recording, session {} after {:.1}s",
            session.kind,
            session.id,
            session.elapsed(now).num_milliseconds() as f64 / 1000.0
        );
        let session_id = session.id;
        self.closing.push(session);
        Some(Directive::Close { session_id })
    }

    fn notify(&mut self, session: &RecordingSession) {
        if let Err(e) = self.notifier.notify(session) {
            warn!("notifier failed for session {}: {e}", session.id);
        }
    }
}
