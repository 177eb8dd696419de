use std::time::Duration;

use chrono::{DateTime, Local};
use frame_source::Frame;
use futures::StreamExt;
use motion_cam_types::StatusReport;
use motion_detector::MotionDetector;
use tokio::sync::mpsc;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, trace, warn};

use crate::{
    Result,
    command_channel::CommandEvent,
    controller::{Directive, RecordingController},
    encoder_task::EncoderEvent,
    handoff::{EncoderMsg, HandoffSender},
    ring_buffer::RingBuffer,
    source_task::SourceMsg,
};

/// Owns everything touched per frame: the ring buffer, the detector and the
/// controller. Frames, commands and encoder events are handled one at a
/// time, so controller transitions never race.
pub struct FrameProcessor {
    detector: MotionDetector,
    ring: RingBuffer,
    controller: RecordingController,
    encoder_tx: HandoffSender,
    /// Frames waiting beyond this many are buffered but not scored.
    score_backlog_limit: usize,
    /// The newest frame already handed to the encoder.
    last_sent_fno: Option<u64>,
    last_frame_ts: Option<DateTime<Local>>,
}

impl FrameProcessor {
    pub fn new(
        detector: MotionDetector,
        ring: RingBuffer,
        controller: RecordingController,
        encoder_tx: HandoffSender,
        score_backlog_limit: usize,
    ) -> Self {
        Self {
            detector,
            ring,
            controller,
            encoder_tx,
            score_backlog_limit,
            last_sent_fno: None,
            last_frame_ts: None,
        }
    }

    /// The time used for commands, ticks and encoder events. It never falls
    /// behind the timestamp of the newest frame, so every transition is
    /// stamped on one monotonic timeline.
    pub fn clock(&self) -> DateTime<Local> {
        let now = Local::now();
        match self.last_frame_ts {
            Some(ts) if ts > now => ts,
            _ => now,
        }
    }

    pub fn controller(&self) -> &RecordingController {
        &self.controller
    }

    /// Handle one frame. `backlog` is the number of frames queued behind it.
    pub fn handle_frame(&mut self, frame: Frame, backlog: usize) {
        if self.last_frame_ts.is_none_or(|ts| frame.timestamp > ts) {
            self.last_frame_ts = Some(frame.timestamp);
        }
        self.ring.push(&frame);
        let score = if backlog > self.score_backlog_limit {
            trace!("{backlog} frames waiting, not scoring frame {}", frame.fno);
            None
        } else {
            match self.detector.score(&*frame.image) {
                Ok(score) => Some(score),
                Err(e) => {
                    warn!("cannot score frame {}: {e}", frame.fno);
                    None
                }
            }
        };
        self.controller.note_frame(score.is_some());
        let directive = match &score {
            Some(score) => self.controller.on_motion(score, frame.timestamp),
            None => self.controller.on_tick(frame.timestamp),
        };
        if let Some(directive) = directive {
            self.apply(directive);
        }
        if let Some(session) = self.controller.active_session() {
            if self.last_sent_fno != Some(frame.fno) {
                self.last_sent_fno = Some(frame.fno);
                if self.encoder_tx.send_frame(session.id, frame) {
                    debug!(
                        "encoder behind, {} frames dropped so far",
                        self.encoder_tx.dropped_frames()
                    );
                }
            }
        }
    }

    pub fn handle_command(&mut self, event: CommandEvent, now: DateTime<Local>) {
        if let Some(directive) = self.controller.on_command(event.command, now) {
            self.apply(directive);
        }
        if let Some(reply) = event.reply {
            if reply.send(self.controller.status(now)).is_err() {
                debug!("status requester went away");
            }
        }
    }

    pub fn handle_encoder_event(&mut self, event: EncoderEvent, now: DateTime<Local>) {
        self.controller.on_encoder_event(event, now);
    }

    pub fn handle_tick(&mut self, now: DateTime<Local>) {
        if let Some(directive) = self.controller.on_tick(now) {
            self.apply(directive);
        }
    }

    /// Close any open session and hang up on the encoder.
    pub fn shutdown(mut self, now: DateTime<Local>) -> RecordingController {
        if let Some(directive) = self.controller.shutdown(now) {
            self.apply(directive);
        }
        let dropped = self.encoder_tx.dropped_frames();
        if dropped > 0 {
            warn!("{dropped} frames were dropped because the encoder fell behind");
        }
        self.controller
    }

    fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::Open {
                session,
                with_preroll,
            } => {
                let preroll = if with_preroll {
                    self.ring.drain()
                } else {
                    Vec::new()
                };
                if let Some(last) = preroll.last() {
                    self.last_sent_fno = Some(last.fno);
                }
                debug!(
                    "session {} opens with {} pre-roll frames",
                    session.id,
                    preroll.len()
                );
                self.encoder_tx
                    .send_control(EncoderMsg::Open { session, preroll });
            }
            Directive::Close { session_id } => {
                self.encoder_tx
                    .send_control(EncoderMsg::Close { session_id });
                // these were recorded already
                let n = self.ring.drain().len();
                trace!("discarded {n} buffered frames after session {session_id}");
            }
        }
    }
}

/// Run until the source ends, a fatal error occurs or the valve closes.
///
/// Any open session is closed and the encoder's reports on it are awaited
/// before returning.
pub async fn frame_process_task(
    mut processor: FrameProcessor,
    mut frame_rx: mpsc::Receiver<SourceMsg>,
    mut cmd_rx: mpsc::Receiver<CommandEvent>,
    mut encoder_rx: mpsc::UnboundedReceiver<EncoderEvent>,
    valve: stream_cancel::Valve,
    tick_interval: Duration,
) -> Result<StatusReport> {
    let mut quit = valve.wrap(futures::stream::pending::<()>());
    let mut ticks = IntervalStream::new(tokio::time::interval(tick_interval));
    let mut commands_open = true;
    let mut encoder_open = true;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = quit.next() => {
                info!("stopping frame processing");
                break Ok(());
            }
            event = encoder_rx.recv(), if encoder_open => match event {
                Some(event) => {
                    let now = processor.clock();
                    processor.handle_encoder_event(event, now);
                }
                None => encoder_open = false,
            },
            event = cmd_rx.recv(), if commands_open => match event {
                Some(event) => {
                    let now = processor.clock();
                    processor.handle_command(event, now);
                }
                None => commands_open = false,
            },
            msg = frame_rx.recv() => match msg {
                Some(SourceMsg::Frame(frame)) => {
                    let backlog = frame_rx.len();
                    processor.handle_frame(frame, backlog);
                }
                Some(SourceMsg::Fatal(e)) => {
                    error!("{e}");
                    break Err(e);
                }
                None => {
                    info!("frame source ended");
                    break Ok(());
                }
            },
            _ = ticks.next() => {
                let now = processor.clock();
                processor.handle_tick(now);
            }
        }
    };
    drop(frame_rx);
    drop(cmd_rx);

    let mut clock = processor.clock();
    let mut controller = processor.shutdown(clock);
    let n = controller.num_closing();
    if n > 0 {
        info!("waiting for the encoder to finish {n} session(s)");
    }
    while let Some(event) = encoder_rx.recv().await {
        clock = clock.max(Local::now());
        controller.on_encoder_event(event, clock);
    }
    let report = controller.status(clock.max(Local::now()));
    info!("final status: {report}");
    outcome.map(|()| report)
}
