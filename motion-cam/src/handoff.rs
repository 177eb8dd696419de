//! A bounded queue from the frame processing task to the encoder thread.
//!
//! Control messages are never dropped. When the queue holds its limit of
//! frames, the oldest queued frame is discarded to make room, so the
//! producer never blocks on a slow encoder.
use std::{collections::VecDeque, sync::Arc};

use frame_source::Frame;
use motion_cam_types::RecordingSession;
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub enum EncoderMsg {
    Open {
        session: RecordingSession,
        preroll: Vec<Frame>,
    },
    Frame {
        session_id: u64,
        frame: Frame,
    },
    Close {
        session_id: u64,
    },
}

impl EncoderMsg {
    fn is_frame(&self) -> bool {
        matches!(self, EncoderMsg::Frame { .. })
    }
}

struct State {
    queue: VecDeque<EncoderMsg>,
    queued_frames: usize,
    dropped_frames: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    frame_capacity: usize,
}

pub struct HandoffSender {
    shared: Arc<Shared>,
}

pub struct HandoffReceiver {
    shared: Arc<Shared>,
}

/// Create a queue holding at most `frame_capacity` frames.
pub fn channel(frame_capacity: usize) -> (HandoffSender, HandoffReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            queued_frames: 0,
            dropped_frames: 0,
            closed: false,
        }),
        cond: Condvar::new(),
        frame_capacity: frame_capacity.max(1),
    });
    (
        HandoffSender {
            shared: shared.clone(),
        },
        HandoffReceiver { shared },
    )
}

impl HandoffSender {
    /// Queue an `Open` or `Close` message.
    pub fn send_control(&self, msg: EncoderMsg) {
        debug_assert!(!msg.is_frame());
        let mut state = self.shared.state.lock();
        state.queue.push_back(msg);
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Queue a frame, returning `true` if an older frame was dropped.
    pub fn send_frame(&self, session_id: u64, frame: Frame) -> bool {
        let mut state = self.shared.state.lock();
        let mut dropped = false;
        if state.queued_frames >= self.shared.frame_capacity {
            if let Some(idx) = state.queue.iter().position(EncoderMsg::is_frame) {
                if let Some(EncoderMsg::Frame { frame, session_id }) = state.queue.remove(idx) {
                    tracing::debug!("encoder busy, dropped frame {} of session {session_id}", frame.fno);
                }
                state.queued_frames -= 1;
                state.dropped_frames += 1;
                dropped = true;
            }
        }
        state
            .queue
            .push_back(EncoderMsg::Frame { session_id, frame });
        state.queued_frames += 1;
        drop(state);
        self.shared.cond.notify_one();
        dropped
    }

    /// Total frames discarded because the encoder fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.state.lock().dropped_frames
    }
}

impl Drop for HandoffSender {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.cond.notify_all();
    }
}

impl HandoffReceiver {
    /// Wait for the next message. Returns `None` once the sender is gone and
    /// the queue is empty.
    pub fn recv(&self) -> Option<EncoderMsg> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = state.queue.pop_front() {
                if msg.is_frame() {
                    state.queued_frames -= 1;
                }
                return Some(msg);
            }
            if state.closed {
                return None;
            }
            self.shared.cond.wait(&mut state);
        }
    }
}
