use std::{
    ops::Range,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use machine_vision_formats::owned::OImage;

use crate::{Error, Frame, FrameSource, Result};

const BACKGROUND: u8 = 96;

/// How [TestPatternSource] produces timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// Deliver frames at the nominal rate, stamped with the wall clock.
    Realtime,
    /// Deliver frames immediately, stamped `fno / fps` after the given start.
    Synthetic(DateTime<Local>),
}

/// When the test pattern shows motion.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionPattern {
    /// `active` frames of motion at the start of every `period` frames.
    Periodic { period: u64, active: u64 },
    /// Motion during each listed range of frame numbers.
    Frames(Vec<Range<u64>>),
}

impl MotionPattern {
    fn is_moving(&self, fno: u64) -> bool {
        match self {
            MotionPattern::Periodic { period, active } => {
                *period > 0 && fno % period < *active
            }
            MotionPattern::Frames(ranges) => ranges.iter().any(|r| r.contains(&fno)),
        }
    }
}

/// A synthetic source: a gray field with a white square which moves while
/// the [MotionPattern] says so and otherwise stays put.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    fps: f64,
    pacing: Pacing,
    motion: MotionPattern,
    open: bool,
    fno: u64,
    block_x: u32,
    next_due: Option<Instant>,
}

impl TestPatternSource {
    /// By default the square moves for three seconds out of every twenty.
    pub fn new(width: u32, height: u32, fps: f64, pacing: Pacing) -> Self {
        let period = (fps * 20.0).round().max(1.0) as u64;
        let active = (fps * 3.0).round().max(1.0) as u64;
        Self {
            width,
            height,
            fps,
            pacing,
            motion: MotionPattern::Periodic { period, active },
            open: false,
            fno: 0,
            block_x: 0,
            next_due: None,
        }
    }

    pub fn with_motion(mut self, motion: MotionPattern) -> Self {
        self.motion = motion;
        self
    }

    fn block_size(&self) -> u32 {
        (self.width.min(self.height) / 4).max(1)
    }

    fn render(&self) -> Vec<u8> {
        let stride = self.width as usize * 3;
        let mut buf = vec![BACKGROUND; stride * self.height as usize];
        let size = self.block_size();
        let y0 = (self.height - size) / 2;
        let x1 = (self.block_x + size).min(self.width);
        for row in y0..y0 + size {
            let start = row as usize * stride + self.block_x as usize * 3;
            let end = row as usize * stride + x1 as usize * 3;
            buf[start..end].fill(255);
        }
        buf
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

impl FrameSource for TestPatternSource {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn nominal_fps(&self) -> f64 {
        self.fps
    }

    fn description(&self) -> String {
        format!(
            "test pattern {}x{} at {} fps",
            self.width, self.height, self.fps
        )
    }

    fn open(&mut self) -> Result<()> {
        if self.width == 0 || self.height == 0 || !(self.fps > 0.0) {
            return Err(Error::InvalidSize(self.width, self.height));
        }
        self.open = true;
        self.next_due = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(Error::NotOpen);
        }

        let timestamp = match self.pacing {
            Pacing::Realtime => {
                let now = Instant::now();
                let due = self.next_due.unwrap_or(now);
                if due > now {
                    std::thread::sleep(due - now);
                }
                self.next_due = Some(due.max(now) + self.frame_interval());
                Local::now()
            }
            Pacing::Synthetic(start) => {
                let nanos = (self.fno as f64 * 1e9 / self.fps).round() as i64;
                start + chrono::Duration::nanoseconds(nanos)
            }
        };

        if self.motion.is_moving(self.fno) {
            let step = (self.block_size() / 2).max(1);
            let span = self.width - self.block_size();
            self.block_x = if span == 0 {
                0
            } else {
                (self.block_x + step) % span
            };
        }

        let image = OImage::new(self.width, self.height, self.width as usize * 3, self.render())
            .ok_or(Error::InvalidSize(self.width, self.height))?;
        let frame = Frame::new(self.fno, timestamp, image);
        self.fno += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        self.open = false;
    }
}
