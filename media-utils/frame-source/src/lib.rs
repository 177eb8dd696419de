//! Sources of timestamped RGB frames.
use std::sync::Arc;

use chrono::{DateTime, Local};
use machine_vision_formats::{owned::OImage, pixel_format::RGB8};

mod ffmpeg_stream_source;
pub use ffmpeg_stream_source::FfmpegStreamSource;
mod test_pattern_source;
pub use test_pattern_source::{MotionPattern, Pacing, TestPatternSource};

/// The `url` which selects [TestPatternSource] in [open_source].
pub const TEST_PATTERN_URL: &str = "test-pattern";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source is not open")]
    NotOpen,
    #[error("stream ended ({status})")]
    StreamEnded { status: String },
    #[error("invalid source size {0}x{1}")]
    InvalidSize(u32, u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A decoded RGB frame with the time it was acquired.
///
/// Cloning is cheap: the image data is shared.
#[derive(Clone)]
pub struct Frame {
    /// Sequence number within the source, starting at 0 and never reset by
    /// reconnection.
    pub fno: u64,
    pub timestamp: DateTime<Local>,
    pub image: Arc<OImage<RGB8>>,
}

impl Frame {
    pub fn new(fno: u64, timestamp: DateTime<Local>, image: OImage<RGB8>) -> Self {
        Self {
            fno,
            timestamp,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        use machine_vision_formats::ImageData;
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        use machine_vision_formats::ImageData;
        self.image.height()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("fno", &self.fno)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

/// A live source of frames.
///
/// All frames from a source have the dimensions given by [Self::width] and
/// [Self::height]. Timestamps never decrease.
pub trait FrameSource: Send {
    /// Width of the frames, in pixels.
    fn width(&self) -> u32;
    /// Height of the frames, in pixels.
    fn height(&self) -> u32;
    /// The frame rate the source is expected to deliver.
    fn nominal_fps(&self) -> f64;
    /// Human readable description, used in log messages.
    fn description(&self) -> String;
    /// Connect to the source. Calling this on an open source reconnects.
    fn open(&mut self) -> Result<()>;
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame>;
    /// Disconnect. Reading after this fails until [Self::open] is called.
    fn close(&mut self);
}

/// Parameters common to all sources.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Path or name of the ffmpeg executable.
    pub ffmpeg: String,
}

/// Create the source named by `settings.url`. The source is not yet open.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    if settings.width == 0 || settings.height == 0 {
        return Err(Error::InvalidSize(settings.width, settings.height));
    }
    if settings.url == TEST_PATTERN_URL {
        Ok(Box::new(TestPatternSource::new(
            settings.width,
            settings.height,
            settings.fps,
            Pacing::Realtime,
        )))
    } else {
        Ok(Box::new(FfmpegStreamSource::new(settings)))
    }
}
