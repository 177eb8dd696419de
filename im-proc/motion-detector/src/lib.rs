//! Motion scoring by comparison against a running background estimate.
//!
//! Each scored frame is reduced to luminance on a sparse grid inside the
//! region of interest. A sample counts as changed when it differs from the
//! background estimate by more than a pixel threshold. Changed samples are
//! cleaned up by a morphological open and close, and connected groups
//! smaller than a minimum area are dropped as noise. The score is the
//! percentage of the remaining changed samples.
use machine_vision_formats::{ImageStride, pixel_format::RGB8};
use serde::{Deserialize, Serialize};

mod blobs;
mod crop;
mod region;

pub use crop::{CropOrigin, CropSpec, CropTransform, OutputGeometry};
pub use region::Region;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("region {0} is empty")]
    EmptyRegion(Region),
    #[error("region {region} exceeds frame of {frame_width}x{frame_height}")]
    OutOfBounds {
        region: Region,
        frame_width: u32,
        frame_height: u32,
    },
    #[error("cannot parse region \"{0}\", expected X:Y:W:H")]
    ParseRegion(String),
    #[error("invalid output scale {0}x{1}")]
    InvalidScale(u32, u32),
    #[error("invalid motion thresholds: {0}")]
    InvalidThreshold(String),
    #[error("frame size {got_width}x{got_height} does not match detector size {width}x{height}")]
    FrameSizeMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionDetectorConfig {
    /// Only pixels inside this region are examined.
    pub region: Region,
    /// Luminance difference above which a sample counts as changed.
    pub pixel_threshold: u8,
    /// Percentage of changed samples which starts a recording.
    pub start_percent: f64,
    /// Percentage of changed samples which keeps a recording going. Never
    /// greater than `start_percent`.
    pub extend_percent: f64,
    /// Weight of the newest frame in the background estimate. `1.0` compares
    /// each frame against the previous one.
    pub background_alpha: f32,
    /// Sample every `step`th pixel in each direction.
    pub step: u32,
    /// Connected changed areas smaller than this many pixels are noise. `0`
    /// disables the noise filter.
    #[serde(default)]
    pub min_blob_area: u32,
}

impl MotionDetectorConfig {
    pub fn validate(&self, frame_width: u32, frame_height: u32) -> Result<()> {
        self.region.validate(frame_width, frame_height)?;
        let pct_ok = |v: f64| v.is_finite() && v > 0.0 && v <= 100.0;
        if !pct_ok(self.start_percent) || !pct_ok(self.extend_percent) {
            return Err(Error::InvalidThreshold(format!(
                "percentages must be in (0, 100], got start {} and extend {}",
                self.start_percent, self.extend_percent
            )));
        }
        if self.extend_percent > self.start_percent {
            return Err(Error::InvalidThreshold(format!(
                "extend threshold {} exceeds start threshold {}",
                self.extend_percent, self.start_percent
            )));
        }
        if !(self.background_alpha > 0.0 && self.background_alpha <= 1.0) {
            return Err(Error::InvalidThreshold(format!(
                "background alpha {} not in (0, 1]",
                self.background_alpha
            )));
        }
        if self.step == 0 {
            return Err(Error::InvalidThreshold("sampling step is zero".into()));
        }
        Ok(())
    }
}

/// The result of scoring one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionScore {
    /// Percentage of the region of interest which changed.
    pub area_percent: f64,
    /// The change is large enough to start a recording.
    pub starts: bool,
    /// The change is large enough to keep a recording going.
    pub extends: bool,
}

pub struct MotionDetector {
    cfg: MotionDetectorConfig,
    frame_width: u32,
    frame_height: u32,
    background: Option<Vec<f32>>,
}

impl MotionDetector {
    pub fn new(cfg: MotionDetectorConfig, frame_width: u32, frame_height: u32) -> Result<Self> {
        cfg.validate(frame_width, frame_height)?;
        Ok(Self {
            cfg,
            frame_width,
            frame_height,
            background: None,
        })
    }

    pub fn config(&self) -> &MotionDetectorConfig {
        &self.cfg
    }

    /// Forget the background estimate. The next frame re-seeds it.
    pub fn reset(&mut self) {
        self.background = None;
    }

    /// Score a frame and fold it into the background estimate.
    ///
    /// The first frame after construction or [Self::reset] only seeds the
    /// background and scores zero.
    pub fn score<IM>(&mut self, im: &IM) -> Result<MotionScore>
    where
        IM: ImageStride<RGB8>,
    {
        if im.width() != self.frame_width || im.height() != self.frame_height {
            return Err(Error::FrameSizeMismatch {
                width: self.frame_width,
                height: self.frame_height,
                got_width: im.width(),
                got_height: im.height(),
            });
        }

        let region = self.cfg.region;
        let step = self.cfg.step as usize;
        let stride = im.stride();
        let data = im.image_data();
        let cols = (region.x as usize..region.right() as usize).step_by(step);
        let rows = (region.y as usize..region.bottom() as usize).step_by(step);
        let n_samples = cols.len() * rows.len();

        let alpha = self.cfg.background_alpha;
        let threshold = self.cfg.pixel_threshold as f32;

        let Some(background) = self.background.as_mut() else {
            let mut seed = Vec::with_capacity(n_samples);
            for row in rows {
                let rowdata = &data[row * stride..];
                for col in cols.clone() {
                    seed.push(luminance(&rowdata[col * 3..col * 3 + 3]) as f32);
                }
            }
            self.background = Some(seed);
            return Ok(MotionScore::default());
        };

        let n_cols = cols.len();
        let n_rows = rows.len();
        let mut changed = Vec::with_capacity(n_samples);
        let mut bg = background.iter_mut();
        for row in rows {
            let rowdata = &data[row * stride..];
            for col in cols.clone() {
                let luma = luminance(&rowdata[col * 3..col * 3 + 3]) as f32;
                // Sample count is fixed by the region, so `bg` never runs out.
                let Some(b) = bg.next() else {
                    break;
                };
                changed.push((luma - *b).abs() > threshold);
                *b += alpha * (luma - *b);
            }
        }

        let changed = if self.cfg.min_blob_area == 0 {
            changed.iter().filter(|c| **c).count()
        } else {
            let pixels_per_sample = (step * step) as u64;
            let min_area = self.cfg.min_blob_area as u64;
            blobs::Mask::new(n_cols, n_rows, changed)
                .open_close()
                .blob_sizes()
                .into_iter()
                .filter(|size| *size as u64 * pixels_per_sample >= min_area)
                .sum()
        };

        let area_percent = if n_samples == 0 {
            0.0
        } else {
            changed as f64 * 100.0 / n_samples as f64
        };
        Ok(MotionScore {
            area_percent,
            starts: area_percent >= self.cfg.start_percent,
            extends: area_percent >= self.cfg.extend_percent,
        })
    }
}

/// Integer approximation of Rec. 601 luma.
#[inline]
pub fn luminance(rgb: &[u8]) -> u8 {
    let (r, g, b) = (rgb[0] as u32, rgb[1] as u32, rgb[2] as u32);
    ((77 * r + 150 * g + 29 * b) >> 8) as u8
}
