use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, FixedOffset, Local};
use motion_detector::{CropSpec, CropTransform, MotionDetectorConfig, OutputGeometry, Region};
use serde::Serialize;

use crate::{Error, Result};
use motion_cam_types::RecordingKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceConfig {
    /// Stream URL, or [frame_source::TEST_PATTERN_URL].
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Consecutive failed reads tolerated before the source is reopened.
    pub max_read_retries: u32,
    /// Reopen attempts before the source is declared unavailable.
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingConfig {
    pub buffer_seconds: f64,
    pub post_motion_seconds: f64,
    pub min_motion_frames: u32,
    /// Enable motion-triggered recording at startup.
    pub auto_start_motion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionConfig {
    pub start_percent: f64,
    pub extend_percent: f64,
    pub pixel_threshold: u8,
    pub background_alpha: f32,
    pub step: u32,
    /// Changed areas smaller than this many pixels are ignored.
    pub min_blob_area: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageConfig {
    pub min_free_gb: f64,
    pub max_used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncoderConfig {
    pub ffmpeg: String,
    pub codec: String,
    pub preset: Option<String>,
    pub crf: Option<u32>,
    /// Frames which may wait for the encoder before the oldest is dropped.
    pub queue_frames: usize,
}

/// A run-scoped override of the configured region of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RoiOverride {
    #[default]
    UseConfigured,
    /// Examine the full frame regardless of the configured region.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub source: SourceConfig,
    pub output_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub control_file: PathBuf,
    pub status_file: Option<PathBuf>,
    pub session_log: Option<PathBuf>,
    pub command_poll_interval: Duration,
    pub recording: RecordingConfig,
    pub detection: DetectionConfig,
    /// The configured region of interest.
    pub roi: Option<Region>,
    pub roi_override: RoiOverride,
    pub crop: CropSpec,
    pub storage: StorageConfig,
    pub encoder: EncoderConfig,
    /// Fixed timezone for file names. The local timezone if unset.
    pub utc_offset_hours: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                url: "rtmp://nginx-rtmp/live".into(),
                width: 1280,
                height: 720,
                fps: 30.0,
                max_read_retries: 3,
                max_reconnect_attempts: 10,
                reconnect_delay: Duration::from_secs(2),
            },
            output_dir: PathBuf::from("./recordings"),
            log_file: None,
            control_file: PathBuf::from("/tmp/control/command"),
            status_file: None,
            session_log: None,
            command_poll_interval: Duration::from_millis(1000),
            recording: RecordingConfig {
                buffer_seconds: 5.0,
                post_motion_seconds: 5.0,
                min_motion_frames: 3,
                auto_start_motion: false,
            },
            detection: DetectionConfig {
                start_percent: 0.5,
                extend_percent: 0.2,
                pixel_threshold: 25,
                background_alpha: 0.05,
                step: 2,
                min_blob_area: 500,
            },
            roi: None,
            roi_override: RoiOverride::UseConfigured,
            crop: CropSpec::default(),
            storage: StorageConfig {
                min_free_gb: 1.0,
                max_used_percent: 95.0,
            },
            encoder: EncoderConfig {
                ffmpeg: "ffmpeg".into(),
                codec: "libx264".into(),
                preset: Some("veryfast".into()),
                crf: Some(23),
                queue_frames: 60,
            },
            utc_offset_hours: None,
        }
    }
}

fn config_err<S: Into<String>>(msg: S) -> Error {
    Error::Configuration(msg.into())
}

/// Longest accepted pre-roll or post-motion period.
pub const MAX_PERIOD_SECONDS: f64 = 86_400.0;

/// Most frames the pre-roll buffer may hold.
pub const MAX_PREROLL_FRAMES: usize = 10_000;

/// Accepted nominal frame rates.
pub const FPS_RANGE: std::ops::RangeInclusive<f64> = 0.001..=1000.0;

fn period_seconds(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=MAX_PERIOD_SECONDS).contains(&value) {
        Ok(())
    } else {
        Err(config_err(format!(
            "{name} must be between 0 and {MAX_PERIOD_SECONDS} seconds, got {value}"
        )))
    }
}

impl Config {
    /// Check every invariant, reporting the first violation.
    pub fn validate(&self) -> Result<()> {
        let s = &self.source;
        if s.url.trim().is_empty() {
            return Err(config_err("source URL is empty"));
        }
        if s.width == 0 || s.height == 0 {
            return Err(config_err(format!(
                "source size {}x{} is empty",
                s.width, s.height
            )));
        }
        if !FPS_RANGE.contains(&s.fps) {
            return Err(config_err(format!(
                "source fps must be between {} and {}, got {}",
                FPS_RANGE.start(),
                FPS_RANGE.end(),
                s.fps
            )));
        }
        period_seconds("BUFFER_SECONDS", self.recording.buffer_seconds)?;
        period_seconds("POST_MOTION_SECONDS", self.recording.post_motion_seconds)?;
        if self.ring_buffer_capacity() > MAX_PREROLL_FRAMES {
            return Err(config_err(format!(
                "BUFFER_SECONDS {} at {} fps needs {} frames, at most {MAX_PREROLL_FRAMES} are allowed",
                self.recording.buffer_seconds,
                s.fps,
                self.ring_buffer_capacity()
            )));
        }
        if self.recording.min_motion_frames == 0 {
            return Err(config_err("MIN_MOTION_FRAMES must be at least 1"));
        }
        if self.command_poll_interval.is_zero() {
            return Err(config_err("command poll interval must be positive"));
        }
        if self.encoder.queue_frames == 0 {
            return Err(config_err("ENCODER_QUEUE_FRAMES must be at least 1"));
        }
        if !(self.storage.min_free_gb.is_finite() && self.storage.min_free_gb >= 0.0) {
            return Err(config_err(format!(
                "MIN_FREE_GB must be non-negative, got {}",
                self.storage.min_free_gb
            )));
        }
        if !(self.storage.max_used_percent > 0.0 && self.storage.max_used_percent <= 100.0) {
            return Err(config_err(format!(
                "MAX_USED_PERCENT must be in (0, 100], got {}",
                self.storage.max_used_percent
            )));
        }
        if let Some(roi) = &self.roi {
            roi.validate(s.width, s.height)?;
        }
        self.detector_config().validate(s.width, s.height)?;
        self.output_geometry()?;
        self.timezone()?;
        Ok(())
    }

    /// The region of interest after applying [RoiOverride].
    pub fn effective_roi(&self) -> Option<Region> {
        match self.roi_override {
            RoiOverride::UseConfigured => self.roi,
            RoiOverride::Disabled => None,
        }
    }

    /// The region examined for motion.
    pub fn detection_region(&self) -> Region {
        self.effective_roi()
            .unwrap_or(Region::full(self.source.width, self.source.height))
    }

    pub fn detector_config(&self) -> MotionDetectorConfig {
        let d = &self.detection;
        MotionDetectorConfig {
            region: self.detection_region(),
            pixel_threshold: d.pixel_threshold,
            start_percent: d.start_percent,
            extend_percent: d.extend_percent,
            background_alpha: d.background_alpha,
            step: d.step,
            min_blob_area: d.min_blob_area,
        }
    }

    pub fn output_geometry(&self) -> Result<OutputGeometry> {
        let t = CropTransform::new(self.source.width, self.source.height);
        Ok(t.resolve(&self.crop, self.effective_roi().as_ref())?)
    }

    pub fn ring_buffer_capacity(&self) -> usize {
        (self.recording.buffer_seconds * self.source.fps).ceil() as usize
    }

    pub fn post_motion(&self) -> chrono::Duration {
        let ms = (self.recording.post_motion_seconds * 1000.0).round() as i64;
        chrono::Duration::try_milliseconds(ms).unwrap_or(chrono::Duration::MAX)
    }

    pub fn frame_interval(&self) -> chrono::Duration {
        chrono::Duration::nanoseconds((1e9 / self.source.fps).round() as i64)
    }

    pub fn timezone(&self) -> Result<OperatingTimezone> {
        match self.utc_offset_hours {
            None => Ok(OperatingTimezone::Local),
            Some(hours) => {
                let secs = (hours * 3600.0).round();
                if !secs.is_finite() || secs.abs() >= 86_400.0 {
                    return Err(config_err(format!("UTC_OFFSET_HOURS {hours} out of range")));
                }
                FixedOffset::east_opt(secs as i32)
                    .map(OperatingTimezone::Fixed)
                    .ok_or_else(|| config_err(format!("UTC_OFFSET_HOURS {hours} out of range")))
            }
        }
    }

    pub fn kind_dir(&self, kind: RecordingKind) -> PathBuf {
        self.output_dir.join(kind.as_str())
    }

    pub fn source_settings(&self) -> frame_source::SourceSettings {
        frame_source::SourceSettings {
            url: self.source.url.clone(),
            width: self.source.width,
            height: self.source.height,
            fps: self.source.fps,
            ffmpeg: self.encoder.ffmpeg.clone(),
        }
    }

    pub fn writer_options(&self) -> Result<ffmpeg_writer::WriterOptions> {
        let geometry = self.output_geometry()?;
        let c = geometry.crop;
        Ok(ffmpeg_writer::WriterOptions {
            ffmpeg: self.encoder.ffmpeg.clone(),
            width: self.source.width,
            height: self.source.height,
            fps: self.source.fps,
            crop: Some(ffmpeg_writer::Crop {
                x: c.x,
                y: c.y,
                width: c.width,
                height: c.height,
            }),
            scale: geometry.scale,
            codec_args: ffmpeg_writer::FfmpegCodecArgs {
                codec: self.encoder.codec.clone(),
                preset: self.encoder.preset.clone(),
                crf: self.encoder.crf,
                extra: vec![],
            },
        })
    }
}

/// The timezone used to name output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingTimezone {
    Local,
    Fixed(FixedOffset),
}

impl OperatingTimezone {
    pub fn format(&self, ts: &DateTime<Local>, fmt: &str) -> String {
        match self {
            OperatingTimezone::Local => ts.format(fmt).to_string(),
            OperatingTimezone::Fixed(offset) => ts.with_timezone(offset).format(fmt).to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use motion_detector::CropOrigin;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.ring_buffer_capacity(), 150);
        assert_eq!(cfg.post_motion(), chrono::Duration::seconds(5));
        assert_eq!(cfg.detection_region(), Region::full(1280, 720));
        assert_eq!(cfg.output_geometry().unwrap().origin, CropOrigin::FullFrame);
    }

    #[test]
    fn ring_buffer_capacity_rounds_up() {
        let mut cfg = Config::default();
        cfg.recording.buffer_seconds = 0.5;
        cfg.source.fps = 15.0;
        assert_eq!(cfg.ring_buffer_capacity(), 8);
        cfg.recording.buffer_seconds = 0.0;
        assert_eq!(cfg.ring_buffer_capacity(), 0);
    }

    #[test]
    fn extend_above_start_is_rejected() {
        let mut cfg = Config::default();
        cfg.detection.extend_percent = 1.0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn roi_outside_frame_is_rejected() {
        let mut cfg = Config::default();
        cfg.roi = Some(Region::new(1200, 0, 100, 100));
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn roi_override_disables_region() {
        let mut cfg = Config::default();
        cfg.roi = Some(Region::new(100, 100, 200, 200));
        cfg.crop.padding = Some(10);
        assert_eq!(cfg.detection_region(), Region::new(100, 100, 200, 200));
        assert_eq!(cfg.output_geometry().unwrap().crop, Region::new(90, 90, 220, 220));

        cfg.roi_override = RoiOverride::Disabled;
        assert_eq!(cfg.detection_region(), Region::full(1280, 720));
        assert_eq!(cfg.output_geometry().unwrap().origin, CropOrigin::FullFrame);
        // the configured value is untouched
        assert_eq!(cfg.roi, Some(Region::new(100, 100, 200, 200)));
    }

    #[test]
    fn invalid_values() {
        let mut cfg = Config::default();
        cfg.recording.min_motion_frames = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.recording.post_motion_seconds = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.recording.post_motion_seconds = 1e300;
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        let mut cfg = Config::default();
        cfg.recording.buffer_seconds = 1e300;
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        // within a day, but too many frames to hold
        let mut cfg = Config::default();
        cfg.recording.buffer_seconds = 3600.0;
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        let mut cfg = Config::default();
        cfg.source.fps = 1e300;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.source.fps = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.encoder.queue_frames = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.utc_offset_hours = Some(30.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn derived_durations_never_panic() {
        let mut cfg = Config::default();
        cfg.recording.post_motion_seconds = 1e300;
        assert_eq!(cfg.post_motion(), chrono::Duration::MAX);
        cfg.recording.post_motion_seconds = MAX_PERIOD_SECONDS;
        cfg.validate().unwrap();
        assert_eq!(cfg.post_motion(), chrono::Duration::days(1));
    }

    #[test]
    fn fixed_timezone_formatting() {
        let mut cfg = Config::default();
        cfg.utc_offset_hours = Some(3.0);
        let tz = cfg.timezone().unwrap();
        let ts = chrono::Utc
            .with_ymd_and_hms(2024, 5, 1, 21, 30, 15)
            .unwrap()
            .with_timezone(&Local);
        assert_eq!(tz.format(&ts, "%Y-%m-%d_%H-%M-%S"), "2024-05-02_00-30-15");
    }

    #[test]
    fn writer_options_follow_geometry() {
        let mut cfg = Config::default();
        cfg.crop.explicit = Some(Region::new(100, 50, 640, 360));
        cfg.crop.scale = Some((320, 180));
        let opts = cfg.writer_options().unwrap();
        assert_eq!(
            opts.video_filter().as_deref(),
            Some("crop=640:360:100:50,scale=320:180")
        );
        assert_eq!((opts.width, opts.height), (1280, 720));
    }
}
