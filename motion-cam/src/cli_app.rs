use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser, builder::BoolishValueParser};
use motion_detector::{CropSpec, Region};
use tracing::{debug, info};

use crate::{
    Error, Result, expand_path,
    config::{
        Config, DetectionConfig, EncoderConfig, RecordingConfig, RoiOverride, SourceConfig,
        StorageConfig,
    },
    run_app,
};

/// Used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "motion_cam=info,frame_source=info,ffmpeg_writer=info,warn";

/// The name of the environment file read when `--config` is not given.
pub const DEFAULT_ENV_FILE: &str = "config.env";

/// Record clips from a live video stream on motion or on command.
///
/// Every option can also be set in the environment or in an environment
/// file. Command line flags win over the environment, which wins over the
/// file.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Environment file with settings
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Live stream URL, or `test-pattern` for a synthetic source
    #[arg(long, env = "RTMP_URL", default_value = "rtmp://nginx-rtmp/live")]
    pub source_url: String,

    #[arg(long, env = "SOURCE_WIDTH", default_value_t = 1280)]
    pub source_width: u32,

    #[arg(long, env = "SOURCE_HEIGHT", default_value_t = 720)]
    pub source_height: u32,

    #[arg(long, env = "SOURCE_FPS", default_value_t = 30.0)]
    pub source_fps: f64,

    /// Base directory of the `motion` and `manual` clip directories
    #[arg(long, env = "OUTPUT_DIR", default_value = "./recordings")]
    pub output_dir: String,

    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<String>,

    /// File polled for command tokens
    #[arg(long, env = "CONTROL_FILE", default_value = "/tmp/control/command")]
    pub control_file: String,

    /// Write each STATUS report here as JSON
    #[arg(long, env = "STATUS_FILE")]
    pub status_file: Option<String>,

    /// Append a JSON line here for every finished session
    #[arg(long, env = "SESSION_LOG")]
    pub session_log: Option<String>,

    #[arg(long, env = "COMMAND_POLL_MS", default_value_t = 1000)]
    pub command_poll_ms: u64,

    /// Seconds of video kept from before motion starts
    #[arg(long, env = "BUFFER_SECONDS", default_value_t = 5.0)]
    pub buffer_seconds: f64,

    /// Seconds recorded after motion stops
    #[arg(long, env = "POST_MOTION_SECONDS", default_value_t = 5.0)]
    pub post_motion_seconds: f64,

    /// Percent of the region which must change to start recording
    #[arg(long, env = "MOTION_AREA_PERCENT", default_value_t = 0.5)]
    pub motion_area_percent: f64,

    /// Percent of the region which must change to keep recording
    #[arg(long, env = "EXTEND_MOTION_PERCENT", default_value_t = 0.2)]
    pub extend_motion_percent: f64,

    #[arg(long, env = "MIN_MOTION_FRAMES", default_value_t = 3)]
    pub min_motion_frames: u32,

    /// Luminance difference below which a pixel counts as unchanged
    #[arg(long, env = "PIXEL_DIFF_THRESHOLD", default_value_t = 25)]
    pub pixel_diff_threshold: u8,

    #[arg(long, env = "BACKGROUND_ALPHA", default_value_t = 0.05)]
    pub background_alpha: f32,

    #[arg(long, env = "DETECTION_STEP", default_value_t = 2)]
    pub detection_step: u32,

    /// Changed areas smaller than this many pixels are ignored as noise. 0
    /// disables the filter.
    #[arg(long, env = "MIN_CONTOUR_AREA", default_value_t = 500)]
    pub min_contour_area: u32,

    /// Enable motion-triggered recording at startup
    #[arg(
        long,
        env = "AUTO_START_MOTION",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub auto_start_motion: bool,

    #[arg(
        long,
        env = "ROI_ENABLED",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub roi_enabled: bool,

    #[arg(long, env = "ROI_X")]
    pub roi_x: Option<u32>,

    #[arg(long, env = "ROI_Y")]
    pub roi_y: Option<u32>,

    #[arg(long, env = "ROI_WIDTH")]
    pub roi_width: Option<u32>,

    #[arg(long, env = "ROI_HEIGHT")]
    pub roi_height: Option<u32>,

    /// Ignore the configured region of interest for this run
    #[arg(long)]
    pub no_roi: bool,

    /// Output crop as X:Y:W:H
    #[arg(long, env = "CROP", value_name = "X:Y:W:H")]
    pub crop: Option<Region>,

    /// Crop to the region of interest plus this many pixels
    #[arg(long, env = "CROP_PADDING")]
    pub crop_padding: Option<u32>,

    #[arg(long, env = "CROP_SCALE_WIDTH")]
    pub crop_scale_width: Option<u32>,

    #[arg(long, env = "CROP_SCALE_HEIGHT")]
    pub crop_scale_height: Option<u32>,

    /// Refuse new recordings with less free space than this
    #[arg(long, env = "MIN_FREE_GB", default_value_t = 1.0)]
    pub min_free_gb: f64,

    /// Refuse new recordings when the filesystem is fuller than this
    #[arg(long, env = "MAX_USED_PERCENT", default_value_t = 95.0)]
    pub max_used_percent: f64,

    #[arg(long, env = "ENCODER_QUEUE_FRAMES", default_value_t = 60)]
    pub encoder_queue_frames: usize,

    #[arg(long, env = "FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,

    #[arg(long, env = "VIDEO_CODEC", default_value = "libx264")]
    pub video_codec: String,

    /// Encoder preset, empty for none
    #[arg(long, env = "VIDEO_PRESET", default_value = "veryfast")]
    pub video_preset: String,

    #[arg(long, env = "VIDEO_CRF", default_value_t = 23)]
    pub video_crf: u32,

    #[arg(long, env = "MAX_READ_RETRIES", default_value_t = 3)]
    pub max_read_retries: u32,

    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value_t = 10)]
    pub max_reconnect_attempts: u32,

    #[arg(long, env = "RECONNECT_DELAY_SECONDS", default_value_t = 2.0)]
    pub reconnect_delay_seconds: f64,

    /// Fixed timezone offset for file names. Local time if unset.
    #[arg(long, env = "UTC_OFFSET_HOURS", allow_negative_numbers = true)]
    pub utc_offset_hours: Option<f64>,
}

fn config_err<S: Into<String>>(msg: S) -> Error {
    Error::Configuration(msg.into())
}

impl Cli {
    fn roi(&self) -> Result<Option<Region>> {
        if !self.roi_enabled {
            return Ok(None);
        }
        match (self.roi_x, self.roi_y, self.roi_width, self.roi_height) {
            (Some(x), Some(y), Some(w), Some(h)) => Ok(Some(Region::new(x, y, w, h))),
            _ => Err(config_err(
                "ROI_ENABLED requires ROI_X, ROI_Y, ROI_WIDTH and ROI_HEIGHT",
            )),
        }
    }

    fn crop_scale(&self) -> Result<Option<(u32, u32)>> {
        match (self.crop_scale_width, self.crop_scale_height) {
            (Some(w), Some(h)) => Ok(Some((w, h))),
            (None, None) => Ok(None),
            _ => Err(config_err(
                "CROP_SCALE_WIDTH and CROP_SCALE_HEIGHT must be given together",
            )),
        }
    }

    /// Resolve into a [Config]. The result is not yet validated.
    pub fn into_config(self) -> Result<Config> {
        if !(self.reconnect_delay_seconds.is_finite() && self.reconnect_delay_seconds >= 0.0) {
            return Err(config_err(format!(
                "RECONNECT_DELAY_SECONDS must be non-negative, got {}",
                self.reconnect_delay_seconds
            )));
        }
        let roi = self.roi()?;
        let crop = CropSpec {
            explicit: self.crop,
            padding: self.crop_padding,
            scale: self.crop_scale()?,
        };
        let roi_override = if self.no_roi {
            RoiOverride::Disabled
        } else {
            RoiOverride::UseConfigured
        };
        let preset = Some(self.video_preset.trim().to_string()).filter(|p| !p.is_empty());
        Ok(Config {
            source: SourceConfig {
                url: self.source_url,
                width: self.source_width,
                height: self.source_height,
                fps: self.source_fps,
                max_read_retries: self.max_read_retries,
                max_reconnect_attempts: self.max_reconnect_attempts,
                reconnect_delay: Duration::from_secs_f64(self.reconnect_delay_seconds),
            },
            output_dir: expand_path(&self.output_dir)?,
            log_file: self.log_file.as_deref().map(expand_path).transpose()?,
            control_file: expand_path(&self.control_file)?,
            status_file: self.status_file.as_deref().map(expand_path).transpose()?,
            session_log: self.session_log.as_deref().map(expand_path).transpose()?,
            command_poll_interval: Duration::from_millis(self.command_poll_ms),
            recording: RecordingConfig {
                buffer_seconds: self.buffer_seconds,
                post_motion_seconds: self.post_motion_seconds,
                min_motion_frames: self.min_motion_frames,
                auto_start_motion: self.auto_start_motion,
            },
            detection: DetectionConfig {
                start_percent: self.motion_area_percent,
                extend_percent: self.extend_motion_percent,
                pixel_threshold: self.pixel_diff_threshold,
                background_alpha: self.background_alpha,
                step: self.detection_step,
                min_blob_area: self.min_contour_area,
            },
            roi,
            roi_override,
            crop,
            storage: StorageConfig {
                min_free_gb: self.min_free_gb,
                max_used_percent: self.max_used_percent,
            },
            encoder: EncoderConfig {
                ffmpeg: self.ffmpeg,
                codec: self.video_codec,
                preset,
                crf: Some(self.video_crf),
                queue_frames: self.encoder_queue_frames,
            },
            utc_offset_hours: self.utc_offset_hours,
        })
    }
}

/// The value of `--config` in `args`, if any.
fn env_file_arg(args: &[String]) -> Option<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            return iter.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

/// Load the environment file named by `--config`, else [DEFAULT_ENV_FILE] if
/// it exists. Variables already set are kept.
fn load_env_file(args: &[String]) -> Result<()> {
    match env_file_arg(args) {
        Some(path) => {
            dotenv::from_path(&path).map_err(|e| {
                config_err(format!("cannot read \"{}\": {e}", path.display()))
            })?;
        }
        None => {
            dotenv::from_filename(DEFAULT_ENV_FILE).ok();
        }
    }
    Ok(())
}

pub fn parse_args() -> Result<Config> {
    let args: Vec<String> = std::env::args().collect();
    load_env_file(&args)?;
    Cli::parse_from(&args).into_config()
}

pub fn cli_main() -> eyre::Result<()> {
    let config = parse_args()?;
    let _guard = env_tracing_logger::initiate_logging(
        config.log_file.as_ref(),
        false,
        Some(DEFAULT_LOG_FILTER),
    )
    .map_err(|e| eyre::eyre!("cannot start logging: {e}"))?;
    debug!("configuration: {}", serde_json::to_string(&config)?);
    let report = run_app(config)?;
    info!("exiting: {report}");
    Ok(())
}
