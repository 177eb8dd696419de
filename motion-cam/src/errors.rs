#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("transient read failure: {0}")]
    TransientReadFailure(#[source] frame_source::Error),
    #[error("encoder failure: {0}")]
    Encoder(String),
    #[error("storage exhausted: {0}")]
    StorageExhausted(String),
    #[error("malformed command: {0}")]
    MalformedCommand(#[from] motion_cam_types::UnknownCommand),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame source error: {0}")]
    Source(#[from] frame_source::Error),
    #[error("ffmpeg writer error: {0}")]
    Writer(#[from] ffmpeg_writer::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the process must stop. Everything else is logged and
    /// recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::SourceUnavailable(_))
    }
}

impl From<motion_detector::Error> for Error {
    fn from(e: motion_detector::Error) -> Self {
        Error::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
