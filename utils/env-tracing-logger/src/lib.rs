use std::path::Path;

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

/// Keeps logging configured while alive.
#[must_use]
pub struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {}
}

/// Build the filter from `RUST_LOG`, falling back to `default_directives`.
fn env_filter(default_directives: Option<&str>) -> EnvFilter {
    match (std::env::var("RUST_LOG"), default_directives) {
        (Ok(_), _) | (Err(_), None) => EnvFilter::from_default_env(),
        (Err(_), Some(directives)) => EnvFilter::new(directives),
    }
}

/// Open `path` for appending, creating it and its parent directory as needed.
fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

/// Start logging to file and console, both optional.
///
/// The filter is taken from the `RUST_LOG` environment variable. When it is
/// unset, `default_directives` are used if given.
pub fn initiate_logging<P: AsRef<Path>>(
    path: Option<P>,
    disable_console: bool,
    default_directives: Option<&str>,
) -> Result<Guard, Box<dyn std::error::Error + Send + Sync + 'static>> {
    // Create a fixed offset time formatter based on the timezone at the
    // time this line of code runs.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = if let Some(path) = &path {
        let file = open_log_file(path.as_ref())?;
        let file_writer = std::sync::Mutex::new(file);
        Some(
            fmt::layer()
                .with_timer(timer.clone())
                .with_writer(file_writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let console_layer = if disable_console {
        None
    } else {
        let with_ansi = !cfg!(windows);
        Some(
            fmt::layer()
                .with_timer(timer)
                .with_ansi(with_ansi)
                .with_file(true)
                .with_line_number(true),
        )
    };

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter(default_directives));
    tracing::subscriber::set_global_default(collector)?;

    let log_var = match (std::env::var("RUST_LOG"), default_directives) {
        (Ok(var), _) => format!(" with RUST_LOG=\"{var}\"."),
        (Err(_), Some(directives)) => format!(" with default filter \"{directives}\"."),
        (Err(_), None) => ".".to_string(),
    };

    if let Some(path) = &path {
        tracing::debug!(
            "Logging initiated to file \"{}\"{log_var}",
            path.as_ref().display(),
        );
    }

    if !disable_console {
        tracing::debug!("Logging initiated to console{log_var}",);
    }

    Ok(Guard {})
}
