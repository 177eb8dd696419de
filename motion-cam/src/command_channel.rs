//! Commands arrive as a single token written to a control file.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures::StreamExt;
use motion_cam_types::{Command, StatusReport};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, info, warn};

use crate::Result;

/// A file which an external process writes a command token into.
///
/// Each poll consumes the file, so a command is acted on once.
pub struct CommandFile {
    path: PathBuf,
}

impl CommandFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory holding the control file.
    pub fn ensure_dir(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Take the last non-empty line of the file, removing the file.
    fn take_token(&self) -> Result<Option<String>> {
        let mut claimed = self.path.clone().into_os_string();
        claimed.push(".processing");
        let claimed = PathBuf::from(claimed);
        // Renaming first means a token written while we read goes to a
        // fresh file and is seen on the next poll.
        match std::fs::rename(&self.path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let contents = std::fs::read_to_string(&claimed);
        if let Err(e) = std::fs::remove_file(&claimed) {
            warn!("cannot remove \"{}\": {e}", claimed.display());
        }
        Ok(contents?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(String::from))
    }

    /// Check for a command. An unrecognized token is an error, after which
    /// polling may continue.
    pub fn poll(&self) -> Result<Option<Command>> {
        match self.take_token()? {
            None => Ok(None),
            Some(token) => Ok(Some(token.parse()?)),
        }
    }
}

/// A command on its way to the frame processing task.
#[derive(Debug)]
pub struct CommandEvent {
    pub command: Command,
    /// Present for [Command::Status].
    pub reply: Option<oneshot::Sender<StatusReport>>,
}

fn write_status(path: &Path, report: &StatusReport) -> Result<()> {
    let buf = serde_json::to_vec_pretty(report)?;
    std::fs::write(path, buf)?;
    Ok(())
}

/// Poll `file` until the valve closes or the receiver is dropped.
///
/// Status reports are logged and, if `status_file` is given, written there
/// as JSON.
pub async fn command_poll_task(
    file: CommandFile,
    interval: Duration,
    valve: stream_cancel::Valve,
    tx: mpsc::Sender<CommandEvent>,
    status_file: Option<PathBuf>,
) {
    let interval_stream = IntervalStream::new(tokio::time::interval(interval));
    let mut ticks = valve.wrap(interval_stream);
    while ticks.next().await.is_some() {
        let command = match file.poll() {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };
        info!("received command {command}");
        let (reply, reply_rx) = if command == Command::Status {
            let (reply, reply_rx) = oneshot::channel();
            (Some(reply), Some(reply_rx))
        } else {
            (None, None)
        };
        if tx.send(CommandEvent { command, reply }).await.is_err() {
            break;
        }
        if let Some(reply_rx) = reply_rx {
            let Ok(report) = reply_rx.await else {
                break;
            };
            info!("status: {report}");
            if let Some(path) = &status_file {
                if let Err(e) = write_status(path, &report) {
                    warn!("cannot write status to \"{}\": {e}", path.display());
                }
            }
        }
    }
    debug!("command polling done {}:{}", file!(), line!());
}
