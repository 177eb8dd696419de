//! Reads frames from a [FrameSource] in a dedicated thread.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use frame_source::{Frame, FrameSource};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{Error, Result};

#[derive(Debug)]
pub enum SourceMsg {
    Frame(Frame),
    /// The source is gone for good. Nothing follows.
    Fatal(Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failed reads tolerated before reopening the source.
    pub max_read_retries: u32,
    /// Failed opens tolerated before giving up.
    pub max_reconnect_attempts: u32,
    pub delay: Duration,
}

/// Asks the reader thread to stop. It notices between reads.
#[derive(Debug, Clone, Default)]
pub struct StopReader(Arc<AtomicBool>);

impl StopReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Open `source`, retrying per `policy`. Gives up early if nobody is
/// listening anymore.
fn connect(
    source: &mut dyn FrameSource,
    policy: &ReconnectPolicy,
    tx: &mpsc::Sender<SourceMsg>,
    stop: &StopReader,
) -> Result<()> {
    let mut failures = 0;
    loop {
        match source.open() {
            Ok(()) => {
                info!("connected to {}", source.description());
                return Ok(());
            }
            Err(e) => {
                failures += 1;
                if failures > policy.max_reconnect_attempts {
                    return Err(Error::SourceUnavailable(format!(
                        "{}: {e} (gave up after {failures} attempts)",
                        source.description()
                    )));
                }
                warn!(
                    "cannot open {} (attempt {failures} of {}): {e}",
                    source.description(),
                    policy.max_reconnect_attempts + 1
                );
            }
        }
        if tx.is_closed() || stop.is_stopped() {
            return Err(Error::SourceUnavailable("reader stopped".into()));
        }
        std::thread::sleep(policy.delay);
    }
}

fn reader_thread_loop(
    mut source: Box<dyn FrameSource>,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<SourceMsg>,
    stop: StopReader,
) {
    if let Err(e) = connect(source.as_mut(), &policy, &tx, &stop) {
        source.close();
        let _ = tx.blocking_send(SourceMsg::Fatal(e));
        return;
    }
    let mut failures = 0;
    while !stop.is_stopped() {
        match source.read_frame() {
            Ok(frame) => {
                failures = 0;
                if tx.blocking_send(SourceMsg::Frame(frame)).is_err() {
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                warn!("{}", Error::TransientReadFailure(e));
                if failures > policy.max_read_retries {
                    warn!("reconnecting to {}", source.description());
                    source.close();
                    if let Err(e) = connect(source.as_mut(), &policy, &tx, &stop) {
                        source.close();
                        let _ = tx.blocking_send(SourceMsg::Fatal(e));
                        return;
                    }
                    failures = 0;
                }
            }
        }
    }
    source.close();
    debug!("reader thread done");
}

/// Spawn the reader thread. It runs until `stop` is set, the receiver is
/// dropped or the source is declared unavailable, and closes the source
/// before exiting.
pub fn spawn_reader_thread(
    source: Box<dyn FrameSource>,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<SourceMsg>,
    stop: StopReader,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("frame-reader".into())
        .spawn(move || reader_thread_loop(source, policy, tx, stop))
}
