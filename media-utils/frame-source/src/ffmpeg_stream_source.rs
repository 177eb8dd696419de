use std::{
    io::{BufRead, BufReader, Read},
    process::{Child, ChildStdout, Command, Stdio},
};

use chrono::Local;
use machine_vision_formats::owned::OImage;
use tracing::{debug, warn};

use crate::{Error, Frame, FrameSource, Result, SourceSettings};

/// Decodes a network stream (RTMP, RTSP, HTTP, or a file) with an ffmpeg
/// child process which writes raw RGB frames to its stdout.
///
/// ffmpeg also resamples the stream to the configured size and frame rate, so
/// every frame has the same dimensions.
pub struct FfmpegStreamSource {
    settings: SourceSettings,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_thread: Option<std::thread::JoinHandle<()>>,
    fno: u64,
}

impl FfmpegStreamSource {
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            settings: settings.clone(),
            child: None,
            stdout: None,
            stderr_thread: None,
            fno: 0,
        }
    }

    fn args(&self) -> Vec<String> {
        let s = &self.settings;
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "error"]
            .iter()
            .map(|x| x.to_string())
            .collect();
        if s.url.starts_with("rtsp://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend([
            "-i".into(),
            s.url.clone(),
            "-an".into(),
            "-vf".into(),
            format!("fps={},scale={}:{}", s.fps, s.width, s.height),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-f".into(),
            "rawvideo".into(),
            "pipe:1".into(),
        ]);
        args
    }

    fn frame_size(&self) -> usize {
        self.settings.width as usize * self.settings.height as usize * 3
    }

    /// Wait for the exited child and describe how it ended.
    fn reap(&mut self) -> String {
        self.stdout = None;
        let status = match self.child.take() {
            Some(mut child) => match child.wait() {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            },
            None => "not running".to_string(),
        };
        if let Some(jh) = self.stderr_thread.take() {
            let _ = jh.join();
        }
        status
    }
}

impl FrameSource for FfmpegStreamSource {
    fn width(&self) -> u32 {
        self.settings.width
    }

    fn height(&self) -> u32 {
        self.settings.height
    }

    fn nominal_fps(&self) -> f64 {
        self.settings.fps
    }

    fn description(&self) -> String {
        format!("ffmpeg stream {}", self.settings.url)
    }

    fn open(&mut self) -> Result<()> {
        self.close();
        let args = self.args();
        debug!("spawning {} {}", self.settings.ffmpeg, args.join(" "));
        let mut child = Command::new(&self.settings.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().ok_or(Error::NotOpen)?;

        // Drain stderr so ffmpeg never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let url = self.settings.url.clone();
            let jh = std::thread::Builder::new()
                .name("ffmpeg-source-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        match line {
                            Ok(line) => warn!("ffmpeg ({url}): {line}"),
                            Err(_) => break,
                        }
                    }
                })?;
            self.stderr_thread = Some(jh);
        }
        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let size = self.frame_size();
        let stdout = self.stdout.as_mut().ok_or(Error::NotOpen)?;
        let mut buf = vec![0u8; size];
        match stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let status = self.reap();
                return Err(Error::StreamEnded { status });
            }
            Err(e) => return Err(e.into()),
        }
        let timestamp = Local::now();
        let stride = self.settings.width as usize * 3;
        let image = OImage::new(self.settings.width, self.settings.height, stride, buf)
            .ok_or(Error::InvalidSize(self.settings.width, self.settings.height))?;
        let frame = Frame::new(self.fno, timestamp, image);
        self.fno += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        self.stdout = None;
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill() {
                debug!("killing ffmpeg: {e}");
            }
        }
        self.reap();
    }
}

impl Drop for FfmpegStreamSource {
    fn drop(&mut self) {
        self.close();
    }
}
