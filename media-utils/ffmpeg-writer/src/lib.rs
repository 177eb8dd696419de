//! Encode raw RGB frames to a video file with an ffmpeg child process.
use std::{
    io::{Read, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
};

use machine_vision_formats::{ImageStride, pixel_format::RGB8};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg error ({})", output.status)]
    FfmpegError { output: std::process::Output },
    #[error("frame is {got_width}x{got_height}, writer expects {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
}

impl Error {
    /// The last line ffmpeg wrote to stderr, if this error came from ffmpeg.
    pub fn ffmpeg_message(&self) -> Option<String> {
        match self {
            Error::FfmpegError { output } => String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Codec selection and tuning passed to ffmpeg after the input.
#[derive(Debug, Clone, PartialEq)]
pub struct FfmpegCodecArgs {
    pub codec: String,
    pub preset: Option<String>,
    pub crf: Option<u32>,
    /// Any further output arguments, passed verbatim.
    pub extra: Vec<String>,
}

impl Default for FfmpegCodecArgs {
    fn default() -> Self {
        Self {
            codec: "libx264".into(),
            preset: Some("veryfast".into()),
            crf: Some(23),
            extra: vec![],
        }
    }
}

impl FfmpegCodecArgs {
    fn to_args(&self) -> Vec<String> {
        let mut args = zq(&["-c:v", &self.codec]);
        if let Some(preset) = &self.preset {
            args.extend(zq(&["-preset", preset]));
        }
        if let Some(crf) = self.crf {
            args.extend(["-crf".to_string(), crf.to_string()]);
        }
        args.extend(self.extra.iter().cloned());
        args
    }
}

/// A rectangle to keep, in input pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crop {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    /// Path or name of the ffmpeg executable.
    pub ffmpeg: String,
    /// Size of the frames given to [FfmpegWriter::write_frame].
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub crop: Option<Crop>,
    pub scale: Option<(u32, u32)>,
    pub codec_args: FfmpegCodecArgs,
}

fn prefix() -> Vec<String> {
    zq(&["-hide_banner", "-nostdin", "-nostats", "-loglevel", "error", "-y"])
}

fn zq(x: &[&str]) -> Vec<String> {
    x.iter().map(|x| String::from(*x)).collect()
}

impl WriterOptions {
    /// The `-vf` filter graph, if any filtering is needed.
    pub fn video_filter(&self) -> Option<String> {
        let mut filters = vec![];
        if let Some(c) = &self.crop {
            let full = c.x == 0 && c.y == 0 && c.width == self.width && c.height == self.height;
            if !full {
                filters.push(format!("crop={}:{}:{}:{}", c.width, c.height, c.x, c.y));
            }
        }
        if let Some((w, h)) = self.scale {
            filters.push(format!("scale={w}:{h}"));
        }
        if filters.is_empty() {
            None
        } else {
            Some(filters.join(","))
        }
    }

    fn args(&self, fname: &Path) -> Vec<String> {
        let mut args = prefix();
        args.extend(zq(&["-f", "rawvideo", "-pix_fmt", "rgb24"]));
        args.extend([
            "-s".to_string(),
            format!("{}x{}", self.width, self.height),
            "-framerate".to_string(),
            self.fps.to_string(),
        ]);
        args.extend(zq(&["-i", "-"]));
        if let Some(vf) = self.video_filter() {
            args.extend(["-vf".to_string(), vf]);
        }
        args.extend(self.codec_args.to_args());
        args.extend(zq(&["-pix_fmt", "yuv420p", "-movflags", "+faststart"]));
        args.push(fname.display().to_string());
        args
    }
}

/// Feeds frames to the stdin of an ffmpeg process encoding into one file.
///
/// Dropping the writer without calling [Self::close] kills ffmpeg, leaving an
/// incomplete file behind.
pub struct FfmpegWriter {
    ffmpeg_child: Option<Child>,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl FfmpegWriter {
    pub fn new<P: AsRef<Path>>(fname: P, opts: &WriterOptions) -> Result<Self> {
        let args = opts.args(fname.as_ref());
        tracing::debug!("spawning {} {}", opts.ffmpeg, args.join(" "));
        let mut ffmpeg_child = Command::new(&opts.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdin = ffmpeg_child.stdin.take();
        Ok(Self {
            ffmpeg_child: Some(ffmpeg_child),
            stdin,
            width: opts.width,
            height: opts.height,
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn write_frame<IM>(&mut self, frame: &IM) -> Result<()>
    where
        IM: ImageStride<RGB8>,
    {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(Error::FrameSize {
                width: self.width,
                height: self.height,
                got_width: frame.width(),
                got_height: frame.height(),
            });
        }
        let row_len = self.width as usize * 3;
        let stride = frame.stride();
        let data = frame.image_data();
        let result = match self.stdin.as_mut() {
            Some(stdin) if stride == row_len => {
                stdin.write_all(&data[..row_len * self.height as usize])
            }
            Some(stdin) => data
                .chunks(stride)
                .take(self.height as usize)
                .try_for_each(|row| stdin.write_all(&row[..row_len])),
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        };
        match result {
            Ok(()) => {
                self.frames_written += 1;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // Apparently ffmpeg died.
                Err(self.collect_output()?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn collect_output(&mut self) -> Result<Error> {
        self.stdin = None;
        let Some(mut ffmpeg_child) = self.ffmpeg_child.take() else {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        };
        let status = ffmpeg_child.wait()?;
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        if let Some(mut out) = ffmpeg_child.stdout.take() {
            out.read_to_end(&mut stdout)?;
        }
        if let Some(mut err) = ffmpeg_child.stderr.take() {
            err.read_to_end(&mut stderr)?;
        }
        let output = std::process::Output {
            status,
            stdout,
            stderr,
        };
        Ok(Error::FfmpegError { output })
    }

    /// Close stdin, telling ffmpeg to finish the file, and wait for it.
    pub fn close(mut self) -> Result<()> {
        self.stdin = None;
        let Some(ffmpeg_child) = self.ffmpeg_child.take() else {
            return Ok(());
        };
        let output = ffmpeg_child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::FfmpegError { output })
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        self.stdin = None;
        if let Some(mut ffmpeg_child) = self.ffmpeg_child.take() {
            let _ = ffmpeg_child.kill();
            let _ = ffmpeg_child.wait();
        }
    }
}
