use std::path::{Path, PathBuf};

use tracing::warn;

/// Decides whether a new recording may start.
pub trait StorageGate: Send {
    fn has_capacity(&self) -> bool;
}

/// Size and free space of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    /// Available to unprivileged users.
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 * 100.0 / self.total_bytes as f64
    }
}

#[cfg(unix)]
pub fn disk_usage(path: &Path) -> std::io::Result<DiskUsage> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is NUL terminated and `stat` is a valid out pointer.
    let stat = unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        stat
    };
    #[allow(clippy::unnecessary_cast)]
    let usage = DiskUsage {
        total_bytes: stat.f_blocks as u64 * stat.f_frsize as u64,
        available_bytes: stat.f_bavail as u64 * stat.f_frsize as u64,
    };
    Ok(usage)
}

#[cfg(not(unix))]
pub fn disk_usage(_path: &Path) -> std::io::Result<DiskUsage> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "disk usage query not supported on this platform",
    ))
}

/// Refuses new recordings when the output filesystem is nearly full.
pub struct DiskSpaceGate {
    path: PathBuf,
    min_free_bytes: u64,
    max_used_percent: f64,
}

impl DiskSpaceGate {
    pub fn new<P: Into<PathBuf>>(path: P, min_free_gb: f64, max_used_percent: f64) -> Self {
        Self {
            path: path.into(),
            min_free_bytes: (min_free_gb * 1e9) as u64,
            max_used_percent,
        }
    }
}

impl StorageGate for DiskSpaceGate {
    fn has_capacity(&self) -> bool {
        let usage = match disk_usage(&self.path) {
            Ok(usage) => usage,
            Err(e) => {
                warn!(
                    "cannot query free space of \"{}\": {e}",
                    self.path.display()
                );
                return true;
            }
        };
        if usage.available_bytes < self.min_free_bytes {
            warn!(
                "only {:.2} GB free on \"{}\", need {:.2} GB",
                usage.available_bytes as f64 / 1e9,
                self.path.display(),
                self.min_free_bytes as f64 / 1e9,
            );
            return false;
        }
        let used = usage.used_percent();
        if used > self.max_used_percent {
            warn!(
                "\"{}\" is {used:.1}% full, limit is {:.1}%",
                self.path.display(),
                self.max_used_percent
            );
            return false;
        }
        true
    }
}

/// Always grants capacity.
pub struct Unlimited;

impl StorageGate for Unlimited {
    fn has_capacity(&self) -> bool {
        true
    }
}
