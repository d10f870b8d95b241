//! Capture control
//!
//! Owns the tcpdump child process: rotated capture files in the capture
//! directory, a pidfile so start/stop work across invocations, and the
//! directory scan the pipeline polls.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::SystemTime;

use crate::logic::config::PipelineConfig;

#[derive(Debug)]
pub enum CaptureError {
    /// tcpdump is not on PATH
    ToolMissing,
    SpawnFailed(String),
    Io(String),
    /// Stop requested but no capture is recorded as running
    NotRunning,
    AlreadyRunning(u32),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolMissing => write!(f, "tcpdump not found on PATH"),
            Self::SpawnFailed(e) => write!(f, "failed to spawn tcpdump: {}", e),
            Self::Io(e) => write!(f, "capture I/O error: {}", e),
            Self::NotRunning => write!(f, "no capture is running"),
            Self::AlreadyRunning(pid) => write!(f, "capture already running (pid {})", pid),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Probe for tcpdump without starting a capture.
pub fn check_available() -> bool {
    Command::new("tcpdump")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Start a rotated capture and record its pid. Fails if one is already
/// running according to the pidfile.
pub fn start_capture(config: &PipelineConfig) -> Result<u32, CaptureError> {
    if let Some(pid) = running_pid(&config.pidfile()) {
        return Err(CaptureError::AlreadyRunning(pid));
    }

    std::fs::create_dir_all(&config.capture_dir).map_err(|e| CaptureError::Io(e.to_string()))?;
    let pattern = config.capture_dir.join("capture-%Y%m%d%H%M%S.pcap");

    let child = Command::new("tcpdump")
        .arg("-i")
        .arg(&config.capture_interface)
        .arg("-G")
        .arg(config.rotate_seconds.to_string())
        .arg("-W")
        .arg(config.rotate_files.to_string())
        .arg("-w")
        .arg(&pattern)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::ToolMissing
            } else {
                CaptureError::SpawnFailed(e.to_string())
            }
        })?;

    let pid = child.id();
    std::fs::write(config.pidfile(), pid.to_string())
        .map_err(|e| CaptureError::Io(e.to_string()))?;
    log::info!(
        "capture started on '{}' (pid {}, rotate {}s x{})",
        config.capture_interface,
        pid,
        config.rotate_seconds,
        config.rotate_files
    );
    Ok(pid)
}

/// Stop the recorded capture process and clear the pidfile.
pub fn stop_capture(config: &PipelineConfig) -> Result<u32, CaptureError> {
    let pidfile = config.pidfile();
    let pid = running_pid(&pidfile).ok_or(CaptureError::NotRunning)?;

    let status = Command::new("kill")
        .arg(pid.to_string())
        .status()
        .map_err(|e| CaptureError::Io(e.to_string()))?;
    if !status.success() {
        return Err(CaptureError::Io(format!("kill {} failed", pid)));
    }

    std::fs::remove_file(&pidfile).map_err(|e| CaptureError::Io(e.to_string()))?;
    log::info!("capture stopped (pid {})", pid);
    Ok(pid)
}

/// Pid from the pidfile, but only if that process still exists.
pub fn running_pid(pidfile: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(pidfile).ok()?;
    let pid: u32 = content.trim().parse().ok()?;
    if Path::new("/proc").join(pid.to_string()).exists() {
        Some(pid)
    } else {
        None
    }
}

/// Capture files in the directory, name-sorted so rotation order holds.
pub fn list_capture_files(dir: &Path) -> Result<Vec<PathBuf>, CaptureError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| CaptureError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().map(|e| e == "pcap").unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// (size, mtime) pair; two matching signatures across a settle interval
/// mean tcpdump has rotated away from the file.
pub fn file_signature(path: &Path) -> std::io::Result<(u64, SystemTime)> {
    let meta = std::fs::metadata(path)?;
    Ok((meta.len(), meta.modified()?))
}
