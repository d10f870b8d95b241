//! Stage output writers
//!
//! Every stage publishes its result as one JSON document next to the
//! others for the same capture file. Writes go through a temp file and
//! a rename so a reader never observes a half-written document.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::logic::scorer::ScoredSession;
use crate::logic::session::SessionRecord;
use crate::logic::triage::AnalysisResult;

#[derive(Debug)]
pub enum OutputError {
    Io(String),
    Encode(String),
}

impl std::fmt::Display for OutputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "output I/O error: {}", e),
            Self::Encode(e) => write!(f, "output encode error: {}", e),
        }
    }
}

impl std::error::Error for OutputError {}

/// Where the three stage documents for one capture file land.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub sessions: PathBuf,
    pub scored: PathBuf,
    pub analysis: PathBuf,
}

impl OutputPaths {
    /// Derive output paths from a capture file name. `capture-x.pcap`
    /// becomes `capture-x_sessions.json` and friends under `output_dir`.
    pub fn for_capture(output_dir: &Path, capture_path: &Path) -> Self {
        let stem = capture_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("capture");
        Self {
            sessions: output_dir.join(format!("{}_sessions.json", stem)),
            scored: output_dir.join(format!("{}_scored.json", stem)),
            analysis: output_dir.join(format!("{}_analysis.json", stem)),
        }
    }
}

pub fn write_sessions(path: &Path, sessions: &[SessionRecord]) -> Result<(), OutputError> {
    write_json_atomic(path, sessions)?;
    log::info!("wrote {} sessions to {}", sessions.len(), path.display());
    Ok(())
}

pub fn write_scored(path: &Path, scored: &[ScoredSession]) -> Result<(), OutputError> {
    write_json_atomic(path, scored)?;
    log::info!("wrote {} scored sessions to {}", scored.len(), path.display());
    Ok(())
}

pub fn write_analysis(path: &Path, results: &[AnalysisResult]) -> Result<(), OutputError> {
    write_json_atomic(path, results)?;
    log::info!("wrote {} analysis results to {}", results.len(), path.display());
    Ok(())
}

/// Serialize into a sibling temp file, then rename over the target.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), OutputError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| OutputError::Io(e.to_string()))?;
    }

    let json =
        serde_json::to_string_pretty(value).map_err(|e| OutputError::Encode(e.to_string()))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, json).map_err(|e| OutputError::Io(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| OutputError::Io(e.to_string()))
}
