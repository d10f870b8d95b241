//! Pipeline driver
//!
//! The long-running loop: poll the capture directory, wait for rotated
//! files to go quiet, then run each one through dissect, session
//! aggregation, scoring and triage. One bad capture file is logged and
//! skipped; it never takes the loop down.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::constants::MIN_TRAINING_SESSIONS;
use crate::logic::capture;
use crate::logic::config::PipelineConfig;
use crate::logic::dissect::{self, DissectError};
use crate::logic::model::{ArtifactError, ModelArtifact};
use crate::logic::output::{self, OutputError, OutputPaths};
use crate::logic::scorer::{self, ScorerError};
use crate::logic::session::{self, SessionRecord};
use crate::logic::triage::{self, client::ReasoningService, TriageOptions};

#[derive(Debug)]
pub enum PipelineError {
    Dissect(DissectError),
    Scorer(ScorerError),
    Output(OutputError),
    Artifact(ArtifactError),
    Io(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dissect(e) => write!(f, "{}", e),
            Self::Scorer(e) => write!(f, "{}", e),
            Self::Output(e) => write!(f, "{}", e),
            Self::Artifact(e) => write!(f, "{}", e),
            Self::Io(e) => write!(f, "pipeline I/O error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<DissectError> for PipelineError {
    fn from(e: DissectError) -> Self {
        Self::Dissect(e)
    }
}

impl From<ScorerError> for PipelineError {
    fn from(e: ScorerError) -> Self {
        Self::Scorer(e)
    }
}

impl From<OutputError> for PipelineError {
    fn from(e: OutputError) -> Self {
        Self::Output(e)
    }
}

impl From<ArtifactError> for PipelineError {
    fn from(e: ArtifactError) -> Self {
        Self::Artifact(e)
    }
}

/// What one capture file produced.
#[derive(Debug, Default)]
pub struct ProcessSummary {
    pub sessions: usize,
    pub scored: usize,
    pub flagged: usize,
    pub analyzed: usize,
}

/// In-memory pipeline state. Capture files already handled are tracked
/// by name; rotation reuses names only after the loop has moved on.
#[derive(Debug, Default)]
pub struct PipelineState {
    processed: HashSet<String>,
    pub artifact: Option<ModelArtifact>,
}

impl PipelineState {
    pub fn seen(&self, path: &Path) -> bool {
        file_key(path).map(|k| self.processed.contains(&k)).unwrap_or(false)
    }

    pub fn record(&mut self, path: &Path) {
        if let Some(key) = file_key(path) {
            self.processed.insert(key);
        }
    }
}

fn file_key(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

pub struct PipelineDriver<S> {
    config: PipelineConfig,
    service: Arc<S>,
    state: PipelineState,
    stop: Arc<AtomicBool>,
}

impl<S> PipelineDriver<S>
where
    S: ReasoningService + Send + Sync + 'static,
{
    /// Build a driver, picking up a previously trained model artifact if
    /// one exists at the configured path.
    pub fn new(config: PipelineConfig, service: Arc<S>) -> Self {
        let mut state = PipelineState::default();
        if config.model_path.exists() {
            match ModelArtifact::load(&config.model_path) {
                Ok(artifact) => {
                    log::info!(
                        "loaded model artifact from {} (trained {})",
                        config.model_path.display(),
                        artifact.trained_at
                    );
                    state.artifact = Some(artifact);
                }
                Err(e) => log::warn!("ignoring unreadable model artifact: {}", e),
            }
        }
        Self {
            config,
            service,
            state,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle a signal handler can flip to wind the loop down.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Poll until stopped, then release the capture process if one is
    /// still recorded as running.
    pub async fn run(&mut self) {
        log::info!(
            "pipeline watching {} (poll every {:?})",
            self.config.capture_dir.display(),
            self.config.poll_interval
        );

        while !self.stop.load(Ordering::SeqCst) {
            self.poll_once().await;
            tokio::time::sleep(self.config.poll_interval).await;
        }

        log::info!("pipeline stopping");
        match capture::stop_capture(&self.config) {
            Ok(pid) => log::info!("released capture process {}", pid),
            Err(capture::CaptureError::NotRunning) => {}
            Err(e) => log::warn!("could not release capture process: {}", e),
        }
    }

    /// One pass over the capture directory. Returns how many files were
    /// fully processed this pass.
    pub async fn poll_once(&mut self) -> usize {
        let files = match capture::list_capture_files(&self.config.capture_dir) {
            Ok(files) => files,
            Err(e) => {
                log::warn!("capture directory scan failed: {}", e);
                return 0;
            }
        };

        let mut handled = 0;
        for path in files {
            if self.state.seen(&path) {
                continue;
            }
            if !wait_stable(&path, self.config.settle_interval).await {
                log::debug!("{} still being written, deferring", path.display());
                continue;
            }

            match self.process_file(&path).await {
                Ok(summary) => {
                    log::info!(
                        "{}: {} sessions, {} scored, {} flagged, {} analyzed",
                        path.display(),
                        summary.sessions,
                        summary.scored,
                        summary.flagged,
                        summary.analyzed
                    );
                    handled += 1;
                }
                Err(e) => {
                    // Skip the file rather than retry it every poll.
                    log::error!("failed to process {}: {}", path.display(), e);
                }
            }
            self.state.record(&path);
        }
        handled
    }

    /// Dissect, aggregate, score and triage one capture file.
    pub async fn process_file(&mut self, path: &Path) -> Result<ProcessSummary, PipelineError> {
        let packets = dissect::dissect_file(path)?;
        let sessions = session::build_sessions(&packets, self.config.diversity_window_secs);

        let paths = OutputPaths::for_capture(&self.config.output_dir, path);
        output::write_sessions(&paths.sessions, &sessions)?;

        let mut summary = ProcessSummary {
            sessions: sessions.len(),
            ..Default::default()
        };
        if sessions.is_empty() {
            log::info!("no sessions in {}, skipping scoring", path.display());
            return Ok(summary);
        }

        if self.state.artifact.is_none() {
            if sessions.len() < MIN_TRAINING_SESSIONS {
                log::info!(
                    "no model yet and only {} sessions ({} needed to train), deferring scoring",
                    sessions.len(),
                    MIN_TRAINING_SESSIONS
                );
                return Ok(summary);
            }
            let artifact = scorer::train(&sessions, self.config.contamination)?;
            artifact.save(&self.config.model_path)?;
            self.state.artifact = Some(artifact);
        }

        // artifact is always present past this point
        let Some(artifact) = self.state.artifact.as_ref() else {
            return Ok(summary);
        };

        let scored = scorer::score(&sessions, artifact)?;
        output::write_scored(&paths.scored, &scored)?;
        summary.scored = scored.len();
        summary.flagged = scored.iter().filter(|s| s.is_anomaly == 1).count();

        let mut by_score: Vec<&crate::logic::scorer::ScoredSession> = scored.iter().collect();
        by_score.sort_by(|a, b| b.anomaly_score.total_cmp(&a.anomaly_score));
        for s in by_score.iter().take(3).filter(|s| s.is_anomaly == 1) {
            log::info!(
                "anomaly {:.3}: {}:{} -> {}:{} ({}, {} bytes, {} pkts)",
                s.anomaly_score,
                s.session.src_ip,
                s.session.src_port,
                s.session.dst_ip,
                s.session.dst_port,
                s.session.protocol,
                s.session.total_bytes,
                s.session.packet_count
            );
        }

        let qualifying = scored
            .iter()
            .filter(|s| s.anomaly_score >= self.config.anomaly_threshold)
            .count();
        if qualifying == 0 {
            output::write_analysis(&paths.analysis, &[])?;
            return Ok(summary);
        }

        if !self.service.is_available().await {
            log::warn!(
                "reasoning service unreachable, skipping triage for {} sessions",
                qualifying
            );
            return Ok(summary);
        }

        let options = TriageOptions {
            anomaly_threshold: self.config.anomaly_threshold,
            workers: self.config.triage_workers,
            attempt_timeouts: self.config.attempt_timeouts.clone(),
        };
        let results = triage::triage_sessions(Arc::clone(&self.service), &scored, &options).await;
        output::write_analysis(&paths.analysis, &results)?;
        summary.analyzed = results.len();

        Ok(summary)
    }
}

/// Two matching (size, mtime) samples across the settle interval.
async fn wait_stable(path: &Path, settle: std::time::Duration) -> bool {
    let Ok(first) = capture::file_signature(path) else {
        return false;
    };
    tokio::time::sleep(settle).await;
    match capture::file_signature(path) {
        Ok(second) => first == second,
        Err(_) => false,
    }
}

/// Train a model from a previously written sessions document and persist
/// the artifact. Backs the `train` CLI command.
pub fn train_from_file(
    sessions_path: &Path,
    config: &PipelineConfig,
) -> Result<ModelArtifact, PipelineError> {
    let content = std::fs::read_to_string(sessions_path)
        .map_err(|e| PipelineError::Io(e.to_string()))?;
    let sessions: Vec<SessionRecord> =
        serde_json::from_str(&content).map_err(|e| PipelineError::Io(e.to_string()))?;

    let artifact = scorer::train(&sessions, config.contamination)?;
    artifact.save(&config.model_path)?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    use crate::logic::triage::client::TriageError;

    struct StubService;

    impl ReasoningService for StubService {
        async fn analyze(&self, _prompt: &str) -> Result<String, TriageError> {
            Ok(r#"{"status":"normal","reason":"stub","action":"none"}"#.to_string())
        }

        async fn is_available(&self) -> bool {
            false
        }
    }

    fn session(i: u64) -> SessionRecord {
        SessionRecord {
            src_ip: "10.0.0.1".to_string(),
            dst_ip: format!("10.0.1.{}", i % 20),
            src_port: 4000 + (i % 100) as u16,
            dst_port: 443,
            protocol: "tcp".to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            duration: 1.0 + (i % 10) as f64 * 0.2,
            total_bytes: 1_000 + (i % 7) * 40,
            packet_count: 10 + (i % 5),
            packets_per_second: 8.0,
            unique_destination_count: 1 + (i % 3),
        }
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            capture_dir: dir.join("captures"),
            output_dir: dir.join("analysis"),
            model_path: dir.join("model.json"),
            settle_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_tracks_files_by_name() {
        let mut state = PipelineState::default();
        let path = Path::new("/a/b/capture-1.pcap");

        assert!(!state.seen(path));
        state.record(path);
        assert!(state.seen(path));
        // Same name under a different parent is the same rotation slot.
        assert!(state.seen(Path::new("/other/capture-1.pcap")));
        assert!(!state.seen(Path::new("/a/b/capture-2.pcap")));
    }

    #[tokio::test]
    async fn test_wait_stable_on_quiet_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture-1.pcap");
        std::fs::write(&path, b"done").unwrap();

        assert!(wait_stable(&path, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_wait_stable_rejects_growing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture-1.pcap");
        std::fs::write(&path, b"partial").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            std::fs::write(&writer_path, b"partial plus more").unwrap();
        });

        assert!(!wait_stable(&path, Duration::from_millis(100)).await);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_stable_missing_file() {
        assert!(!wait_stable(Path::new("/nonexistent.pcap"), Duration::from_millis(5)).await);
    }

    #[test]
    fn test_driver_loads_existing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let sessions: Vec<SessionRecord> = (0..50).map(session).collect();
        let artifact = scorer::train(&sessions, 0.1).unwrap();
        artifact.save(&config.model_path).unwrap();

        let driver = PipelineDriver::new(config, Arc::new(StubService));
        assert!(driver.state.artifact.is_some());
    }

    #[test]
    fn test_driver_tolerates_corrupt_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(&config.model_path, "not json").unwrap();

        let driver = PipelineDriver::new(config, Arc::new(StubService));
        assert!(driver.state.artifact.is_none());
    }

    #[test]
    fn test_train_from_file_persists_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let sessions: Vec<SessionRecord> = (0..50).map(session).collect();
        let sessions_path = dir.path().join("batch_sessions.json");
        std::fs::write(&sessions_path, serde_json::to_string(&sessions).unwrap()).unwrap();

        let artifact = train_from_file(&sessions_path, &config).unwrap();
        assert!(config.model_path.exists());
        assert!(artifact.threshold.is_finite());
    }

    #[test]
    fn test_train_from_file_rejects_small_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let sessions: Vec<SessionRecord> = (0..3).map(session).collect();
        let sessions_path = dir.path().join("batch_sessions.json");
        std::fs::write(&sessions_path, serde_json::to_string(&sessions).unwrap()).unwrap();

        assert!(matches!(
            train_from_file(&sessions_path, &config),
            Err(PipelineError::Scorer(ScorerError::InsufficientData { .. }))
        ));
        assert!(!config.model_path.exists());
    }
}
