//! Pipeline configuration
//!
//! Every tunable of the pipeline in one place. Defaults come from
//! `constants` (which reads the environment), so `PipelineConfig::default()`
//! is the configuration a plain `nettriage start` runs with.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants;

/// Configuration for a pipeline instance
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory the capture process writes rotating pcap files into
    pub capture_dir: PathBuf,
    /// Directory session/scored/analysis artifacts are written into
    pub output_dir: PathBuf,
    /// Path of the persisted model artifact
    pub model_path: PathBuf,
    /// Expected anomalous fraction when training
    pub contamination: f64,
    /// Minimum anomaly score for triage dispatch
    pub anomaly_threshold: f64,
    /// Reasoning service endpoint
    pub reasoning_url: String,
    /// Reasoning model identifier
    pub reasoning_model: String,
    /// Escalating per-attempt timeouts; length is the max attempt count
    pub attempt_timeouts: Vec<Duration>,
    /// Concurrent reasoning requests in flight
    pub triage_workers: usize,
    /// Capture directory polling interval
    pub poll_interval: Duration,
    /// Delay between the two size samples of the stability check
    pub settle_interval: Duration,
    /// Capture rotation interval (seconds, passed to the capture process)
    pub rotate_seconds: u64,
    /// Number of rotating capture files
    pub rotate_files: u64,
    /// Trailing window for destination-diversity tracking (seconds)
    pub diversity_window_secs: f64,
    /// Interface the capture process listens on
    pub capture_interface: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let work_dir = constants::get_work_dir();
        Self {
            capture_dir: work_dir.join("captures"),
            output_dir: work_dir.join("analysis"),
            model_path: work_dir.join("model.json"),
            contamination: constants::get_contamination(),
            anomaly_threshold: constants::get_anomaly_threshold(),
            reasoning_url: constants::get_reasoning_url(),
            reasoning_model: constants::get_reasoning_model(),
            attempt_timeouts: constants::DEFAULT_ATTEMPT_TIMEOUTS
                .iter()
                .map(|&s| Duration::from_secs(s))
                .collect(),
            triage_workers: constants::DEFAULT_TRIAGE_WORKERS,
            poll_interval: Duration::from_secs(constants::DEFAULT_POLL_INTERVAL),
            settle_interval: Duration::from_millis(constants::DEFAULT_SETTLE_MILLIS),
            rotate_seconds: constants::DEFAULT_ROTATE_SECONDS,
            rotate_files: constants::DEFAULT_ROTATE_FILES,
            diversity_window_secs: constants::DEFAULT_DIVERSITY_WINDOW as f64,
            capture_interface: constants::get_capture_interface(),
        }
    }
}

impl PipelineConfig {
    /// Maximum reasoning attempts per session
    pub fn max_attempts(&self) -> usize {
        self.attempt_timeouts.len()
    }

    /// Path of the pidfile the capture process is tracked through
    pub fn pidfile(&self) -> PathBuf {
        self.capture_dir.join("capture.pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let config = PipelineConfig::default();
        assert!(config.contamination > 0.0 && config.contamination < 1.0);
        assert!(config.anomaly_threshold >= 0.0 && config.anomaly_threshold <= 1.0);
        assert_eq!(config.max_attempts(), config.attempt_timeouts.len());
        assert!(config.triage_workers > 0);
    }

    #[test]
    fn test_timeouts_escalate() {
        let config = PipelineConfig::default();
        for pair in config.attempt_timeouts.windows(2) {
            assert!(pair[0] < pair[1], "attempt timeouts must escalate");
        }
    }
}
