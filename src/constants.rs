//! Central Configuration Constants
//!
//! Single source of truth for all pipeline defaults.
//! Every value can be overridden through the environment.

/// Default Ollama endpoint for the reasoning service
pub const DEFAULT_REASONING_URL: &str = "http://localhost:11434";

/// Default reasoning model identifier
pub const DEFAULT_REASONING_MODEL: &str = "qwen2:1.5b";

/// Expected anomalous fraction used to calibrate the outlier model
pub const DEFAULT_CONTAMINATION: f64 = 0.1;

/// Minimum anomaly score for a session to be dispatched to the reasoning service
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 0.6;

/// Per-attempt reasoning timeouts, escalating (seconds)
pub const DEFAULT_ATTEMPT_TIMEOUTS: [u64; 3] = [30, 90, 150];

/// Concurrent reasoning requests in flight
pub const DEFAULT_TRIAGE_WORKERS: usize = 4;

/// Capture directory polling interval (seconds)
pub const DEFAULT_POLL_INTERVAL: u64 = 5;

/// Interval between the two size samples of the stability check (milliseconds)
pub const DEFAULT_SETTLE_MILLIS: u64 = 1500;

/// Capture file rotation interval (seconds)
pub const DEFAULT_ROTATE_SECONDS: u64 = 60;

/// Number of rotating capture files kept on disk
pub const DEFAULT_ROTATE_FILES: u64 = 10;

/// Trailing window for destination-diversity tracking (seconds)
pub const DEFAULT_DIVERSITY_WINDOW: u64 = 600;

/// Minimum number of sessions required to train a model
pub const MIN_TRAINING_SESSIONS: usize = 10;

/// Capture interface
pub const DEFAULT_CAPTURE_INTERFACE: &str = "any";

// ============================================
// Helper functions to read from env with fallback
// ============================================

/// Get reasoning service URL from environment or use default
pub fn get_reasoning_url() -> String {
    std::env::var("NETTRIAGE_REASONING_URL")
        .unwrap_or_else(|_| DEFAULT_REASONING_URL.to_string())
}

/// Get reasoning model identifier from environment or use default
pub fn get_reasoning_model() -> String {
    std::env::var("NETTRIAGE_REASONING_MODEL")
        .unwrap_or_else(|_| DEFAULT_REASONING_MODEL.to_string())
}

/// Get anomaly threshold from environment or use default
pub fn get_anomaly_threshold() -> f64 {
    std::env::var("NETTRIAGE_ANOMALY_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_ANOMALY_THRESHOLD)
}

/// Get contamination rate from environment or use default
pub fn get_contamination() -> f64 {
    std::env::var("NETTRIAGE_CONTAMINATION")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_CONTAMINATION)
}

/// Get the working directory for captures, artifacts and results
pub fn get_work_dir() -> std::path::PathBuf {
    std::env::var("NETTRIAGE_WORK_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_local_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join("nettriage")
        })
}

/// Get capture interface from environment or use default
pub fn get_capture_interface() -> String {
    std::env::var("NETTRIAGE_CAPTURE_INTERFACE")
        .unwrap_or_else(|_| DEFAULT_CAPTURE_INTERFACE.to_string())
}
