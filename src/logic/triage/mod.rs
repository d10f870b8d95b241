//! Triage orchestrator
//!
//! Dispatches high-score sessions to the reasoning service with bounded
//! parallelism, escalating per-attempt timeouts and retry on
//! timeout/transport failures only. Every qualifying session ends in
//! exactly one `AnalysisResult` - succeeded, or degraded after the retry
//! budget is spent - and results come back in input order.

pub mod client;
pub mod repair;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::logic::scorer::ScoredSession;
use client::{ReasoningService, TriageError};

/// Structured verdict from the reasoning service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysis {
    /// normal | suspicious | degraded
    pub status: String,
    pub reason: String,
    pub action: String,
}

/// Terminal outcome for one dispatched session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub timestamp: DateTime<Utc>,
    pub session: ScoredSession,
    pub llm_analysis: LlmAnalysis,
    pub analysis_time_seconds: f64,
}

/// Knobs for one triage stage run.
#[derive(Debug, Clone)]
pub struct TriageOptions {
    /// Minimum anomaly score for dispatch
    pub anomaly_threshold: f64,
    /// Concurrent requests in flight
    pub workers: usize,
    /// Escalating per-attempt deadlines; length = max attempts
    pub attempt_timeouts: Vec<Duration>,
}

/// Dispatch qualifying sessions and gather one result each.
pub async fn triage_sessions<S>(
    service: Arc<S>,
    sessions: &[ScoredSession],
    options: &TriageOptions,
) -> Vec<AnalysisResult>
where
    S: ReasoningService + Send + Sync + 'static,
{
    let qualifying: Vec<ScoredSession> = sessions
        .iter()
        .filter(|s| s.anomaly_score >= options.anomaly_threshold)
        .cloned()
        .collect();

    log::info!(
        "triage: {} of {} sessions at or above score {:.2}",
        qualifying.len(),
        sessions.len(),
        options.anomaly_threshold
    );

    if qualifying.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
    let timeouts = Arc::new(options.attempt_timeouts.clone());
    let mut tasks: JoinSet<(usize, AnalysisResult)> = JoinSet::new();

    for (index, session) in qualifying.iter().cloned().enumerate() {
        let service = Arc::clone(&service);
        let semaphore = Arc::clone(&semaphore);
        let timeouts = Arc::clone(&timeouts);

        tasks.spawn(async move {
            // acquire_owned only fails if the semaphore is closed, which
            // never happens here; fall through to analysis regardless.
            let _permit = semaphore.acquire_owned().await.ok();
            let result = analyze_one(service.as_ref(), session, &timeouts).await;
            (index, result)
        });
    }

    let mut slots: Vec<Option<AnalysisResult>> = vec![None; qualifying.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => slots[index] = Some(result),
            Err(e) => log::error!("triage task failed to join: {}", e),
        }
    }

    // A crashed task must still account for its session.
    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.unwrap_or_else(|| degraded_result(qualifying[i].clone(), "task aborted", 0.0))
        })
        .collect()
}

/// Run the attempt loop for one session until a terminal outcome.
async fn analyze_one<S: ReasoningService>(
    service: &S,
    session: ScoredSession,
    timeouts: &[Duration],
) -> AnalysisResult {
    let prompt = build_prompt(&session);
    let started = Instant::now();
    let max_attempts = timeouts.len();
    let mut failure_class = String::from("no attempts configured");

    for (attempt, deadline) in timeouts.iter().enumerate() {
        let outcome = tokio::time::timeout(*deadline, service.analyze(&prompt)).await;

        match outcome {
            Err(_) => {
                failure_class = format!("timeout after {:?}", deadline);
                log::warn!(
                    "triage {}:{} -> {}:{} attempt {}/{} timed out ({:?})",
                    session.session.src_ip,
                    session.session.src_port,
                    session.session.dst_ip,
                    session.session.dst_port,
                    attempt + 1,
                    max_attempts,
                    deadline
                );
            }
            Ok(Err(TriageError::Timeout)) => {
                failure_class = "service-side timeout".to_string();
            }
            Ok(Err(TriageError::Transport(e))) => {
                failure_class = format!("transport failure: {}", e);
                log::warn!(
                    "triage attempt {}/{} transport failure: {}",
                    attempt + 1,
                    max_attempts,
                    e
                );
            }
            Ok(Err(other)) => {
                // Not a retryable class; terminal.
                return degraded_result(session, &other.to_string(), elapsed_secs(started));
            }
            Ok(Ok(raw)) => {
                // A response we managed to read is terminal either way:
                // parsed -> verdict, unparseable after repair -> degraded.
                return match repair::parse_analysis(&raw) {
                    Ok(llm_analysis) => AnalysisResult {
                        timestamp: Utc::now(),
                        session,
                        llm_analysis,
                        analysis_time_seconds: elapsed_secs(started),
                    },
                    Err(e) => {
                        log::warn!("triage response unparseable after repair: {}", e);
                        degraded_result(session, &e.to_string(), elapsed_secs(started))
                    }
                };
            }
        }
    }

    log::warn!(
        "triage exhausted {} attempts for {} -> {}: {}",
        max_attempts,
        session.session.src_ip,
        session.session.dst_ip,
        failure_class
    );
    degraded_result(
        session,
        &format!("{} attempts exhausted: {}", max_attempts, failure_class),
        elapsed_secs(started),
    )
}

fn degraded_result(session: ScoredSession, reason: &str, elapsed: f64) -> AnalysisResult {
    AnalysisResult {
        timestamp: Utc::now(),
        session,
        llm_analysis: LlmAnalysis {
            status: "degraded".to_string(),
            reason: reason.to_string(),
            action: String::new(),
        },
        analysis_time_seconds: elapsed,
    }
}

fn elapsed_secs(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 100.0).round() / 100.0
}

/// Session summary plus the strict-output instruction.
fn build_prompt(scored: &ScoredSession) -> String {
    let s = &scored.session;
    format!(
        "Analyze this network session and classify it.\n\
         \n\
         Return ONLY valid JSON. No explanations, no commentary.\n\
         \n\
         Session:\n\
         src={}:{}\n\
         dst={}:{}\n\
         protocol={}\n\
         bytes={}\n\
         packets={}\n\
         rate={:.3}\n\
         score={:.3}\n\
         \n\
         Output format (strict JSON):\n\
         {{\"status\": \"normal\" or \"suspicious\", \"reason\": \"short, one sentence\", \"action\": \"firewall or IDS recommendation\"}}",
        s.src_ip,
        s.src_port,
        s.dst_ip,
        s.dst_port,
        s.protocol,
        s.total_bytes,
        s.packet_count,
        s.packets_per_second,
        scored.anomaly_score,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::logic::session::SessionRecord;

    const VERDICT: &str =
        r#"{"status":"suspicious","reason":"high fan-out","action":"rate-limit source"}"#;

    fn scored(score: f64) -> ScoredSession {
        ScoredSession {
            session: SessionRecord {
                src_ip: "10.0.0.1".to_string(),
                dst_ip: "10.0.0.2".to_string(),
                src_port: 4000,
                dst_port: 80,
                protocol: "tcp".to_string(),
                first_seen: Utc::now(),
                last_seen: Utc::now(),
                duration: 1.0,
                total_bytes: 1000,
                packet_count: 10,
                packets_per_second: 10.0,
                unique_destination_count: 1,
            },
            anomaly_score: score,
            is_anomaly: u8::from(score >= 0.6),
        }
    }

    fn options(timeouts_ms: &[u64]) -> TriageOptions {
        TriageOptions {
            anomaly_threshold: 0.6,
            workers: 4,
            attempt_timeouts: timeouts_ms.iter().map(|&ms| Duration::from_millis(ms)).collect(),
        }
    }

    /// Hangs past every deadline for the first `slow_attempts` calls,
    /// then answers immediately.
    struct SlowService {
        slow_attempts: usize,
        calls: AtomicUsize,
        response: String,
    }

    impl SlowService {
        fn new(slow_attempts: usize, response: &str) -> Self {
            Self {
                slow_attempts,
                calls: AtomicUsize::new(0),
                response: response.to_string(),
            }
        }
    }

    impl ReasoningService for SlowService {
        async fn analyze(&self, _prompt: &str) -> Result<String, TriageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.slow_attempts {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(self.response.clone())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    /// Fails with a transport error for the first `failures` calls.
    struct FlakyService {
        failures: usize,
        calls: AtomicUsize,
    }

    impl ReasoningService for FlakyService {
        async fn analyze(&self, _prompt: &str) -> Result<String, TriageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(TriageError::Transport("connection reset".to_string()))
            } else {
                Ok(VERDICT.to_string())
            }
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_filter_and_input_order() {
        let service = Arc::new(SlowService::new(0, VERDICT));
        let sessions = vec![scored(0.85), scored(0.4), scored(0.7)];

        let results = triage_sessions(service, &sessions, &options(&[200])).await;

        assert_eq!(results.len(), 2, "only sessions at or above threshold dispatch");
        assert_eq!(results[0].session.anomaly_score, 0.85);
        assert_eq!(results[1].session.anomaly_score, 0.7);
        assert!(results.iter().all(|r| r.llm_analysis.status == "suspicious"));
    }

    #[tokio::test]
    async fn test_below_threshold_yields_nothing() {
        let service = Arc::new(SlowService::new(0, VERDICT));
        let results = triage_sessions(service, &[scored(0.4)], &options(&[200])).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let service = Arc::new(SlowService::new(2, VERDICT));
        let results =
            triage_sessions(Arc::clone(&service), &[scored(0.9)], &options(&[50, 100, 400])).await;

        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].llm_analysis.status, "suspicious");
    }

    #[tokio::test]
    async fn test_exhaustion_degrades_after_exact_attempts() {
        let service = Arc::new(SlowService::new(usize::MAX, VERDICT));
        let results =
            triage_sessions(Arc::clone(&service), &[scored(0.9)], &options(&[50, 100])).await;

        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].llm_analysis.status, "degraded");
        assert!(results[0].llm_analysis.action.is_empty());
        // Bounded by the two escalating deadlines plus overhead.
        assert!(results[0].analysis_time_seconds < 1.0);
    }

    #[tokio::test]
    async fn test_transport_failure_retries() {
        let service = Arc::new(FlakyService {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let results =
            triage_sessions(Arc::clone(&service), &[scored(0.9)], &options(&[50, 100])).await;

        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(results[0].llm_analysis.status, "suspicious");
    }

    #[tokio::test]
    async fn test_parse_failure_is_terminal_not_retried() {
        let service = Arc::new(SlowService::new(0, "I cannot classify this session."));
        let results =
            triage_sessions(Arc::clone(&service), &[scored(0.9)], &options(&[50, 100, 200])).await;

        assert_eq!(service.calls.load(Ordering::SeqCst), 1, "parse failures never retry");
        assert_eq!(results[0].llm_analysis.status, "degraded");
    }

    #[tokio::test]
    async fn test_fenced_response_parses() {
        let fenced = format!("```json\n{}\n```", VERDICT);
        let service = Arc::new(SlowService::new(0, &fenced));
        let results = triage_sessions(service, &[scored(0.9)], &options(&[200])).await;

        assert_eq!(results[0].llm_analysis.status, "suspicious");
        assert_eq!(results[0].llm_analysis.reason, "high fan-out");
    }

    #[tokio::test]
    async fn test_completeness_under_bounded_workers() {
        let service = Arc::new(SlowService::new(0, VERDICT));
        let sessions: Vec<ScoredSession> = (0..20).map(|_| scored(0.9)).collect();

        let mut opts = options(&[500]);
        opts.workers = 3;
        let results = triage_sessions(service, &sessions, &opts).await;

        assert_eq!(results.len(), 20, "one result per qualifying session");
    }
}
