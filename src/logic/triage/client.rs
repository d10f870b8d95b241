//! Reasoning service client
//!
//! HTTP client for the external reasoning endpoint (Ollama). The
//! orchestrator talks to the `ReasoningService` trait so tests can swap
//! in simulated endpoints; per-attempt deadlines are enforced by the
//! caller, not here.

use std::future::Future;

use serde::{Deserialize, Serialize};

/// Errors a triage attempt can end with.
#[derive(Debug, Clone)]
pub enum TriageError {
    /// The attempt deadline elapsed
    Timeout,
    /// Connection-level failure talking to the service
    Transport(String),
    /// The service is not reachable at all (pre-flight probe failed)
    Unavailable(String),
    /// The response could not be parsed, even after repair
    Parse(String),
}

impl std::fmt::Display for TriageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "reasoning service timeout"),
            Self::Transport(e) => write!(f, "transport failure: {}", e),
            Self::Unavailable(e) => write!(f, "reasoning service unavailable: {}", e),
            Self::Parse(e) => write!(f, "unparseable response: {}", e),
        }
    }
}

impl std::error::Error for TriageError {}

/// Seam between the orchestrator and the reasoning endpoint.
pub trait ReasoningService {
    /// Send one prompt and return the raw response text.
    fn analyze(&self, prompt: &str) -> impl Future<Output = Result<String, TriageError>> + Send;

    /// Cheap reachability probe, called once before a triage stage runs.
    fn is_available(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Production client for an Ollama-compatible endpoint.
pub struct OllamaClient {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        // No client-side timeout: the orchestrator owns the escalating
        // per-attempt deadlines.
        let http_client = reqwest::Client::new();
        Self {
            base_url,
            model,
            http_client,
        }
    }
}

impl ReasoningService for OllamaClient {
    async fn analyze(&self, prompt: &str) -> Result<String, TriageError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TriageError::Timeout
                } else {
                    TriageError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(TriageError::Transport(format!(
                "server returned {}",
                response.status().as_u16()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| TriageError::Transport(e.to_string()))?;
        Ok(body.response)
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.http_client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log::warn!("reasoning service probe failed: {}", e);
                false
            }
        }
    }
}
