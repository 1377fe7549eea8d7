//! Shared JSON-over-HTTP call with timeout, retry and backoff.
//!
//! Used by every networked embedding and generation provider.
//!
//! # Retry Strategy
//!
//! - HTTP 408, 429 and 5xx → transient, retry
//! - HTTP 429 with `insufficient_quota` → terminal, fail immediately
//! - Other 4xx (bad key, malformed input, content policy) → terminal
//! - Network errors and timeouts → transient, retry
//! - Backoff: `backoff`, 2×, 4×, ... capped at 32× and at [`MAX_RETRY_DELAY`]

use std::time::Duration;

use manual_copilot_core::{FailureKind, RagError};

/// Longest wait between two attempts, whatever the configured backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Which capability a call belongs to, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Embedding,
    Generation,
}

impl Service {
    pub fn error(self, kind: FailureKind, message: impl Into<String>) -> RagError {
        let message = message.into();
        match self {
            Service::Embedding => RagError::EmbeddingService { kind, message },
            Service::Generation => RagError::GenerationService { kind, message },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64, timeout_secs: u64) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_millis(backoff_ms),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        self.backoff.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    match status {
        429 if body.contains("insufficient_quota") => FailureKind::Terminal,
        408 | 429 => FailureKind::Transient,
        s if s >= 500 => FailureKind::Transient,
        _ => FailureKind::Terminal,
    }
}

/// A reqwest client with the policy's per-request timeout.
pub fn build_client(service: Service, policy: &RetryPolicy) -> Result<reqwest::Client, RagError> {
    reqwest::Client::builder()
        .timeout(policy.timeout)
        .build()
        .map_err(|e| service.error(FailureKind::Terminal, format!("failed to build HTTP client: {e}")))
}

/// POST `body` to `url` and return the parsed JSON response.
pub async fn post_json(
    client: &reqwest::Client,
    service: Service,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    policy: &RetryPolicy,
) -> Result<serde_json::Value, RagError> {
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            tracing::debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        service.error(FailureKind::Terminal, format!("invalid JSON from {url}: {e}"))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let kind = classify_status(status.as_u16(), &body_text);
                let err = service.error(kind, format!("{url} returned {status}: {body_text}"));
                if kind == FailureKind::Terminal {
                    return Err(err);
                }
                tracing::warn!(url, attempt, status = status.as_u16(), "transient service error");
                last_err = Some(err);
            }
            Err(e) => {
                tracing::warn!(url, attempt, error = %e, "service unreachable");
                last_err = Some(service.error(
                    FailureKind::Transient,
                    format!("request to {url} failed: {e}"),
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        service.error(FailureKind::Transient, format!("{url} failed after retries"))
    }))
}
