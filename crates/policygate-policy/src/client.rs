//! Policy engine client

use async_trait::async_trait;
use policygate_core::{DecisionRequest, Verdict};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::retry::RetryPolicy;
use crate::wire::{self, EngineQuery};

/// Anything that can turn a decision request into a verdict
#[async_trait]
pub trait PolicyClient: Send + Sync {
    /// Evaluate a decision request against the policy engine
    async fn evaluate(&self, request: &DecisionRequest) -> Result<Verdict, EngineError>;
}

/// Settings for [`OpaClient`]
#[derive(Debug, Clone)]
pub struct OpaClientConfig {
    /// Full URL of the decision document, e.g. `http://localhost:8181/v1/data/sdlc/governance/allow`
    pub url: String,

    /// Per-attempt timeout
    pub timeout: Duration,

    pub retry: RetryPolicy,
}

/// HTTP client for an OPA-style decision endpoint
pub struct OpaClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpaClient {
    /// Create a client; the endpoint is fixed for the client's lifetime
    pub fn new(config: OpaClientConfig) -> policygate_core::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| policygate_core::Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: config.url,
            timeout: config.timeout,
            retry: config.retry,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn attempt(&self, request: &DecisionRequest) -> Result<Verdict, EngineError> {
        let response = self
            .http
            .post(&self.url)
            .json(&EngineQuery { input: request })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        wire::parse_response(&body)
    }

    fn transport_error(&self, err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(self.timeout)
        } else {
            EngineError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl PolicyClient for OpaClient {
    async fn evaluate(&self, request: &DecisionRequest) -> Result<Verdict, EngineError> {
        let mut attempt = 1;

        loop {
            let start = Instant::now();
            let result = self.attempt(request).await;
            metrics::histogram!("policygate_engine_latency_us")
                .record(start.elapsed().as_micros() as f64);

            match result {
                Ok(verdict) => {
                    debug!(
                        action = %request.action,
                        allow = verdict.allow,
                        attempt,
                        "Policy engine answered"
                    );
                    return Ok(verdict);
                }
                Err(err) => {
                    let class = err.class();
                    metrics::counter!("policygate_engine_errors_total", "class" => class.as_str())
                        .increment(1);

                    if !err.is_retryable() || !self.retry.should_retry(attempt) {
                        return Err(err);
                    }

                    let delay = self.retry.backoff(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Policy engine call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
