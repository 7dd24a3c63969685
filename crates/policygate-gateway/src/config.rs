//! Gateway configuration

use policygate_core::{Error, Result};
use policygate_policy::{OpaClientConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cli::Cli;

/// Gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub webhook: WebhookSettings,

    #[serde(default)]
    pub orchestration: OrchestrationSettings,

    #[serde(default)]
    pub audit: AuditSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl GatewayConfig {
    /// Load configuration from file and CLI overrides
    pub fn load(config_path: &str, cli: &Cli) -> anyhow::Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            serde_yaml::from_str(&content)?
        } else {
            Self::default()
        };

        if let Some(url) = &cli.engine_url {
            config.engine.url = Some(url.clone());
        }

        if let Some(secret) = &cli.webhook_secret {
            config.webhook.secret = Some(secret.clone());
        }

        if let Some(listen) = &cli.listen {
            config.server.listen = listen.clone();
        }

        if let Some(port) = cli.port {
            config.server.port = port;
        }

        Ok(config)
    }

    /// Check every URL and resolve the policy client settings
    ///
    /// Fails when no engine URL is configured; the gateway must not serve
    /// traffic it cannot enforce.
    pub fn validate(&self) -> Result<OpaClientConfig> {
        let engine_url = match self.engine.url.as_deref() {
            Some(url) if !url.trim().is_empty() => validate_endpoint_url(url, "engine.url")?,
            _ => {
                return Err(Error::config(
                    "engine.url is required (set it in the config file, --engine-url or OPA_URL)",
                ))
            }
        };

        for (field, url) in self.orchestration.hook_urls() {
            if let Some(url) = url {
                validate_endpoint_url(url, field)?;
            }
        }

        if self.engine.timeout_ms == 0 {
            return Err(Error::config("engine.timeout_ms must be greater than zero"));
        }

        Ok(OpaClientConfig {
            url: engine_url.to_string(),
            timeout: Duration::from_millis(self.engine.timeout_ms),
            retry: RetryPolicy::new(
                self.engine.max_attempts,
                Duration::from_millis(self.engine.base_backoff_ms),
            ),
        })
    }
}

/// Policy engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Decision endpoint, e.g. `http://localhost:8181/v1/data/sdlc/governance/allow`
    #[serde(default)]
    pub url: Option<String>,

    /// Per-attempt timeout
    #[serde(default = "default_engine_timeout_ms")]
    pub timeout_ms: u64,

    /// Total attempts for transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_engine_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_engine_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_engine_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Shared secret for `X-Hub-Signature-256`; unsigned deliveries are accepted when unset
    #[serde(default)]
    pub secret: Option<String>,
}

/// Side-effect dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSettings {
    /// Hook notified to refresh the search index after an allowed change
    #[serde(default)]
    pub index_refresh_url: Option<String>,

    /// Hook notified so agents pick up an allowed change
    #[serde(default)]
    pub agent_notify_url: Option<String>,

    /// Hook that posts a violation comment on the pull request
    #[serde(default)]
    pub pr_comment_url: Option<String>,

    #[serde(default = "default_effect_timeout_ms")]
    pub effect_timeout_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_effect_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Outbox capacity; enqueueing fails once it is full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of completed (event, effect) pairs remembered for deduplication
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,

    /// Jobs whose effects may run at the same time
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl OrchestrationSettings {
    fn hook_urls(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("orchestration.index_refresh_url", self.index_refresh_url.as_deref()),
            ("orchestration.agent_notify_url", self.agent_notify_url.as_deref()),
            ("orchestration.pr_comment_url", self.pr_comment_url.as_deref()),
        ]
    }
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            index_refresh_url: None,
            agent_notify_url: None,
            pr_comment_url: None,
            effect_timeout_ms: default_effect_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_effect_backoff_ms(),
            queue_capacity: default_queue_capacity(),
            dedupe_window: default_dedupe_window(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSettings {
    /// JSON-lines file receiving audit events; in memory only when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Parse an outbound endpoint; only http(s) URLs with a host are accepted
pub fn validate_endpoint_url(raw: &str, field: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::config(format!("{}: invalid URL: {}", field, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::config(format!(
                "{}: URL scheme '{}' is not allowed",
                field, scheme
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::config(format!("{}: URL must have a host", field)));
    }

    Ok(url)
}

fn default_engine_timeout_ms() -> u64 {
    2_000
}

fn default_engine_backoff_ms() -> u64 {
    50
}

fn default_max_attempts() -> u32 {
    3
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_effect_timeout_ms() -> u64 {
    5_000
}

fn default_effect_backoff_ms() -> u64 {
    200
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_dedupe_window() -> usize {
    4096
}

fn default_max_concurrent_jobs() -> usize {
    16
}
