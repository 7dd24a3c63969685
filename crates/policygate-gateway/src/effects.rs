//! Downstream side effects run after an enforcement decision
//!
//! Allowed source-control changes refresh the search index and notify agents.
//! Denied requests get a violation comment (source control only) and an audit
//! record. Hooks without a configured URL only log.

use async_trait::async_trait;
use policygate_core::DecisionRequest;
use policygate_telemetry::{AuditError, AuditEvent, AuditLog, AuditSeverity};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Everything an effect needs to know about the decision it follows
#[derive(Debug, Clone, Serialize)]
pub struct EffectContext {
    /// Key shared by every effect of one event
    pub idempotency_key: String,

    /// `registration` or `source_control`
    pub event_kind: &'static str,

    pub decision: Decision,

    pub request: DecisionRequest,

    /// Denial reasons; empty for allowed decisions
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied,
}

/// Side effect failures
#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error("hook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hook returned HTTP {0}")]
    Status(u16),

    #[error("audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error("effect timed out")]
    Timeout,
}

/// A single downstream action
#[async_trait]
pub trait SideEffect: Send + Sync {
    /// Stable name, used for idempotency and metric labels
    fn name(&self) -> &'static str;

    /// Whether this effect runs for the given decision
    fn applies_to(&self, _ctx: &EffectContext) -> bool {
        true
    }

    async fn run(&self, ctx: &EffectContext) -> Result<(), EffectError>;
}

/// Which events a hook fires for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookScope {
    Any,
    SourceControlOnly,
}

/// Effect that POSTs the decision to an HTTP hook
pub struct HookEffect {
    name: &'static str,
    url: Option<String>,
    scope: HookScope,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct HookEnvelope<'a> {
    effect: &'static str,
    #[serde(flatten)]
    context: &'a EffectContext,
}

impl HookEffect {
    pub fn new(name: &'static str, url: Option<String>, scope: HookScope, http: reqwest::Client) -> Self {
        Self {
            name,
            url,
            scope,
            http,
        }
    }

    /// Search index refresh after an allowed change
    pub fn index_refresh(url: Option<String>, http: reqwest::Client) -> Self {
        Self::new("index_refresh", url, HookScope::SourceControlOnly, http)
    }

    /// Agent notification after an allowed change
    pub fn agent_notify(url: Option<String>, http: reqwest::Client) -> Self {
        Self::new("agent_notify", url, HookScope::SourceControlOnly, http)
    }

    /// Violation comment on the offending pull request
    pub fn pr_comment(url: Option<String>, http: reqwest::Client) -> Self {
        Self::new("pr_comment", url, HookScope::SourceControlOnly, http)
    }
}

#[async_trait]
impl SideEffect for HookEffect {
    fn name(&self) -> &'static str {
        self.name
    }

    fn applies_to(&self, ctx: &EffectContext) -> bool {
        match self.scope {
            HookScope::Any => true,
            HookScope::SourceControlOnly => ctx.event_kind == "source_control",
        }
    }

    async fn run(&self, ctx: &EffectContext) -> Result<(), EffectError> {
        let Some(url) = self.url.as_deref() else {
            info!(
                effect = self.name,
                key = %ctx.idempotency_key,
                resource = %ctx.request.resource_id(),
                "No hook configured, recorded to log only"
            );
            return Ok(());
        };

        let response = self
            .http
            .post(url)
            .header("Idempotency-Key", &ctx.idempotency_key)
            .json(&HookEnvelope {
                effect: self.name,
                context: ctx,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EffectError::Status(response.status().as_u16()));
        }

        info!(effect = self.name, key = %ctx.idempotency_key, "Hook notified");
        Ok(())
    }
}

/// Effect that writes denied decisions to the audit trail
pub struct AuditEffect {
    log: Arc<AuditLog>,
}

impl AuditEffect {
    pub fn new(log: Arc<AuditLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl SideEffect for AuditEffect {
    fn name(&self) -> &'static str {
        "audit_record"
    }

    fn applies_to(&self, ctx: &EffectContext) -> bool {
        ctx.decision == Decision::Denied
    }

    async fn run(&self, ctx: &EffectContext) -> Result<(), EffectError> {
        let event = AuditEvent::new("decision_denied", &ctx.idempotency_key)
            .with_severity(AuditSeverity::Warning)
            .with_data(serde_json::json!({
                "event_kind": ctx.event_kind,
                "action": ctx.request.action,
                "actor": ctx.request.actor,
                "resource": ctx.request.resource,
                "reasons": ctx.reasons,
                "request_fingerprint": ctx.request.fingerprint().ok(),
            }));

        let chained = self.log.record(event)?;
        info!(
            key = %ctx.idempotency_key,
            hash = chained.hash.as_deref().unwrap_or_default(),
            "Audit record written"
        );
        Ok(())
    }
}
