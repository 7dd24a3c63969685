//! Core types for PolicyGate
//!
//! Inbound events arrive as one of two shapes and are normalized into a single
//! [`DecisionRequest`] before they reach the policy engine. The engine's answer
//! is held as a [`Verdict`], and the pipeline ends with an
//! [`EnforcementOutcome`] that the HTTP layer turns into a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Action name submitted for template registrations
pub const REGISTER_TEMPLATE_ACTION: &str = "register_template";

/// Action used for source-control events that carry no `action` field
pub const DEFAULT_SCM_ACTION: &str = "updated";

/// Reason substituted when the engine denies without saying why
pub const DEFAULT_DENY_REASON: &str = "Policy denied";

/// A raw inbound trigger
#[derive(Debug, Clone)]
pub enum Event {
    /// API template registration call
    Registration(RegistrationEvent),

    /// Source-control webhook delivery
    SourceControl(SourceControlEvent),
}

impl Event {
    /// Short name of the event flavor, used in logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Registration(_) => "registration",
            Event::SourceControl(_) => "source_control",
        }
    }

    /// Delivery identifier supplied by the sender, if any
    pub fn delivery_id(&self) -> Option<&str> {
        match self {
            Event::Registration(_) => None,
            Event::SourceControl(scm) => scm.delivery_id.as_deref(),
        }
    }

    pub fn is_source_control(&self) -> bool {
        matches!(self, Event::SourceControl(_))
    }
}

/// Body of a template registration request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationEvent {
    #[serde(default)]
    pub actor: Option<String>,

    /// Template being registered; passed to the engine verbatim
    #[serde(default)]
    pub template: Option<Value>,
}

impl RegistrationEvent {
    pub fn new(actor: impl Into<String>, template: impl Into<Value>) -> Self {
        Self {
            actor: Some(actor.into()),
            template: Some(template.into()),
        }
    }
}

/// A source-control webhook delivery
#[derive(Debug, Clone, Default)]
pub struct SourceControlEvent {
    /// Event name from the `X-GitHub-Event` header
    pub event_name: Option<String>,

    /// Delivery id from the `X-GitHub-Delivery` header
    pub delivery_id: Option<String>,

    /// Parsed JSON payload
    pub payload: WebhookPayload,
}

impl SourceControlEvent {
    pub fn new(event_name: Option<String>, delivery_id: Option<String>, payload: WebhookPayload) -> Self {
        Self {
            event_name,
            delivery_id,
            payload,
        }
    }
}

/// The subset of a webhook payload the gateway reads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub sender: Option<WebhookSender>,

    #[serde(default)]
    pub repository: Option<WebhookRepository>,

    #[serde(default)]
    pub pull_request: Option<WebhookPullRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookSender {
    #[serde(default)]
    pub login: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookRepository {
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPullRequest {
    #[serde(default)]
    pub merged: Option<bool>,

    /// User object of whoever merged the pull request
    #[serde(default)]
    pub merged_by: Option<Value>,
}

/// Two-way classification of source-control event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScmEventType {
    Push,
    PullRequest,
}

impl ScmEventType {
    /// `push` only when the name is exactly `"push"`; everything else is a pull request
    pub fn classify(event_name: Option<&str>) -> Self {
        match event_name {
            Some("push") => ScmEventType::Push,
            _ => ScmEventType::PullRequest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScmEventType::Push => "push",
            ScmEventType::PullRequest => "pull_request",
        }
    }
}

/// Pull-request facts sent to the engine
///
/// `approvals` and `changed_files` stay at zero/empty unless upstream
/// enrichment filled them in; `enriched` tells the policy which case it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestFacts {
    pub merged: Option<bool>,
    pub merged_by: Option<Value>,
    pub approvals: u32,
}

/// Normalized description of an action submitted for evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub action: String,
    pub actor: String,
    pub resource: Value,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl DecisionRequest {
    /// Human-readable identifier of the resource, used in logs
    pub fn resource_id(&self) -> String {
        self.resource
            .get("repo")
            .or_else(|| self.resource.get("template"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    }

    /// Stable serialized form
    pub fn canonical_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// SHA-256 of the canonical form, hex encoded
    pub fn fingerprint(&self) -> crate::Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes()?);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// The policy engine's decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allow: bool,
    pub reasons: Vec<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reasons: Vec::new(),
        }
    }

    pub fn deny(reasons: Vec<String>) -> Self {
        Self {
            allow: false,
            reasons,
        }
    }
}

/// Terminal result of one pass through the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnforcementOutcome {
    /// The engine allowed the action; names of the side effects queued
    Allowed { side_effects_triggered: Vec<String> },

    /// The engine denied the action
    Denied { reasons: Vec<String> },

    /// No decision could be obtained
    EngineUnavailable { cause: String, retryable: bool },

    /// The event was rejected before any policy call
    InvalidInput { cause: String },
}

impl EnforcementOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, EnforcementOutcome::Allowed { .. })
    }

    /// Metric/log label
    pub fn label(&self) -> &'static str {
        match self {
            EnforcementOutcome::Allowed { .. } => "allowed",
            EnforcementOutcome::Denied { .. } => "denied",
            EnforcementOutcome::EngineUnavailable { .. } => "engine_unavailable",
            EnforcementOutcome::InvalidInput { .. } => "invalid_input",
        }
    }

    /// Record which side effects were queued for an allowed outcome
    pub fn with_side_effects(self, effects: Vec<String>) -> Self {
        match self {
            EnforcementOutcome::Allowed { .. } => EnforcementOutcome::Allowed {
                side_effects_triggered: effects,
            },
            other => other,
        }
    }
}
