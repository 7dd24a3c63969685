//! Core enforcement pipeline

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusHandle;
use policygate_core::{build, EnforcementOutcome, Event};
use policygate_policy::{enforce, OpaClient, PolicyClient};
use policygate_telemetry::AuditLog;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::dispatcher::{idempotency_key, DispatchSettings, Dispatcher, EffectPlan};
use crate::effects::{AuditEffect, HookEffect, SideEffect};

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    /// Client for the external policy engine
    pub policy_client: Arc<dyn PolicyClient>,

    /// Outbox for post-decision side effects
    pub dispatcher: Arc<Dispatcher>,

    /// Shared secret for webhook signatures
    pub webhook_secret: Option<Arc<str>>,

    /// Prometheus metrics handle for rendering
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(policy_client: Arc<dyn PolicyClient>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            policy_client,
            dispatcher,
            webhook_secret: None,
            metrics_handle: None,
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<Arc<str>>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Initialize application state from configuration
    ///
    /// Fails when the configuration cannot be enforced, most notably when no
    /// engine URL is set.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let client_config = config.validate()?;
        info!("Policy engine: {}", client_config.url);
        let policy_client = OpaClient::new(client_config)?;

        let audit_log = match &config.audit.path {
            Some(path) => {
                info!("Audit log: {}", path.display());
                AuditLog::open(path)?
            }
            None => {
                info!("Audit log kept in memory only");
                AuditLog::in_memory()
            }
        };

        let hooks = &config.orchestration;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(hooks.effect_timeout_ms))
            .build()?;

        let plan = EffectPlan {
            on_allowed: vec![
                Arc::new(HookEffect::index_refresh(hooks.index_refresh_url.clone(), http.clone()))
                    as Arc<dyn SideEffect>,
                Arc::new(HookEffect::agent_notify(hooks.agent_notify_url.clone(), http.clone())),
            ],
            on_denied: vec![
                Arc::new(HookEffect::pr_comment(hooks.pr_comment_url.clone(), http))
                    as Arc<dyn SideEffect>,
                Arc::new(AuditEffect::new(Arc::new(audit_log))),
            ],
        };
        let dispatcher = Dispatcher::spawn(plan, DispatchSettings::from(hooks));

        let mut state = Self::new(Arc::new(policy_client), Arc::new(dispatcher));
        if let Some(secret) = config.webhook.secret.as_deref().filter(|s| !s.is_empty()) {
            info!("Webhook signature verification enabled");
            state = state.with_webhook_secret(secret);
        }

        Ok(state)
    }
}

/// Run one event through builder, policy client, gate and dispatcher
///
/// `request_id` identifies this inbound call; side effects of events without
/// a delivery id are keyed by it.
pub async fn execute(state: &AppState, event: Event, request_id: Uuid) -> EnforcementOutcome {
    let start = Instant::now();
    let outcome = evaluate(state, &event, &request_id).await;

    metrics::counter!(
        "policygate_decisions_total",
        "route" => event.kind(),
        "outcome" => outcome.label()
    )
    .increment(1);
    metrics::histogram!("policygate_pipeline_latency_us", "route" => event.kind())
        .record(start.elapsed().as_micros() as f64);

    outcome
}

async fn evaluate(state: &AppState, event: &Event, request_id: &Uuid) -> EnforcementOutcome {
    let request = match build(event) {
        Ok(request) => request,
        Err(e) => {
            warn!(kind = event.kind(), error = %e, "Rejected inbound event");
            return EnforcementOutcome::InvalidInput {
                cause: e.to_string(),
            };
        }
    };

    let resource = request.resource_id();
    let key = idempotency_key(event, request_id);

    let verdict = match state.policy_client.evaluate(&request).await {
        Ok(verdict) => verdict,
        Err(e) => {
            error!(
                action = %request.action,
                actor = %request.actor,
                resource = %resource,
                class = e.class().as_str(),
                error = %e,
                "Policy evaluation failed, denying by default"
            );
            return EnforcementOutcome::EngineUnavailable {
                cause: e.to_string(),
                retryable: e.is_retryable(),
            };
        }
    };

    match enforce(Some(&verdict)) {
        outcome @ EnforcementOutcome::Allowed { .. } => {
            let effects = state.dispatcher.on_allowed(event, &request, &key);
            info!(
                action = %request.action,
                actor = %request.actor,
                resource = %resource,
                side_effects = ?effects,
                "Action allowed by policy"
            );
            outcome.with_side_effects(effects)
        }
        EnforcementOutcome::Denied { reasons } => {
            let remediation = state.dispatcher.on_denied(event, &request, &reasons, &key);
            warn!(
                action = %request.action,
                actor = %request.actor,
                resource = %resource,
                reasons = ?reasons,
                remediation = ?remediation,
                "Action blocked by policy"
            );
            EnforcementOutcome::Denied { reasons }
        }
        other => other,
    }
}
