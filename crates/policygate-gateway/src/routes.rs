//! HTTP routes and handlers

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use policygate_core::{
    EnforcementOutcome, Event, RegistrationEvent, SourceControlEvent, WebhookPayload,
};
use serde_json::json;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::pipeline::{self, AppState};
use crate::signature::{verify_signature, SIGNATURE_HEADER};

/// Header naming the source-control event type
pub const EVENT_HEADER: &str = "x-github-event";

/// Header carrying the unique delivery id
pub const DELIVERY_HEADER: &str = "x-github-delivery";

pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/register", post(register))
        .route("/webhook", post(webhook))
        .fallback(fallback)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics exporter not installed").into_response(),
    }
}

/// Template registration handler
async fn register(State(state): State<AppState>, body: Bytes) -> RegistrationResponse {
    let request_id = Uuid::new_v4();
    let span = info_span!("register", request_id = %request_id);

    async move {
        metrics::counter!("policygate_requests_total", "route" => "register").increment(1);

        let event: RegistrationEvent = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed registration body");
                return RegistrationResponse(EnforcementOutcome::InvalidInput {
                    cause: format!("invalid JSON body: {}", e),
                });
            }
        };

        RegistrationResponse(pipeline::execute(&state, Event::Registration(event), request_id).await)
    }
    .instrument(span)
    .await
}

/// Source-control webhook handler
async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<WebhookResponse, GatewayError> {
    let request_id = Uuid::new_v4();
    let delivery_id = header_value(&headers, DELIVERY_HEADER);
    let span = info_span!(
        "webhook",
        request_id = %request_id,
        delivery = delivery_id.as_deref().unwrap_or("-"),
    );

    async move {
        metrics::counter!("policygate_requests_total", "route" => "webhook").increment(1);

        if let Some(secret) = &state.webhook_secret {
            let provided = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
            if !verify_signature(secret.as_bytes(), &body, provided) {
                warn!("Webhook signature verification failed");
                return Err(GatewayError::InvalidSignature);
            }
        }

        let payload: WebhookPayload = match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Malformed webhook payload");
                return Ok(WebhookResponse(EnforcementOutcome::InvalidInput {
                    cause: format!("invalid JSON body: {}", e),
                }));
            }
        };

        let event = SourceControlEvent::new(event_name(&headers), delivery_id, payload);
        Ok(WebhookResponse(
            pipeline::execute(&state, Event::SourceControl(event), request_id).await,
        ))
    }
    .instrument(span)
    .await
}

async fn fallback() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Event name exactly as sent; classification needs an exact `push`
fn event_name(headers: &HeaderMap) -> Option<String> {
    headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn status_for(outcome: &EnforcementOutcome) -> StatusCode {
    match outcome {
        EnforcementOutcome::Allowed { .. } => StatusCode::OK,
        EnforcementOutcome::Denied { .. } => StatusCode::FORBIDDEN,
        EnforcementOutcome::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        EnforcementOutcome::EngineUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON rendering of an outcome for `/register`
pub struct RegistrationResponse(pub EnforcementOutcome);

impl IntoResponse for RegistrationResponse {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = match self.0 {
            EnforcementOutcome::Allowed { .. } => json!({
                "success": true,
                "message": "Template registration successful",
            }),
            EnforcementOutcome::Denied { reasons } => json!({
                "success": false,
                "reasons": reasons,
            }),
            EnforcementOutcome::InvalidInput { cause } => json!({
                "success": false,
                "error": cause,
            }),
            // Engine details stay in the logs
            EnforcementOutcome::EngineUnavailable { .. } => json!({
                "success": false,
                "error": "Failed to evaluate policy",
            }),
        };

        (status, Json(body)).into_response()
    }
}

/// Plain-text rendering of an outcome for `/webhook`
pub struct WebhookResponse(pub EnforcementOutcome);

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let text = match self.0 {
            EnforcementOutcome::Allowed { .. } => "Allowed",
            EnforcementOutcome::Denied { .. } => "Blocked by Policy",
            EnforcementOutcome::InvalidInput { .. } => "Bad Request",
            EnforcementOutcome::EngineUnavailable { .. } => "Internal Server Error",
        };

        (status, text).into_response()
    }
}

/// Failures rejected before the pipeline runs
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid signature")]
    InvalidSignature,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self {
            GatewayError::InvalidSignature => StatusCode::UNAUTHORIZED,
        };

        (status, self.to_string()).into_response()
    }
}
