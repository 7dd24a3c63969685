//! Decision input builder
//!
//! Maps an inbound [`Event`] into the [`DecisionRequest`] submitted to the
//! policy engine. The mapping is a pure function of the event so the same
//! event always produces the same request.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{
    DecisionRequest, Event, PullRequestFacts, RegistrationEvent, ScmEventType, SourceControlEvent,
    DEFAULT_SCM_ACTION, REGISTER_TEMPLATE_ACTION,
};

/// Build the decision request for an event
pub fn build(event: &Event) -> Result<DecisionRequest> {
    match event {
        Event::Registration(registration) => build_registration(registration),
        Event::SourceControl(scm) => build_source_control(scm),
    }
}

/// Normalize a template registration call
pub fn build_registration(event: &RegistrationEvent) -> Result<DecisionRequest> {
    let actor = require_text(event.actor.as_deref(), "actor")?;

    let template = match &event.template {
        Some(template) if !is_empty_value(template) => template.clone(),
        _ => return Err(Error::invalid_input("missing required field: template")),
    };

    Ok(DecisionRequest {
        action: REGISTER_TEMPLATE_ACTION.to_string(),
        actor,
        resource: json!({ "template": template }),
        context: BTreeMap::new(),
    })
}

/// Normalize a source-control webhook delivery
pub fn build_source_control(event: &SourceControlEvent) -> Result<DecisionRequest> {
    let payload = &event.payload;

    let actor = require_text(
        payload.sender.as_ref().and_then(|s| s.login.as_deref()),
        "sender.login",
    )?;
    let repo = require_text(
        payload.repository.as_ref().and_then(|r| r.full_name.as_deref()),
        "repository.full_name",
    )?;

    let event_type = ScmEventType::classify(event.event_name.as_deref());
    let action = payload
        .action
        .clone()
        .unwrap_or_else(|| DEFAULT_SCM_ACTION.to_string());

    // Review counts and diffs come from upstream enrichment, which this
    // gateway does not perform; zero/empty here means "unknown".
    let pull_request = payload.pull_request.as_ref().map(|pr| PullRequestFacts {
        merged: pr.merged,
        merged_by: pr.merged_by.clone(),
        approvals: 0,
    });

    let mut context = BTreeMap::new();
    context.insert("event_type".to_string(), json!(event_type.as_str()));
    context.insert("pull_request".to_string(), serde_json::to_value(pull_request)?);
    context.insert("changed_files".to_string(), json!([]));
    context.insert("enriched".to_string(), json!(false));

    Ok(DecisionRequest {
        action,
        actor,
        resource: json!({ "repo": repo }),
        context,
    })
}

fn require_text(value: Option<&str>, field: &str) -> Result<String> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        _ => Err(Error::invalid_input(format!("missing required field: {}", field))),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
