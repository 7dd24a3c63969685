//! Policy engine wire format
//!
//! Requests are sent as `{"input": <DecisionRequest>}`. Responses carry a
//! `result` that is either a bare boolean or an object with `allow` and
//! `reasons`. Both shapes normalize into a [`Verdict`].

use policygate_core::{DecisionRequest, Verdict};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;

/// Body posted to the engine
#[derive(Debug, Serialize)]
pub struct EngineQuery<'a> {
    pub input: &'a DecisionRequest,
}

/// Body returned by the engine
#[derive(Debug, Deserialize)]
pub struct EngineResponse {
    #[serde(default)]
    pub result: Option<Value>,
}

/// Parse a raw engine response body into a verdict
pub fn parse_response(body: &[u8]) -> Result<Verdict, EngineError> {
    let response: EngineResponse =
        serde_json::from_slice(body).map_err(|e| EngineError::MalformedBody(e.to_string()))?;

    match response.result {
        Some(result) => Ok(verdict_from_result(&result)),
        None => Err(EngineError::MissingResult),
    }
}

/// Normalize an engine `result` value
///
/// Only the JSON boolean `true`, bare or as `allow`, allows.
pub fn verdict_from_result(result: &Value) -> Verdict {
    match result {
        Value::Bool(true) => Verdict::allow(),
        Value::Bool(false) => Verdict::deny(Vec::new()),
        Value::Object(map) => {
            if matches!(map.get("allow"), Some(Value::Bool(true))) {
                Verdict::allow()
            } else {
                Verdict::deny(map.get("reasons").map(collect_reasons).unwrap_or_default())
            }
        }
        other => {
            debug!(result = %other, "Unrecognized policy result shape, treating as deny");
            Verdict::deny(Vec::new())
        }
    }
}

fn collect_reasons(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::String(reason) => vec![reason.clone()],
        _ => Vec::new(),
    }
}
