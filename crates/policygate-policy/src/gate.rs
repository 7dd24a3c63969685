//! Enforcement gate
//!
//! Translates a verdict into the outcome taken on the caller's request.
//! Anything short of an explicit allow is a denial.

use policygate_core::{EnforcementOutcome, Verdict, DEFAULT_DENY_REASON};

/// Decide the outcome for a verdict; a missing verdict denies
pub fn enforce(verdict: Option<&Verdict>) -> EnforcementOutcome {
    match verdict {
        Some(verdict) if verdict.allow => EnforcementOutcome::Allowed {
            side_effects_triggered: Vec::new(),
        },
        Some(verdict) => EnforcementOutcome::Denied {
            reasons: deny_reasons(&verdict.reasons),
        },
        None => EnforcementOutcome::Denied {
            reasons: deny_reasons(&[]),
        },
    }
}

fn deny_reasons(reasons: &[String]) -> Vec<String> {
    if reasons.is_empty() {
        vec![DEFAULT_DENY_REASON.to_string()]
    } else {
        reasons.to_vec()
    }
}
