//! PolicyGate Core
//!
//! Types and utilities shared across PolicyGate components.
//!
//! This crate provides:
//! - The inbound event model (template registrations, source-control webhooks)
//! - The normalized decision request submitted to the policy engine
//! - Verdict and enforcement outcome types
//! - The decision input builder
//! - Error types and result handling

pub mod builder;
pub mod error;
pub mod types;

pub use builder::build;
pub use error::{Error, Result};
pub use types::{
    DecisionRequest, EnforcementOutcome, Event, RegistrationEvent, ScmEventType,
    SourceControlEvent, Verdict, WebhookPayload, DEFAULT_DENY_REASON,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builder::build;
    pub use crate::error::{Error, Result};
    pub use crate::types::{DecisionRequest, EnforcementOutcome, Event, Verdict};
}
