//! PolicyGate Policy
//!
//! Everything between a decision request and an enforcement outcome:
//! - The policy client that queries an OPA-style engine over HTTP
//! - Normalization of the engine's boolean and object result shapes
//! - Failure classification and bounded retry for transient errors
//! - The fail-closed enforcement gate

pub mod client;
pub mod error;
pub mod gate;
pub mod retry;
pub mod wire;

pub use client::{OpaClient, OpaClientConfig, PolicyClient};
pub use error::{EngineError, FailureClass};
pub use gate::enforce;
pub use retry::RetryPolicy;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::client::{OpaClient, OpaClientConfig, PolicyClient};
    pub use crate::error::{EngineError, FailureClass};
    pub use crate::gate::enforce;
}
