//! Policy engine failure taxonomy

use std::time::Duration;

/// Whether a failed engine call is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transport-level problem that may clear up on its own
    Retryable,
    /// The engine answered, but not with something usable
    Terminal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Retryable => "retryable",
            FailureClass::Terminal => "terminal",
        }
    }
}

/// Reasons the policy engine could not produce a verdict
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("failed to reach policy engine: {0}")]
    Transport(String),

    #[error("policy engine did not answer within {0:?}")]
    Timeout(Duration),

    #[error("policy engine returned HTTP {0}")]
    Status(u16),

    #[error("policy engine response is not valid JSON: {0}")]
    MalformedBody(String),

    #[error("policy engine response has no result")]
    MissingResult,
}

impl EngineError {
    /// Classify this failure
    pub fn class(&self) -> FailureClass {
        match self {
            EngineError::Transport(_) | EngineError::Timeout(_) => FailureClass::Retryable,
            EngineError::Status(code) if *code == 429 || *code >= 500 => FailureClass::Retryable,
            EngineError::Status(_) | EngineError::MalformedBody(_) | EngineError::MissingResult => {
                FailureClass::Terminal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }
}

impl From<EngineError> for policygate_core::Error {
    fn from(err: EngineError) -> Self {
        policygate_core::Error::engine_unavailable(err.to_string())
    }
}
