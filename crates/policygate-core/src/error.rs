//! Error types for PolicyGate

/// Result type alias using PolicyGate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for PolicyGate operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The inbound event is missing required data or is malformed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The policy engine could not produce a decision
    #[error("policy engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a new invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new engine-unavailable error
    pub fn engine_unavailable(msg: impl Into<String>) -> Self {
        Self::EngineUnavailable(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
