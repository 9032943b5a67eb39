use thiserror::Error;

/// Core error type for the SabFlow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    FlowNotFound(String),

    /// Execution state not found
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Malformed node data, unknown operator, missing required field
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network/timeout/non-2xx failure from an outbound API call
    #[error("External call error: {0}")]
    ExternalCall(String),

    /// Failure to deliver a message through the transport collaborator
    #[error("Transport error: {0}")]
    Transport(String),

    /// Execution state could not be read or saved
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Structural validation error in a flow definition
    #[error("Validation error: {0}")]
    Validation(String),

    /// Illegal execution status transition
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timer scheduling error
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
