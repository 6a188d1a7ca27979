use thiserror::Error;

/// Failure categories surfaced by model compilation and simulation runs.
///
/// Callers are expected to branch on the variant: a `Configuration` error means the
/// inputs must change, an `Accuracy` error can be retried with looser tolerances or
/// more steps, and `DataNotFound` means a symbol name did not resolve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("data not found: {0}")]
    DataNotFound(String),
    #[error("accuracy exceeded: {0}")]
    Accuracy(String),
    #[error("invalid simulator state: {0}")]
    State(String),
    #[error("malformed expression: {0}")]
    Expression(String),
}

impl SimulationError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::DataNotFound(message.into())
    }

    pub fn accuracy(message: impl Into<String>) -> Self {
        Self::Accuracy(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }
}

pub type Result<T, E = SimulationError> = std::result::Result<T, E>;
