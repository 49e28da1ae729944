//! Colony error types

use thiserror::Error;

/// Colony error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An identifier that cannot safely be embedded in a file name
    #[error("Invalid id '{0}'")]
    InvalidId(String),

    /// An entity exists but is not in a state that permits the operation
    #[error("Cannot {operation} {entity} '{id}': status is {actual}, expected {expected}")]
    InvalidTransition {
        operation: &'static str,
        entity: &'static str,
        id: String,
        actual: String,
        expected: String,
    },

    /// Advisory lock error
    #[error("Lock error: {0}")]
    Lock(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a precondition violation for a task transition.
    pub(crate) fn task_transition(
        operation: &'static str,
        id: &str,
        actual: impl std::fmt::Display,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            operation,
            entity: "task",
            id: id.to_string(),
            actual: actual.to_string(),
            expected: expected.into(),
        }
    }

    /// Whether this error is a state-machine precondition violation.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

/// Result type alias for Colony operations
pub type Result<T> = std::result::Result<T, Error>;
