//! Error types for stream propagation.

use crate::types::State;
use thiserror::Error;

/// Main error type for stream operations.
///
/// Errors are cloned into every downstream edge when a node fails, so all
/// variants carry owned, cheaply cloneable data.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Max back pressure ({capacity}) exceeded for input: {key}")]
    Overflow { key: String, capacity: usize },

    #[error("Operation not allowed on {id} in state {state:?}")]
    IllegalState { id: String, state: State },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::InvalidConfig(e.to_string())
    }
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
