//! Library error type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NgptError {
    /// Invalid hyperparameters, detected before any layer is built.
    #[error("configuration error: {0}")]
    Config(String),

    /// A forward option was requested in a state that cannot honour it.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("token id {id} out of range for vocabulary of {num_tokens}")]
    TokenOutOfRange { id: i64, num_tokens: usize },

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("reshape failed: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, NgptError>;

impl NgptError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        NgptError::Config(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        NgptError::Precondition(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NgptError::config("depth must be positive");
        assert!(err.to_string().contains("configuration error"));

        let err = NgptError::precondition("loss needs causal");
        assert!(err.to_string().contains("precondition failed"));

        let err = NgptError::TokenOutOfRange {
            id: 77,
            num_tokens: 50,
        };
        assert!(err.to_string().contains("77"));
        assert!(err.to_string().contains("50"));
    }
}
