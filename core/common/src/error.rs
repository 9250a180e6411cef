//! Common error types for tokenvault.

use thiserror::Error;

/// Top-level error type for tokenvault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A storage provider rejected or failed an operation.
    #[error("Connector error [{provider}/{operation}]: {message}")]
    Connector {
        provider: String,
        operation: String,
        message: String,
    },

    /// A provider call did not complete within its deadline.
    #[error("Timeout [{provider}/{operation}] after {after_ms}ms")]
    Timeout {
        provider: String,
        operation: String,
        after_ms: u64,
    },

    /// Fewer providers than the quorum accepted a replicated record.
    #[error("Quorum not met for {token_id}: {succeeded} of {required} required providers succeeded")]
    QuorumNotMet {
        token_id: String,
        succeeded: usize,
        required: usize,
    },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Work was abandoned because shutdown was requested.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Build a connector failure for `provider` while running `operation`.
    pub fn connector(
        provider: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Connector {
            provider: provider.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_error_display() {
        let err = Error::connector("aws", "store", "quota exceeded");
        assert_eq!(
            err.to_string(),
            "Connector error [aws/store]: quota exceeded"
        );
    }

    #[test]
    fn test_quorum_error_display() {
        let err = Error::QuorumNotMet {
            token_id: "tok_1".to_string(),
            succeeded: 1,
            required: 2,
        };
        assert!(err.to_string().contains("1 of 2"));
    }
}
