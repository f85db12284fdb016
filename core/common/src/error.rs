//! Common error types for MirrorSync.

use thiserror::Error;

/// Top-level error type for MirrorSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A store could not return its change window.
    #[error("Fetch from '{store}' failed: {message}")]
    Fetch {
        store: String,
        message: String,
        transient: bool,
    },

    /// A store could not persist a record.
    #[error("Write of '{id}' to '{store}' failed: {message}")]
    Write {
        store: String,
        id: String,
        message: String,
        transient: bool,
    },

    /// One or more writes of a sync pass failed; the pass still ran every comparison.
    #[error("{failed} of {attempted} writes failed during sync pass (first: {first})")]
    PartialPass {
        failed: usize,
        attempted: usize,
        first: Box<Error>,
    },

    /// The two stores disagree on the record schema.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Storage backend failed outside of a fetch or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation was aborted before it completed.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Fetch failure that is expected to clear up on its own.
    pub fn fetch_transient(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            store: store.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Fetch failure that will not succeed without intervention.
    pub fn fetch_fatal(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            store: store.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Write failure that is expected to clear up on its own.
    pub fn write_transient(
        store: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Write {
            store: store.into(),
            id: id.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Write failure that will not succeed without intervention.
    pub fn write_fatal(
        store: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Write {
            store: store.into(),
            id: id.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Fetch { transient, .. } | Error::Write { transient, .. } => *transient,
            Error::PartialPass { first, .. } => first.is_transient(),
            Error::Io(_) | Error::Storage(_) | Error::Cancelled => true,
            _ => false,
        }
    }

    /// Whether the error is a configuration problem no amount of polling can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SchemaMismatch(_) | Error::Config(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::fetch_transient("es", "timeout").is_transient());
        assert!(!Error::fetch_fatal("es", "bad request").is_transient());
        assert!(Error::write_transient("sqlite", "1", "busy").is_transient());
        assert!(!Error::SchemaMismatch("fields".to_string()).is_transient());
    }

    #[test]
    fn test_partial_pass_follows_first_error() {
        let err = Error::PartialPass {
            failed: 2,
            attempted: 5,
            first: Box::new(Error::write_fatal("es", "7", "mapping rejected")),
        };
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("2 of 5"));
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::SchemaMismatch("x".to_string()).is_fatal());
        assert!(Error::Config("x".to_string()).is_fatal());
        assert!(!Error::fetch_transient("a", "b").is_fatal());
    }
}
