use std::error::Error as StdError;
use thiserror::Error;

/// Errors surfaced by the taossql driver.
///
/// None of these are logged and dropped inside the crate; every variant is
/// returned to the immediate caller.
#[derive(Error, Debug)]
pub enum DialectError {
    /// Malformed caller input, e.g. a multi-table expression passed where a
    /// single table name is expected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation intentionally unimplemented by this dialect.
    #[error("{0}")]
    NotSupported(String),

    /// Failure reported by the underlying connection or statement execution.
    #[error("{operation}: {source}")]
    BackendOperation {
        operation: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A previous fetch for this key failed and failure caching is enabled.
    #[error("table fields for {key} unavailable after earlier failure: {message}")]
    CachedFailure { key: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl DialectError {
    pub fn backend<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        DialectError::BackendOperation {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, DialectError::InvalidArgument(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, DialectError::NotSupported(_))
    }
}

pub type Result<T> = std::result::Result<T, DialectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display_carries_operation_and_cause() {
        let err = DialectError::backend("desc users", "connection refused");
        assert_eq!(err.to_string(), "desc users: connection refused");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_kind_predicates() {
        assert!(DialectError::InvalidArgument("x".into()).is_invalid_argument());
        assert!(DialectError::NotSupported("x".into()).is_not_supported());
        assert!(!DialectError::Config("x".into()).is_not_supported());
    }
}
