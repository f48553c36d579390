use thiserror::Error;

/// Error kinds surfaced to the gateway boundary.
///
/// The HTTP layer maps each kind to a status code; the core only needs to
/// keep them distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidIdentifier,
    SqlRejected,
    ParameterMismatch,
    InvalidRequest,
    NotFound,
    StatementConflict,
    ExecutionFailed,
    PoolUnavailable,
    Configuration,
}

impl ErrorKind {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidIdentifier => "invalid_identifier",
            ErrorKind::SqlRejected => "sql_rejected",
            ErrorKind::ParameterMismatch => "parameter_mismatch",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StatementConflict => "statement_conflict",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::PoolUnavailable => "pool_unavailable",
            ErrorKind::Configuration => "configuration",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{0}")]
    InvalidIdentifier(String),

    #[error("SQL rejected: {0}")]
    SqlRejected(String),

    #[error("Parameter count mismatch: SQL expects {expected} parameters, but {provided} were provided")]
    ParameterMismatch { expected: usize, provided: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Prepared statement '{0}' is already cached with different SQL")]
    StatementConflict(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Connection pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            Error::SqlRejected(_) => ErrorKind::SqlRejected,
            Error::ParameterMismatch { .. } => ErrorKind::ParameterMismatch,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::StatementConflict(_) => ErrorKind::StatementConflict,
            Error::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            Error::PoolUnavailable(_) => ErrorKind::PoolUnavailable,
            Error::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// True when the caller caused the failure and retrying the same request
    /// cannot succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidIdentifier
                | ErrorKind::SqlRejected
                | ErrorKind::ParameterMismatch
                | ErrorKind::InvalidRequest
                | ErrorKind::NotFound
                | ErrorKind::StatementConflict
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_mismatch_message() {
        let err = Error::ParameterMismatch { expected: 2, provided: 1 };
        assert_eq!(
            err.to_string(),
            "Parameter count mismatch: SQL expects 2 parameters, but 1 were provided"
        );
        assert_eq!(err.kind().code(), "parameter_mismatch");
    }

    #[test]
    fn test_client_error_classification() {
        assert!(Error::SqlRejected("x".into()).is_client_error());
        assert!(Error::NotFound("x".into()).is_client_error());
        assert!(!Error::ExecutionFailed("x".into()).is_client_error());
        assert!(!Error::PoolUnavailable("x".into()).is_client_error());
    }
}
