//! Error types for accelet

use thiserror::Error;

/// Main error type for accelet
#[derive(Error, Debug)]
pub enum AcceletError {
    /// Configuration error (invalid queue name, bad accelerator table, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Task launcher error
    #[error("Launcher error: {0}")]
    Launcher(String),

    /// Event dispatcher error
    #[error("Dispatcher error: {0}")]
    Dispatcher(String),

    /// Task execution error
    #[error("Task error: {0}")]
    Task(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The scheduler no longer accepts new tasks
    #[error("Admission closed: {0}")]
    AdmissionClosed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for accelet operations
pub type AcceletResult<T> = Result<T, AcceletError>;

impl From<toml::de::Error> for AcceletError {
    fn from(err: toml::de::Error) -> Self {
        AcceletError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AcceletError::Config("invalid queue name".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid queue name");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AcceletError = io_err.into();
        assert!(matches!(err, AcceletError::Io(_)));
    }

    #[test]
    fn test_error_from_toml() {
        let err: AcceletError = toml::from_str::<toml::Table>("= nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, AcceletError::Config(_)));
    }
}
