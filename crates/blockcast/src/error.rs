//! Error types for the transfer engine.

use thiserror::Error;

/// Main error type for transfer operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration error (invalid block size, missing producer, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation on a pool or coordinator that has been closed.
    #[error("Engine is disposed")]
    Disposed,

    /// Transfer was cancelled (caller token, `cancel()`, or escalation).
    #[error("Transfer cancelled")]
    Cancelled,

    /// A worker's initialize/fill/drain/finalize failed.
    #[error("Worker {worker} failed: {source}")]
    Worker {
        worker: String,
        #[source]
        source: Box<EngineError>,
    },

    /// IO error (file operations inside workers).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Verification digest does not match the reference digest.
    #[error("Hash verification failed for {worker}: expected {expected}, got {actual}")]
    HashMismatch {
        worker: String,
        expected: String,
        actual: String,
    },

    /// The reference digest could not be computed.
    #[error("Hash verification failed: reference digest unavailable")]
    ReferenceHashFailed(#[source] Box<EngineError>),

    /// Internal consistency check failed - indicates a bug.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Multiple workers failed with independent errors.
    #[error("Multiple failures: [{}]", format_error_list(.0))]
    Aggregate(Vec<EngineError>),
}

fn format_error_list(errors: &[EngineError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Create an Invariant error.
    pub fn invariant(message: impl Into<String>) -> Self {
        EngineError::Invariant(message.into())
    }

    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config(message.into())
    }

    /// Wrap an error with the name of the worker it came from.
    ///
    /// Cancellations are not wrapped: a cancelled worker reports plain
    /// [`EngineError::Cancelled`] so aggregation can recognize it.
    pub fn worker(worker: impl Into<String>, source: EngineError) -> Self {
        if source.is_cancellation() {
            return EngineError::Cancelled;
        }
        EngineError::Worker {
            worker: worker.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error represents cooperative cancellation rather than
    /// a real failure.
    pub fn is_cancellation(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::Worker { source, .. } => source.is_cancellation(),
            EngineError::ReferenceHashFailed(source) => source.is_cancellation(),
            _ => false,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

// `std::io::Error` is not `Clone`, so cloning rebuilds it from its kind and
// message. Completions keep the original; reports and aggregates carry copies.
impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            EngineError::Config(m) => EngineError::Config(m.clone()),
            EngineError::Disposed => EngineError::Disposed,
            EngineError::Cancelled => EngineError::Cancelled,
            EngineError::Worker { worker, source } => EngineError::Worker {
                worker: worker.clone(),
                source: source.clone(),
            },
            EngineError::Io(e) => {
                EngineError::Io(std::io::Error::new(e.kind(), e.to_string()))
            }
            EngineError::HashMismatch {
                worker,
                expected,
                actual,
            } => EngineError::HashMismatch {
                worker: worker.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            EngineError::ReferenceHashFailed(source) => {
                EngineError::ReferenceHashFailed(source.clone())
            }
            EngineError::Invariant(m) => EngineError::Invariant(m.clone()),
            EngineError::Aggregate(errors) => EngineError::Aggregate(errors.clone()),
        }
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_cancellation() {
        assert!(EngineError::Cancelled.is_cancellation());
        assert!(!EngineError::Disposed.is_cancellation());
        assert!(!EngineError::invariant("x").is_cancellation());

        let wrapped = EngineError::Worker {
            worker: "w".into(),
            source: Box::new(EngineError::Cancelled),
        };
        assert!(wrapped.is_cancellation());
    }

    #[test]
    fn test_worker_wrap_flattens_cancellation() {
        let err = EngineError::worker("reader", EngineError::Cancelled);
        assert!(matches!(err, EngineError::Cancelled));

        let err = EngineError::worker("reader", EngineError::invariant("boom"));
        assert!(matches!(err, EngineError::Worker { .. }));
    }

    #[test]
    fn test_clone_preserves_io_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = EngineError::Io(io);
        let cloned = err.clone();
        match cloned {
            EngineError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let err = EngineError::Worker {
            worker: "writer-1".into(),
            source: Box::new(EngineError::invariant("refcount underflow")),
        };
        let detailed = err.format_detailed();
        assert!(detailed.contains("writer-1"));
        assert!(detailed.contains("Caused by"));
        assert!(detailed.contains("refcount underflow"));
    }
}
