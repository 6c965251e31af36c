//! Error types and handling for shmkv

use crate::sync::FaultPoint;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the pool engine
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool could not be created or opened
    #[error("Pool creation failed: {reason}")]
    PoolCreationFailed {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Operation attempted on a closed handle
    #[error("Pool is closed")]
    PoolClosed,

    /// The allocator cannot satisfy a request
    #[error("Out of memory: requested {requested} bytes, largest free chunk {available} bytes")]
    OutOfMemory { requested: u64, available: u64 },

    /// The pool lock is held by a live process past the wait interval
    #[error("Lock timeout: held by pid {holder} for more than {waited_ms} ms")]
    LockTimeout { holder: u32, waited_ms: u64 },

    /// A lock left by a dead process could not be reclaimed or repaired
    #[error("Recovery failed: {message}")]
    RecoveryFailed { message: String },

    /// Invalid parameters or configuration
    #[error("Invalid argument: {parameter} - {message}")]
    InvalidArgument { parameter: String, message: String },

    /// Structural corruption detected inside the region
    #[error("Consistency violation: {message}")]
    ConsistencyViolation { message: String },

    /// I/O related errors on an already created pool (flush, remove)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A fault injector abandoned the operation at the given point
    #[error("Operation abandoned at fault point {point:?}")]
    Abandoned { point: FaultPoint },
}

impl PoolError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a pool creation error without an underlying I/O cause
    pub fn creation(reason: impl Into<String>) -> Self {
        Self::PoolCreationFailed {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a pool creation error caused by an I/O failure
    pub fn creation_io(source: std::io::Error, context: &str) -> Self {
        Self::PoolCreationFailed {
            reason: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create an out of memory error
    pub fn out_of_memory(requested: u64, available: u64) -> Self {
        Self::OutOfMemory {
            requested,
            available,
        }
    }

    /// Create a lock timeout error
    pub fn lock_timeout(holder: u32, waited_ms: u64) -> Self {
        Self::LockTimeout { holder, waited_ms }
    }

    /// Create a recovery failure
    pub fn recovery_failed(message: impl Into<String>) -> Self {
        Self::RecoveryFailed {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a consistency violation
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            message: message.into(),
        }
    }

    /// Create an abandoned-operation error
    pub fn abandoned(point: FaultPoint) -> Self {
        Self::Abandoned { point }
    }

    /// Whether the error leaves the pool lock held on purpose
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned { .. })
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}
