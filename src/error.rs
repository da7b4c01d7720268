/*!
 * Error types for partwise
 */

use std::fmt;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTEGRITY: i32 = 3;

/// Service error codes that indicate a transient condition on the remote side
const RETRYABLE_SERVICE_CODES: &[&str] = &[
    "RequestTimeout",
    "InternalError",
    "ServiceUnavailable",
    "SlowDown",
];

/// Errors that can occur while planning, running or finalizing a transfer
#[derive(Error, Debug)]
pub enum TransferError {
    /// Bad part size/count, paths or configuration values. Raised before any I/O.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network or HTTP level failure while moving a part
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote service rejected a request with a structured error code
    #[error("Service error ({status} {code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// End-to-end integrity check failed
    #[error("Checksum mismatch for {target}: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch {
        target: String,
        expected: u64,
        actual: u64,
    },

    /// The recorded session or source no longer matches the remote side
    #[error("Stale checkpoint: {0}")]
    StaleCheckpoint(String),

    /// Checkpoint could not be serialized or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Cancellation was requested before every part started
    #[error("Transfer cancelled")]
    Cancelled,

    /// A worker thread panicked or exited unexpectedly
    #[error("Worker failure: {0}")]
    Worker(String),

    /// Failure attributed to a specific part
    #[error("Part {part}: {source}")]
    Part {
        part: u32,
        #[source]
        source: Box<TransferError>,
    },
}

impl TransferError {
    /// Attach the part number a failure belongs to
    pub fn for_part(self, part: u32) -> Self {
        match self {
            TransferError::Part { .. } => self,
            other => TransferError::Part {
                part,
                source: Box::new(other),
            },
        }
    }

    /// Build a service error without a request id
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Service {
            status,
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// Strip part context wrappers
    pub fn root_cause(&self) -> &TransferError {
        match self {
            TransferError::Part { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Part number this error was attributed to, if any
    pub fn part_number(&self) -> Option<u32> {
        match self {
            TransferError::Part { part, .. } => Some(*part),
            _ => None,
        }
    }

    /// Service error code, if the remote returned one
    pub fn service_code(&self) -> Option<&str> {
        match self.root_cause() {
            TransferError::Service { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Check if the failed operation is worth repeating in place
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport(_) => true,
            TransferError::Io(err) => is_io_transient(err),
            TransferError::Service { status, code, .. } => {
                *status >= 500 || RETRYABLE_SERVICE_CODES.contains(&code.as_str())
            }
            TransferError::Part { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error is fatal (re-invoking the transfer will not help)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root_cause(),
            TransferError::InvalidArgument(_)
                | TransferError::Config(_)
                | TransferError::ChecksumMismatch { .. }
        )
    }

    /// Check if this error signals data corruption
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self.root_cause(), TransferError::ChecksumMismatch { .. })
    }

    /// Check if this error is a stale checkpoint detected at finalize
    pub fn is_stale_checkpoint(&self) -> bool {
        matches!(self.root_cause(), TransferError::StaleCheckpoint(_))
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            TransferError::InvalidArgument(_) | TransferError::Config(_) => EXIT_FATAL,
            TransferError::ChecksumMismatch { .. } => EXIT_INTEGRITY,
            _ => EXIT_PARTIAL,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self.root_cause() {
            TransferError::InvalidArgument(_) => ErrorCategory::Validation,
            TransferError::Config(_) => ErrorCategory::Configuration,
            TransferError::Transport(_) => ErrorCategory::Network,
            TransferError::Service { .. } => ErrorCategory::Service,
            TransferError::ChecksumMismatch { .. } => ErrorCategory::Integrity,
            TransferError::StaleCheckpoint(_) | TransferError::Checkpoint(_) => {
                ErrorCategory::Resume
            }
            TransferError::Io(_) => ErrorCategory::IoError,
            TransferError::Cancelled => ErrorCategory::Cancelled,
            TransferError::Worker(_) => ErrorCategory::Concurrency,
            TransferError::Part { .. } => ErrorCategory::Unknown,
        }
    }
}

fn is_io_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | Interrupted
            | WouldBlock
            | UnexpectedEof
    )
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Argument and path validation errors
    Validation,
    /// Configuration errors
    Configuration,
    /// Network/transport errors
    Network,
    /// Structured rejections from the remote service
    Service,
    /// Data integrity errors (checksums)
    Integrity,
    /// Checkpoint/resume errors
    Resume,
    /// Local I/O errors
    IoError,
    /// Cooperative cancellation
    Cancelled,
    /// Worker pool failures
    Concurrency,
    /// Uncategorized errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Service => write!(f, "service"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Resume => write!(f, "resume"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
            ErrorCategory::Concurrency => write!(f, "concurrency"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Checkpoint(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(TransferError::InvalidArgument("n".to_string()).is_fatal());
        assert!(TransferError::ChecksumMismatch {
            target: "obj".to_string(),
            expected: 1,
            actual: 2,
        }
        .is_fatal());
        assert!(!TransferError::Transport("reset".to_string()).is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TransferError::Transport("reset".to_string()).is_retryable());
        assert!(TransferError::service(503, "ServiceUnavailable", "busy").is_retryable());
        assert!(TransferError::service(400, "SlowDown", "throttled").is_retryable());
        assert!(!TransferError::service(403, "AccessDenied", "no").is_retryable());
        assert!(!TransferError::StaleCheckpoint("gone".to_string()).is_retryable());
        assert!(TransferError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_retryable());
        assert!(!TransferError::Io(io::Error::from(io::ErrorKind::NotFound)).is_retryable());
    }

    #[test]
    fn test_part_context_delegates() {
        let err = TransferError::service(500, "InternalError", "boom").for_part(7);
        assert_eq!(err.part_number(), Some(7));
        assert!(err.is_retryable());
        assert_eq!(err.service_code(), Some("InternalError"));
        assert_eq!(err.category(), ErrorCategory::Service);

        // Wrapping twice keeps the first attribution
        let rewrapped = err.for_part(9);
        assert_eq!(rewrapped.part_number(), Some(7));
    }

    #[test]
    fn test_error_display() {
        let err = TransferError::ChecksumMismatch {
            target: "bucket/key".to_string(),
            expected: 0xabc,
            actual: 0xdef,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch for bucket/key: expected 0000000000000abc, got 0000000000000def"
        );
        assert_eq!(err.exit_code(), EXIT_INTEGRITY);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            TransferError::InvalidArgument("x".to_string()).exit_code(),
            EXIT_FATAL
        );
        assert_eq!(TransferError::Cancelled.exit_code(), EXIT_PARTIAL);
    }
}
