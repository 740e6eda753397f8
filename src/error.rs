//! Error codes and the crate-wide Result alias.
//!
//! Every failure inside the engine is raised as an [`Error`] carrying a
//! status code; the public API surfaces the code unchanged. Codes are
//! stable numeric values so callers can match on them across versions.

use thiserror::Error;

/// Status codes returned by all public operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation completed successfully
    #[error("success")]
    Success = 0,

    // ------------------------------------------------------------------
    // Invalid arguments
    // ------------------------------------------------------------------
    /// Invalid function parameter
    #[error("invalid parameter")]
    InvParameter = -1,
    /// Invalid key size for this database
    #[error("invalid key size")]
    InvKeySize = -3,
    /// Invalid record size for this database
    #[error("invalid record size")]
    InvRecordSize = -4,
    /// Invalid page size (must be a power-of-two multiple of 1 KiB)
    #[error("invalid page size")]
    InvPageSize = -5,
    /// Invalid or corrupt file header
    #[error("invalid file header")]
    InvFileHeader = -9,
    /// Invalid file version
    #[error("invalid file version")]
    InvFileVersion = -10,

    // ------------------------------------------------------------------
    // Not found / empty
    // ------------------------------------------------------------------
    /// Key was not found
    #[error("key not found")]
    KeyNotFound = -11,
    /// Database does not exist
    #[error("database not found")]
    DatabaseNotFound = -30,
    /// Cursor does not point to a valid item
    #[error("cursor is nil")]
    CursorIsNil = -100,

    // ------------------------------------------------------------------
    // Conflict / duplicate
    // ------------------------------------------------------------------
    /// Key already exists
    #[error("duplicate key")]
    DuplicateKey = -12,
    /// Conflict with a concurrent transaction
    #[error("transaction conflict")]
    TxnConflict = -33,
    /// Database is already open
    #[error("database already open")]
    DatabaseAlreadyOpen = -32,
    /// Database still has open cursors
    #[error("cursor still open")]
    CursorStillOpen = -34,
    /// Transaction is still open
    #[error("transaction still open")]
    TxnStillOpen = -35,

    // ------------------------------------------------------------------
    // Capacity
    // ------------------------------------------------------------------
    /// Object was not initialized correctly
    #[error("not ready")]
    NotReady = -23,
    /// A resource limit was reached
    #[error("limits reached")]
    LimitsReached = -24,
    /// Memory allocation failed
    #[error("out of memory")]
    OutOfMemory = -6,

    // ------------------------------------------------------------------
    // Durability / integrity
    // ------------------------------------------------------------------
    /// Device read or write failed
    #[error("i/o error")]
    IoError = -18,
    /// Structural integrity of the file is violated
    #[error("integrity violated")]
    IntegrityViolated = -13,
    /// Key was erased in a pending transaction
    #[error("key erased in transaction")]
    KeyErasedInTxn = -36,

    // ------------------------------------------------------------------
    // Environment state
    // ------------------------------------------------------------------
    /// Database opened read-only
    #[error("write protected")]
    WriteProtected = -15,
    /// File is locked by another process
    #[error("would block")]
    WouldBlock = -22,
    /// Functionality is not implemented
    #[error("not implemented")]
    NotImplemented = -20,
    /// Internal error
    #[error("internal error")]
    InternalError = -14,
}

/// The error type raised by every fallible operation in the crate.
///
/// Wraps an [`ErrorCode`] plus an optional context message. The code is
/// what matters for control flow; the message is for humans and logs.
#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
}

impl Error {
    /// Create an error from a bare status code.
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
        }
    }

    /// Create an error with a context message.
    pub fn with_message<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Error {
            code,
            message: Some(message.into()),
        }
    }

    /// The status code of this error.
    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorCode::WriteProtected,
            std::io::ErrorKind::WouldBlock => ErrorCode::WouldBlock,
            std::io::ErrorKind::OutOfMemory => ErrorCode::OutOfMemory,
            _ => ErrorCode::IoError,
        };
        Error::with_message(code, err.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        let err = Error::new(ErrorCode::KeyNotFound);
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
        assert_eq!(err.to_string(), "key not found");
    }

    #[test]
    fn test_error_with_message() {
        let err = Error::with_message(ErrorCode::IoError, "short read");
        assert_eq!(err.code(), ErrorCode::IoError);
        assert_eq!(err.to_string(), "i/o error: short read");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::WouldBlock, "locked");
        let err: Error = io.into();
        assert_eq!(err.code(), ErrorCode::WouldBlock);
    }
}
