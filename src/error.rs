//! Closed error-kind taxonomy used by every public operation in this crate.
//!
//! Mirrors the original C++ implementation's `Status` type: a small, closed
//! set of kinds, each carrying a short human-readable message. There is
//! deliberately no `Ok` variant here -- success is `Result::Ok(T)`.

use std::fmt;

use snafu::Snafu;

/// The closed set of ways an operation on this store can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Underlying block device or index-file I/O failed.
    Io,
    /// A caller-supplied argument violates a documented precondition.
    InvalidArgument,
    /// A recoverable "no such thing" condition, used heavily by the path resolver.
    NotFound,
    /// Corrupt or unrecoverable state. The engine stays safe to close, but
    /// further operations on it will continue to fail.
    Fatal,
    /// The operation is not permitted given the object's current state
    /// (e.g. closing a claimed volume, unlinking a non-empty entry).
    InvalidOperation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Io => "IOError",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Fatal => "Fatal",
            ErrorKind::InvalidOperation => "InvalidOperation",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type. Carries a [`ErrorKind`] and a short message,
/// exactly as the original `Status` class did.
#[derive(Debug, Snafu)]
#[snafu(display("{kind}: {message}"))]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn io(message: impl Into<String>) -> Self {
        Error { kind: ErrorKind::Io, message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error { kind: ErrorKind::InvalidArgument, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error { kind: ErrorKind::NotFound, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Error { kind: ErrorKind::Fatal, message: message.into() }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error { kind: ErrorKind::InvalidOperation, message: message.into() }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::io(e.to_string())
    }
}

/// The crate-wide result alias. Every public operation returns one of these.
pub type Result<T> = std::result::Result<T, Error>;
