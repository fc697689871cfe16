//! Errors returned by remote service clients.

use std::io;
use thiserror::Error;

/// Error returned by a [`RemoteClient`](crate::RemoteClient) call.
///
/// Only [`RemoteError::Status`] carries a structured POSIX code chosen by the
/// backend. Every other variant is a failure of the client itself and has no
/// code the adapter could pass through.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The backend rejected the call with a numeric POSIX error code.
    #[error("remote status {code}: {message}")]
    Status {
        /// POSIX errno chosen by the backend.
        code: i32,
        /// Human-readable context from the backend.
        message: String,
    },

    /// The call never produced a backend answer (connection reset, codec failure).
    #[error("transport failure: {0}")]
    Transport(String),

    /// Local I/O failure inside the client.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No client is available for the URL scheme.
    #[error("unsupported server scheme: {0}")]
    UnsupportedScheme(String),

    /// The server URL could not be parsed.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

impl RemoteError {
    /// Builds a structured backend error.
    pub fn status(code: i32, message: impl Into<String>) -> Self {
        RemoteError::Status {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a `ENOENT` status naming the missing path.
    pub fn not_found(path: &str) -> Self {
        Self::status(libc::ENOENT, format!("no such file or directory: {path}"))
    }

    /// Returns the backend code if this error carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            RemoteError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;
