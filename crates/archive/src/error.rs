//! Archive Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use coffer_compress::error::{Error as CompressionError, ErrorKind as CompressionErrorKind};
use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::{Path, PathBuf};

/// An archive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File does not exist
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied, or the file is locked by another process
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// A working directory could not be created
    #[display("cannot create working directory: {}", _0.display())]
    Workspace(#[error(not(source))] PathBuf),
    /// The external container tool is not installed
    #[display("container tool not found (tried {_0})")]
    ToolNotFound(#[error(not(source))] &'static str),
    /// The external container tool ran but reported failure
    #[display("container tool failed: {_0}")]
    Tool(#[error(not(source))] String),
    /// The requested member is not inside the container
    #[display("member not found in archive: {_0}")]
    MemberNotFound(#[error(not(source))] String),
    /// The container does not hold exactly what was written into it
    #[display("archive failed verification: {_0}")]
    Verification(#[error(not(source))] String),
    /// The container is not in a format we can read or append to
    #[display("corrupt archive: {}", _0.display())]
    Corrupt(#[error(not(source))] PathBuf),
    /// Size accounting exceeded the integer range
    #[display("archive size overflow")]
    Overflow,
    /// Compression/decompression error
    #[display("compression error: {_0}")]
    Compression(CompressionErrorKind),
}

impl ErrorKind {
    /// Convert a compression error into an archive error, preserving the
    /// compress crate's `Exn` frame as a child in its own error tree.
    #[track_caller]
    pub fn compression(err: CompressionError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Compression(inner))
    }

    pub(crate) fn io(err: IoError, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(err),
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::PermissionDenied(_))
    }
}
