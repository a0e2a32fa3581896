//! Engine Error Types
//!
//! Every `Err` returned by an engine operation is fatal to that operation.
//! Problems that only affect a single file or archive are collected as
//! [`Issue`](crate::report::Issue)s on the operation's report instead.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Size accounting exceeded the integer range
    #[display("size overflow")]
    Overflow,
    /// A working directory could not be created
    #[display("cannot create working directory: {}", _0.display())]
    Workspace(#[error(not(source))] PathBuf),
    /// The settings persisted in the catalog are corrupt or don't match the configuration
    #[display("group settings: {_0}")]
    Settings(#[error(not(source))] String),
    /// An archive does not hold what the catalog says it holds
    #[display("verification failed: {_0}")]
    Verification(#[error(not(source))] String),
    /// Another process is working on this group
    #[display("group is locked by {_0}")]
    Locked(#[error(not(source))] String),
    /// The lock file could not be created or read
    #[display("lock error: {}", _0.display())]
    Lock(#[error(not(source))] PathBuf),
    /// Compaction was asked to act on a bucket it planned to keep
    #[display("nothing to compact in {_0}")]
    NothingToCompact(#[error(not(source))] String),
    #[display("catalog error")]
    Catalog,
    #[display("archive error")]
    Archive,
    /// A single file could not be restored
    #[display("cannot restore: {_0}")]
    Restore(#[error(not(source))] String),
    /// A glob pattern (exclusion or restore filter) could not be compiled
    #[display("invalid pattern: {_0}")]
    Pattern(#[error(not(source))] String),
    /// The configured tag tool is not installed
    #[display("tag tool not found: {}", _0.display())]
    TagToolNotFound(#[error(not(source))] PathBuf),
    /// The tag tool ran but did not produce a payload
    #[display("tag tool failed: {_0}")]
    TagTool(#[error(not(source))] String),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::Overflow.to_string(), "size overflow");
        assert_eq!(ErrorKind::Locked("pid 42".to_string()).to_string(), "group is locked by pid 42");
        assert_eq!(ErrorKind::Settings("bad".to_string()).to_string(), "group settings: bad");
    }

    #[test]
    fn error_kind_retryable() {
        assert!(ErrorKind::Locked("pid 42".to_string()).is_retryable());
        assert!(!ErrorKind::Verification("missing".to_string()).is_retryable());
        assert!(!ErrorKind::Catalog.is_retryable());
    }
}
