//! Bounded retry-with-sleep for filesystem and subprocess calls.
//!
//! Antivirus scanners, indexers and sync clients routinely hold files open for
//! a moment. Every disk or process operation in the engine goes through
//! [`RetryPolicy::run`] so those sharing violations don't fail a whole run.

use std::io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult};
use std::time::Duration;

pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(250);

/// How often, and how patiently, to retry a transient failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero behaves as one.
    pub attempts: u32,
    /// Fixed sleep between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: DEFAULT_ATTEMPTS, delay: DEFAULT_DELAY }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self { attempts: 1, delay: Duration::ZERO }
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// attempts are exhausted. The last error is returned unchanged.
    pub fn run<T>(&self, op_name: &str, mut f: impl FnMut() -> IoResult<T>) -> IoResult<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < attempts => {
                    tracing::warn!(
                        operation = op_name,
                        attempt,
                        attempts,
                        error = %err,
                        "transient failure, retrying",
                    );
                    std::thread::sleep(self.delay);
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }
}

/// Whether an I/O error is likely to go away on its own.
pub fn is_transient(err: &IoError) -> bool {
    matches!(
        err.kind(),
        // Windows reports sharing violations as permission denied.
        IoErrorKind::PermissionDenied | IoErrorKind::Interrupted | IoErrorKind::WouldBlock | IoErrorKind::TimedOut
    )
}
