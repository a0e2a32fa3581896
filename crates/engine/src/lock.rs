//! Advisory lock that keeps two processes off the same backup group.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use time::{Duration, UtcDateTime};

const STALE_AFTER: Duration = Duration::hours(6);

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    pid: u32,
    /// Unix seconds.
    acquired_at: i64,
}

/// Held for as long as an operation runs; the lock file is removed on drop.
#[derive(Debug)]
pub struct GroupLock {
    path: PathBuf,
}

impl GroupLock {
    /// Create the lock file at `path`, failing with [`ErrorKind::Locked`] if
    /// another process holds it. A lock older than six hours is assumed to
    /// have been left behind by a crash and is broken.
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::acquire_at(path, UtcDateTime::now())
    }

    fn acquire_at(path: &Path, now: UtcDateTime) -> Result<Self> {
        let entry = LockEntry { pid: std::process::id(), acquired_at: now.unix_timestamp() };
        // Second attempt only happens after a stale lock was removed.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let json = serde_json::to_vec(&entry).or_raise(|| ErrorKind::Lock(path.to_path_buf()))?;
                    file.write_all(&json).or_raise(|| ErrorKind::Lock(path.to_path_buf()))?;
                    file.sync_all().or_raise(|| ErrorKind::Lock(path.to_path_buf()))?;
                    tracing::debug!(path = %path.display(), pid = entry.pid, "acquired group lock");
                    return Ok(Self { path: path.to_path_buf() });
                },
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                    let (holder, acquired_at) = Self::holder(path)?;
                    if now - acquired_at < STALE_AFTER {
                        exn::bail!(ErrorKind::Locked(holder));
                    }
                    tracing::warn!(
                        path = %path.display(),
                        %holder,
                        acquired_at = acquired_at.unix_timestamp(),
                        "breaking stale group lock",
                    );
                    match fs::remove_file(path) {
                        Ok(()) => {},
                        Err(e) if e.kind() == IoErrorKind::NotFound => {},
                        Err(e) => return Err(e).or_raise(|| ErrorKind::Lock(path.to_path_buf())),
                    }
                },
                Err(e) => return Err(e).or_raise(|| ErrorKind::Lock(path.to_path_buf())),
            }
        }
        exn::bail!(ErrorKind::Locked(format!("another process ({})", path.display())))
    }

    /// Who holds the lock, and since when. A lock file that can't be parsed
    /// (for example, one whose writer crashed mid-write) is dated by its
    /// modification time.
    fn holder(path: &Path) -> Result<(String, UtcDateTime)> {
        let bytes = fs::read(path).or_raise(|| ErrorKind::Lock(path.to_path_buf()))?;
        if let Ok(entry) = serde_json::from_slice::<LockEntry>(&bytes)
            && let Ok(acquired_at) = UtcDateTime::from_unix_timestamp(entry.acquired_at)
        {
            return Ok((format!("pid {}", entry.pid), acquired_at));
        }
        let modified =
            fs::metadata(path).and_then(|m| m.modified()).or_raise(|| ErrorKind::Lock(path.to_path_buf()))?;
        Ok(("an unknown process".to_string(), UtcDateTime::from(modified)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GroupLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release group lock");
        }
    }
}
