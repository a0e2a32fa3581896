//! What each operation hands back to the caller.
//!
//! Nothing recoverable is dropped: anything that went wrong with a single
//! file or archive ends up as an [`Issue`] on the report.

use coffer_catalog::CollectionId;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};

/// A recoverable problem, reported at the end of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issue {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self { path: Some(path.as_ref().to_path_buf()), message: message.into() }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self { path: None, message: message.into() }
    }
}

impl Display for Issue {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path.display(), self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupReport {
    /// Unset for previews, which never create a collection.
    pub collection: Option<CollectionId>,
    /// Paths seen for the first time.
    pub new: u64,
    /// Tracked paths whose length or modification time changed.
    pub changed: u64,
    /// Tracked paths taken over from the previous run without hashing.
    pub unchanged: u64,
    /// Paths hashed in phase two.
    pub hashed: u64,
    /// Hashed paths whose content was already stored.
    pub deduplicated: u64,
    /// Content records created (and members packed) by this run.
    pub new_contents: u64,
    /// Bytes written into this run's archives.
    pub new_bytes: u64,
    /// Queued paths that disappeared before they could be hashed.
    pub vanished: u64,
    /// Records of paths that disappeared in an earlier run, dropped now.
    pub forgotten: u64,
    /// Names of the archives published by this run.
    pub archives: Vec<String>,
    pub issues: Vec<Issue>,
}

impl BackupReport {
    /// Paths that need hashing: everything new or changed.
    pub fn queued(&self) -> u64 {
        self.new + self.changed
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub matched: u64,
    pub restored: u64,
    /// Every matched path, in catalog order. Only filled in for previews.
    pub paths: Vec<PathBuf>,
    /// Restored files that may not reflect the chosen collection exactly.
    pub caveats: Vec<Issue>,
    pub issues: Vec<Issue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactReport {
    /// The collection at and below which content was expired; unset when no
    /// collection was old enough.
    pub cutoff: Option<CollectionId>,
    pub removed_archives: Vec<String>,
    pub stripped_archives: Vec<String>,
    pub deleted_contents: u64,
    pub deleted_files: u64,
    /// Stored bytes belonging to the expired content.
    pub reclaimed_bytes: u64,
    pub issues: Vec<Issue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Archives with a live checksum that were checked.
    pub checked: u64,
    /// Archives that passed every check.
    pub passed: u64,
    /// Archives compaction has emptied; remote copies of these can go.
    pub safe_to_delete: Vec<String>,
    /// Passing archives that still hold members nothing refers to. A
    /// thorough compaction rebuilds them.
    pub reclaimable: Vec<Issue>,
    pub issues: Vec<Issue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_display() {
        assert_eq!(Issue::new("/a/b", "unreadable").to_string(), "/a/b: unreadable");
        assert_eq!(Issue::general("archive missing").to_string(), "archive missing");
    }

    #[test]
    fn test_queued_counts_new_and_changed() {
        let report = BackupReport { new: 3, changed: 2, unchanged: 10, ..Default::default() };
        assert_eq!(report.queued(), 5);
    }
}
