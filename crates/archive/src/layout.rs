//! On-disk layout of a backup group's data directory.
//!
//! ```text
//! <data_dir>/
//! ├── catalog.sqlite   metadata store
//! ├── lock.json        process lock
//! ├── staging/         archives being written by the current run
//! ├── ready/           published archives
//! ├── removed/         archives expired by compaction, awaiting deletion
//! └── scratch/         temporary files (compressed members, extractions)
//! ```

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every working directory. Failure here is fatal to any run.
    pub fn create(&self) -> Result<()> {
        for dir in [self.root.clone(), self.staging(), self.ready(), self.removed(), self.scratch()] {
            std::fs::create_dir_all(&dir).or_raise(|| ErrorKind::Workspace(dir.clone()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> PathBuf {
        self.root.join("catalog.sqlite")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join("lock.json")
    }

    pub fn staging(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn ready(&self) -> PathBuf {
        self.root.join("ready")
    }

    pub fn removed(&self) -> PathBuf {
        self.root.join("removed")
    }

    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_builds_every_directory() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().join("group"));
        layout.create().unwrap();
        for sub in [layout.staging(), layout.ready(), layout.removed(), layout.scratch()] {
            assert!(sub.is_dir(), "{} should exist", sub.display());
        }
    }

    #[test]
    fn test_create_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("group");
        std::fs::write(&root, b"not a directory").unwrap();
        let err = Layout::new(&root).create().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Workspace(_)));
    }
}
