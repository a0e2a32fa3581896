//! Filesystem traversal of a group's roots.

use crate::error::{ErrorKind, Result};
use crate::report::Issue;
use exn::ResultExt;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use walkdir::WalkDir;

/// A regular file as found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observed {
    pub path: PathBuf,
    pub length: u64,
    pub modified: UtcDateTime,
    pub permissions: u32,
}

impl Observed {
    pub(crate) fn from_metadata(path: &Path, metadata: &Metadata) -> std::io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            length: metadata.len(),
            modified: UtcDateTime::from(metadata.modified()?),
            permissions: permissions(metadata),
        })
    }
}

#[cfg(unix)]
fn permissions(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions(_metadata: &Metadata) -> u32 {
    0
}

pub fn exclusions(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).or_raise(|| ErrorKind::Pattern(pattern.clone()))?);
    }
    builder.build().or_raise(|| ErrorKind::Pattern(patterns.join(", ")))
}

/// Every regular file under `roots` not matched by `exclude`, sorted by path.
///
/// Symbolic links are not followed. Directories matched by `exclude` are not
/// descended into. Anything that can't be read becomes an [`Issue`].
pub fn walk(roots: &[PathBuf], exclude: &GlobSet, issues: &mut Vec<Issue>) -> Vec<Observed> {
    let mut found = Vec::new();
    for root in roots {
        if !root.exists() {
            issues.push(Issue::new(root, "root does not exist"));
            continue;
        }
        let entries = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !exclude.is_match(entry.path()));
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                    issues.push(Issue::new(path, e.to_string()));
                    continue;
                },
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    issues.push(Issue::new(entry.path(), e.to_string()));
                    continue;
                },
            };
            match Observed::from_metadata(entry.path(), &metadata) {
                Ok(observed) => found.push(observed),
                Err(e) => issues.push(Issue::new(entry.path(), e.to_string())),
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    found.dedup_by(|a, b| a.path == b.path);
    tracing::debug!(files = found.len(), "walked roots");
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("docs/drafts")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::write(root.join("docs/a.txt"), b"a").unwrap();
        fs::write(root.join("docs/b.tmp"), b"bb").unwrap();
        fs::write(root.join("docs/drafts/c.txt"), b"ccc").unwrap();
        fs::write(root.join(".cache/d.bin"), b"dddd").unwrap();
        dir
    }

    fn names(found: &[Observed], root: &Path) -> Vec<String> {
        found.iter().map(|o| o.path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/")).collect()
    }

    #[test]
    fn test_walk_everything() {
        let dir = tree();
        let mut issues = Vec::new();
        let found = walk(&[dir.path().to_path_buf()], &exclusions(&[]).unwrap(), &mut issues);
        assert_eq!(names(&found, dir.path()), [".cache/d.bin", "docs/a.txt", "docs/b.tmp", "docs/drafts/c.txt"]);
        assert_eq!(found[1].length, 1);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_exclusions() {
        let dir = tree();
        let mut issues = Vec::new();
        let exclude = exclusions(&["**/*.tmp".to_string(), "**/.cache".to_string()]).unwrap();
        let found = walk(&[dir.path().to_path_buf()], &exclude, &mut issues);
        assert_eq!(names(&found, dir.path()), ["docs/a.txt", "docs/drafts/c.txt"]);
    }

    #[test]
    fn test_overlapping_roots_are_walked_once() {
        let dir = tree();
        let mut issues = Vec::new();
        let roots = [dir.path().to_path_buf(), dir.path().join("docs")];
        let found = walk(&roots, &exclusions(&[]).unwrap(), &mut issues);
        assert_eq!(found.len(), 4);
    }

    #[test]
    fn test_missing_root_is_an_issue() {
        let dir = tempfile::tempdir().unwrap();
        let mut issues = Vec::new();
        let found = walk(&[dir.path().join("nope")], &exclusions(&[]).unwrap(), &mut issues);
        assert!(found.is_empty());
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_invalid_pattern() {
        let err = exclusions(&["a[".to_string()]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Pattern(_)));
    }
}
