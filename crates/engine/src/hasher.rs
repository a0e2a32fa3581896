//! The Content Hasher: a stable identity for the logical content of a file.
//!
//! Content is deduplicated on `(hash, length)`. For ordinary files both
//! cover every byte. For audio files hashed with metadata separation they
//! cover only the payload, so re-tagging a file doesn't store it twice.

use crate::error::{ErrorKind, Result};
use crate::tags::TagTool;
use coffer_catalog::{FileRecord, FileStatus, NewContent};
use coffer_config::ScanMode;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use time::UtcDateTime;

const BUFFER_SIZE: usize = 64 * 1024;

/// The deduplication key of a piece of content, plus its CRC32.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// BLAKE3, lowercase hex.
    pub hash: String,
    pub crc32: u32,
    /// Comparable length: what was hashed, not necessarily the file size.
    pub length: u64,
}

impl From<Identity> for NewContent {
    fn from(identity: Identity) -> Self {
        NewContent { hash: identity.hash, crc32: identity.crc32, length: identity.length }
    }
}

/// Hash and checksum everything `reader` yields.
pub fn hash_reader(mut reader: impl Read) -> std::io::Result<Identity> {
    let mut hasher = blake3::Hasher::new();
    let mut crc = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut length = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
        crc.update(&buffer[..read]);
        length += read as u64;
    }
    Ok(Identity { hash: hasher.finalize().to_hex().to_string(), crc32: crc.finalize(), length })
}

/// Lowercase extension, used as the detected file type.
pub(crate) fn detected_type(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_lowercase)
}

/// Whether a tracked file can be taken over from the previous run without
/// being hashed again.
///
/// In [`ScanMode::Fast`] a file with the same length and modification time
/// as last time is assumed unchanged. Content edited in place without either
/// changing is missed; [`ScanMode::Full`] never takes this shortcut.
pub fn is_unchanged(record: &FileRecord, length: u64, modified: UtcDateTime, mode: ScanMode) -> bool {
    mode == ScanMode::Fast
        && record.status == FileStatus::Complete
        && record.content.is_some()
        && record.length == length
        // The catalog keeps whole seconds.
        && record.modified.unix_timestamp() == modified.unix_timestamp()
}

#[derive(Clone, Copy)]
pub struct Hasher<'a> {
    separate_metadata: bool,
    tags: Option<&'a dyn TagTool>,
}

impl<'a> Hasher<'a> {
    /// A hasher that covers every byte of every file.
    pub fn plain() -> Self {
        Self { separate_metadata: false, tags: None }
    }

    /// A hasher that hands files `tags` supports to it, excluding their
    /// metadata from the identity.
    pub fn separating(tags: &'a dyn TagTool) -> Self {
        Self { separate_metadata: true, tags: Some(tags) }
    }

    /// Compute the identity of `file`, opened from `path`.
    pub fn identify(&self, path: &Path, file: File) -> Result<Identity> {
        if self.separate_metadata
            && let Some(tags) = self.tags
            && detected_type(path).is_some_and(|t| tags.supports(&t))
        {
            drop(file);
            return tags.strip_and_hash(path);
        }
        Ok(hash_reader(file).map_err(ErrorKind::Io)?)
    }

    /// Open `path` and compute its identity.
    pub fn identify_path(&self, path: &Path) -> Result<Identity> {
        let file = File::open(path).map_err(ErrorKind::Io)?;
        self.identify(path, file)
    }
}
