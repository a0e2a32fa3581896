//! Detection of content that will not shrink any further.
//!
//! Running an already-compressed file through XZ again burns CPU for a few
//! bytes at best (and often makes the output slightly larger), so these
//! files are stored as-is.

use crate::Compression;
use std::path::Path;

/// Number of leading bytes [`is_incompressible`] wants to look at.
pub const MAGIC_PEEK_LEN: usize = 8;

const EXTENSIONS: &[&str] = &[
    // Archives and compressed streams
    "7z", "bz2", "cab", "gz", "lz", "lz4", "lzma", "rar", "tgz", "txz", "xz", "zip", "zst",
    // Images
    "avif", "gif", "heic", "jpeg", "jpg", "png", "webp",
    // Audio
    "aac", "flac", "m4a", "mp3", "ogg", "opus", "wma",
    // Video
    "avi", "m4v", "mkv", "mov", "mp4", "webm", "wmv",
    // Documents that are zip containers under the hood
    "docx", "epub", "jar", "odt", "pptx", "xlsx",
];

const OTHER_MAGIC: &[&[u8]] = &[
    // zip (and every format built on it)
    b"PK\x03\x04",
    // 7z
    &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C],
    // png
    &[0x89, 0x50, 0x4E, 0x47],
    // jpeg
    &[0xFF, 0xD8, 0xFF],
    // rar
    b"Rar!",
];

/// Returns `true` if the file at `path` (whose first bytes are `head`) is
/// already compressed and should be stored without another compression pass.
///
/// The extension is checked first; `head` catches compressed files that have
/// been renamed. Pass an empty slice to rely on the extension alone.
#[must_use]
pub fn is_incompressible(path: impl AsRef<Path>, head: &[u8]) -> bool {
    let by_extension = path
        .as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext.to_lowercase().as_str()));
    by_extension
        || Compression::sniff(head) != Compression::None
        || OTHER_MAGIC.iter().any(|magic| head.starts_with(magic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("photo.JPG", b"", true)]
    #[case("song.mp3", b"", true)]
    #[case("notes.txt", b"hello world", false)]
    #[case("renamed.dat", &[0x1F, 0x8B, 0x08, 0x00], true)]
    #[case("renamed.bin", b"PK\x03\x04rest", true)]
    #[case("Makefile", b"all: build", false)]
    fn test_is_incompressible(#[case] path: &str, #[case] head: &[u8], #[case] expected: bool) {
        assert_eq!(is_incompressible(path, head), expected);
    }
}
