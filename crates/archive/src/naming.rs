//! File names of archives and of the members inside them.
//!
//! Archives are named `<collection>_<number>.<ext>` with fixed-width hex
//! fields so that a plain directory listing sorts them chronologically.
//! Members are named after their content id; the suffix tells a restore
//! whether the member needs decompressing.

use coffer_catalog::{ContentId, Location};
use coffer_compress::Compression;

/// Suffix of members stored byte-for-byte.
pub const RAW_SUFFIX: &str = ".file";
/// The human-readable index appended to every archive when enabled.
pub const MANIFEST: &str = "manifest.txt";

/// `00000001_0001.tar`
pub fn archive_name(location: Location, extension: &str) -> String {
    format!("{:08x}_{:04x}.{extension}", location.collection, location.archive)
}

/// Parse an archive file name back into its location, ignoring the extension.
pub fn parse_archive_name(name: &str) -> Option<Location> {
    let (stem, _extension) = name.split_once('.')?;
    let (collection, archive) = stem.split_once('_')?;
    if collection.len() != 8 || archive.len() != 4 {
        return None;
    }
    Some(Location {
        collection: u64::from_str_radix(collection, 16).ok()?,
        archive: u32::from_str_radix(archive, 16).ok()?,
    })
}

/// `0000002a.file` when stored raw, `0000002a.xz` when compressed.
pub fn member_name(id: ContentId, compression: Compression) -> String {
    match compression {
        Compression::None => format!("{id:08x}{RAW_SUFFIX}"),
        compression => format!("{id:08x}{}", compression.extension()),
    }
}

/// Parse a member name back into its content id and storage compression.
///
/// Returns `None` for anything that isn't a content member, such as the
/// manifest.
pub fn parse_member_name(name: &str) -> Option<(ContentId, Compression)> {
    let (stem, suffix) = name.split_once('.')?;
    if stem.len() < 8 || !stem.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let id = u64::from_str_radix(stem, 16).ok()?;
    if suffix == &RAW_SUFFIX[1..] {
        return Some((id, Compression::None));
    }
    match Compression::from_path(name) {
        Compression::None => None,
        compression => Some((id, compression)),
    }
}
