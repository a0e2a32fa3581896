use crate::error::{ErrorKind, Result};
use std::fs::File;
use std::path::Path;

/// BLAKE3 (lowercase hex) of a whole archive file, as recorded in the catalog.
pub fn file_checksum(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| ErrorKind::io(e, path))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(file).map_err(|e| ErrorKind::io(e, path))?;
    Ok(hasher.finalize().to_hex().to_string())
}
