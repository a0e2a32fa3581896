//! Pure-library tar backend.
//!
//! Members are appended to an existing archive by overwriting its
//! end-of-archive marker (two zeroed 512-byte blocks) with the new entry and
//! writing a fresh marker after it, so an archive is never rewritten from
//! scratch while a run is packing it.

use crate::container::{ContainerTool, Member, Selection};
use crate::error::{ErrorKind, Result};
use crate::retry::RetryPolicy;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::instrument;

const BLOCK: u64 = 512;
const END_MARKER: u64 = 2 * BLOCK;

#[derive(Clone, Debug, Default)]
pub struct TarContainer {
    retry: RetryPolicy,
}

impl TarContainer {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    fn append(container: &Path, input: &Path, member: &str, expected_size: u64) -> std::io::Result<AppendOutcome> {
        let mut source = File::open(input)?;
        let size = source.metadata()?.len();
        if size != expected_size {
            return Ok(AppendOutcome::SizeMismatch(size));
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(container)?;
        let length = file.metadata()?.len();
        if length > 0 {
            if length < END_MARKER || length % BLOCK != 0 {
                return Ok(AppendOutcome::Corrupt);
            }
            let mut marker = [0u8; END_MARKER as usize];
            file.seek(SeekFrom::Start(length - END_MARKER))?;
            file.read_exact(&mut marker)?;
            if marker.iter().any(|&b| b != 0) {
                return Ok(AppendOutcome::Corrupt);
            }
            file.seek(SeekFrom::Start(length - END_MARKER))?;
        }
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(0);
        let mut builder = tar::Builder::new(BufWriter::new(file));
        builder.append_data(&mut header, member, &mut source)?;
        // Writes the new end-of-archive marker.
        let writer = builder.into_inner()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(AppendOutcome::Appended)
    }

    fn read_entries(container: &Path) -> std::io::Result<Vec<Member>> {
        let mut archive = tar::Archive::new(File::open(container)?);
        let mut members = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            members.push(Member { name, size: entry.header().size()? });
        }
        Ok(members)
    }

    fn unpack(container: &Path, selection: Selection<'_>, destination: &Path) -> std::io::Result<bool> {
        let mut archive = tar::Archive::new(File::open(container)?);
        let mut found = false;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let wanted = match selection {
                Selection::Member(member) => name == member,
                Selection::All => true,
            };
            // Members are always flat; anything with a separator was not
            // written by us and is not unpacked.
            if !wanted || name.contains(['/', '\\']) {
                continue;
            }
            entry.unpack(destination.join(&name))?;
            found = true;
            if matches!(selection, Selection::Member(_)) {
                break;
            }
        }
        Ok(found)
    }
}

enum AppendOutcome {
    Appended,
    SizeMismatch(u64),
    Corrupt,
}

impl ContainerTool for TarContainer {
    fn extension(&self) -> &'static str {
        "tar"
    }

    #[instrument(skip(self, container, input), fields(container = %container.display()))]
    fn add(&self, container: &Path, input: &Path, member: &str, expected_size: u64) -> Result<()> {
        let outcome = self
            .retry
            .run("tar append", || Self::append(container, input, member, expected_size))
            .map_err(|e| ErrorKind::io(e, container))?;
        match outcome {
            AppendOutcome::Appended => Ok(()),
            AppendOutcome::SizeMismatch(actual) => exn::bail!(ErrorKind::Verification(format!(
                "{} is {actual} bytes, expected {expected_size}",
                input.display()
            ))),
            AppendOutcome::Corrupt => exn::bail!(ErrorKind::Corrupt(container.to_path_buf())),
        }
    }

    fn list(&self, container: &Path) -> Result<Vec<Member>> {
        let members = self
            .retry
            .run("tar list", || Self::read_entries(container))
            .map_err(|e| ErrorKind::io(e, container))?;
        Ok(members)
    }

    #[instrument(skip(self, container, destination), fields(container = %container.display()))]
    fn extract(&self, container: &Path, selection: Selection<'_>, destination: &Path) -> Result<()> {
        let found = self
            .retry
            .run("tar extract", || Self::unpack(container, selection, destination))
            .map_err(|e| ErrorKind::io(e, container))?;
        match (found, selection) {
            (false, Selection::Member(member)) => exn::bail!(ErrorKind::MemberNotFound(member.to_string())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_append_to_new_and_existing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let tool = TarContainer::default();
        let container = dir.path().join("00000001_0001.tar");
        let a = write(dir.path(), "a", b"hello");
        let b = write(dir.path(), "b", &[7u8; 1500]);

        tool.add(&container, &a, "00000001.file", 5).unwrap();
        tool.add(&container, &b, "00000002.file", 1500).unwrap();

        let listed = tool.list(&container).unwrap();
        assert_eq!(listed, vec![Member::new("00000001.file", 5), Member::new("00000002.file", 1500)]);
        tool.verify(&container, &listed).unwrap();
    }

    #[test]
    fn test_size_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let tool = TarContainer::default();
        let container = dir.path().join("c.tar");
        let a = write(dir.path(), "a", b"hello");
        let err = tool.add(&container, &a, "00000001.file", 6).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Verification(_)));
    }

    #[test]
    fn test_extract_single_member() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let tool = TarContainer::default();
        let container = dir.path().join("c.tar");
        tool.add(&container, &write(dir.path(), "a", b"first"), "00000001.file", 5).unwrap();
        tool.add(&container, &write(dir.path(), "b", b"second"), "00000002.file", 6).unwrap();

        tool.extract(&container, Selection::Member("00000002.file"), out.path()).unwrap();
        assert_eq!(fs::read(out.path().join("00000002.file")).unwrap(), b"second");
        assert!(!out.path().join("00000001.file").exists());

        let err = tool.extract(&container, Selection::Member("00000003.file"), out.path()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::MemberNotFound(_)));
    }

    #[test]
    fn test_extract_all() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let tool = TarContainer::default();
        let container = dir.path().join("c.tar");
        tool.add(&container, &write(dir.path(), "a", b"first"), "00000001.file", 5).unwrap();
        tool.add(&container, &write(dir.path(), "b", b""), "00000002.file", 0).unwrap();
        tool.extract(&container, Selection::All, out.path()).unwrap();
        assert_eq!(fs::read(out.path().join("00000001.file")).unwrap(), b"first");
        assert_eq!(fs::read(out.path().join("00000002.file")).unwrap(), b"");
    }

    #[test]
    fn test_garbage_container_is_not_appended_to() {
        let dir = tempfile::tempdir().unwrap();
        let tool = TarContainer::default();
        let container = write(dir.path(), "c.tar", &[1u8; 2048]);
        let a = write(dir.path(), "a", b"hello");
        let err = tool.add(&container, &a, "00000001.file", 5).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }

    #[test]
    fn test_compress_roundtrip_uses_member_compression() {
        let dir = tempfile::tempdir().unwrap();
        let tool = TarContainer::default();
        let input = write(dir.path(), "plain", &b"compressible ".repeat(200));
        let packed = dir.path().join("packed");
        let size = tool.compress(&input, &packed).unwrap();
        assert_eq!(size, fs::metadata(&packed).unwrap().len());
        let unpacked = dir.path().join("unpacked");
        tool.decompress(tool.member_compression(), &packed, &unpacked).unwrap();
        assert_eq!(fs::read(unpacked).unwrap(), fs::read(input).unwrap());
    }
}
