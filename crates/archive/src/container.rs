//! The container-tool seam.
//!
//! The Archive Manager, Restore and Compaction only ever talk to a
//! [`ContainerTool`]. Whether members end up in a tar file written in-process
//! or in a 7z file written by an external binary is decided once, when the
//! group's [`ContainerFormat`] is resolved.

use crate::error::{ErrorKind, Result};
use crate::retry::RetryPolicy;
use crate::sevenzip::SevenZipContainer;
use crate::tarball::TarContainer;
use coffer_compress::Compression;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::Path;
use std::str::FromStr;

/// A named member of a container and its stored (uncompressed-by-container) size.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Member {
    pub name: String,
    pub size: u64,
}

impl Member {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self { name: name.into(), size }
    }
}

/// Which members [`ContainerTool::extract`] should pull out.
#[derive(Clone, Copy, Debug)]
pub enum Selection<'a> {
    Member(&'a str),
    All,
}

pub trait ContainerTool {
    /// Container file extension, without the leading dot.
    fn extension(&self) -> &'static str;

    /// Compression applied to members that are worth compressing.
    fn member_compression(&self) -> Compression {
        #[cfg(feature = "xz")]
        {
            Compression::Xz
        }
        #[cfg(not(feature = "xz"))]
        {
            Compression::Gzip
        }
    }

    /// Append the file at `input` to `container` (created if missing) under
    /// the name `member`. Fails if `input` is not `expected_size` bytes long.
    fn add(&self, container: &Path, input: &Path, member: &str, expected_size: u64) -> Result<()>;

    /// Every member of `container` with its size.
    fn list(&self, container: &Path) -> Result<Vec<Member>>;

    /// Extract members of `container` into `destination`, flat, each under
    /// its member name.
    fn extract(&self, container: &Path, selection: Selection<'_>, destination: &Path) -> Result<()>;

    /// Compress `input` into `output`, returning the compressed size.
    fn compress(&self, input: &Path, output: &Path) -> Result<u64> {
        self.member_compression().compress_file(input, output).map_err(ErrorKind::compression)
    }

    /// Decompress `input` into `output` according to `compression`, returning
    /// the decompressed size.
    fn decompress(&self, compression: Compression, input: &Path, output: &Path) -> Result<u64> {
        compression.decompress_file(input, output).map_err(ErrorKind::compression)
    }

    /// Confirm the container holds exactly `expected`: every member present
    /// with the right size, and nothing else.
    fn verify(&self, container: &Path, expected: &[Member]) -> Result<()> {
        let actual = self.list(container)?;
        compare_members(&actual, expected).map_err(|problem| exn::Exn::from(ErrorKind::Verification(problem)))
    }
}

/// Describe the first difference between two member listings.
pub(crate) fn compare_members(actual: &[Member], expected: &[Member]) -> std::result::Result<(), String> {
    let mut listed: BTreeMap<&str, u64> = BTreeMap::new();
    for member in actual {
        if listed.insert(member.name.as_str(), member.size).is_some() {
            return Err(format!("member {} appears more than once", member.name));
        }
    }
    for member in expected {
        match listed.remove(member.name.as_str()) {
            None => return Err(format!("member {} is missing", member.name)),
            Some(size) if size != member.size => {
                return Err(format!("member {} is {size} bytes, expected {}", member.name, member.size));
            },
            Some(_) => {},
        }
    }
    match listed.into_keys().next() {
        Some(name) => Err(format!("unexpected member {name}")),
        None => Ok(()),
    }
}

/// The container formats a group can be configured with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    #[default]
    Tar,
    SevenZip,
}

impl ContainerFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::Tar => "tar",
            ContainerFormat::SevenZip => "7z",
        }
    }

    /// Build the tool for this format. External tools are located now, so a
    /// missing binary fails before any work starts.
    pub fn open(&self, retry: RetryPolicy) -> Result<Box<dyn ContainerTool>> {
        Ok(match self {
            ContainerFormat::Tar => Box::new(TarContainer::new(retry)),
            ContainerFormat::SevenZip => Box::new(SevenZipContainer::discover(retry)?),
        })
    }
}

impl Display for ContainerFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerFormat {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tar" => Ok(ContainerFormat::Tar),
            "7z" | "7zip" | "sevenzip" => Ok(ContainerFormat::SevenZip),
            other => Err(format!("unknown container format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn members(list: &[(&str, u64)]) -> Vec<Member> {
        list.iter().map(|(name, size)| Member::new(*name, *size)).collect()
    }

    #[test]
    fn test_identical_listings_match() {
        let list = members(&[("00000001.file", 10), ("00000002.xz", 4)]);
        assert_eq!(compare_members(&list, &list), Ok(()));
    }

    #[rstest]
    #[case::missing(&[("00000001.file", 10)], "member 00000002.xz is missing")]
    #[case::wrong_size(&[("00000001.file", 10), ("00000002.xz", 5)], "member 00000002.xz is 5 bytes, expected 4")]
    #[case::unexpected(
        &[("00000001.file", 10), ("00000002.xz", 4), ("00000003.file", 1)],
        "unexpected member 00000003.file"
    )]
    #[case::duplicate(&[("00000001.file", 10), ("00000001.file", 10)], "member 00000001.file appears more than once")]
    fn test_mismatches_are_described(#[case] actual: &[(&str, u64)], #[case] problem: &str) {
        let expected = members(&[("00000001.file", 10), ("00000002.xz", 4)]);
        assert_eq!(compare_members(&members(actual), &expected), Err(problem.to_string()));
    }

    #[rstest]
    #[case("tar", ContainerFormat::Tar)]
    #[case("7z", ContainerFormat::SevenZip)]
    #[case("7Zip", ContainerFormat::SevenZip)]
    fn test_format_from_str(#[case] input: &str, #[case] expected: ContainerFormat) {
        assert_eq!(input.parse::<ContainerFormat>().unwrap(), expected);
    }
}
