//! Names, suffixes and signatures of the supported formats.

use crate::Compression;
use crate::error::{Error, ErrorKind};
use std::ffi::OsStr;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::Path;
use std::str::FromStr;

// Formats this crate knows about, whether or not they are compiled in.
const KNOWN: &[&str] = &["none", "bzip2", "bz2", "gzip", "gz", "xz", "lzma", "zstd", "zst"];

impl Compression {
    /// Every format compiled into this build, [`None`](Self::None) first.
    pub fn available() -> Vec<Compression> {
        let mut formats = vec![Compression::None, Compression::Bzip2, Compression::Gzip];
        #[cfg(feature = "xz")]
        formats.push(Compression::Xz);
        #[cfg(feature = "zstd")]
        formats.push(Compression::Zstd);
        formats
    }

    /// Name stored in the catalog and shown to users.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.names()[0]
    }

    /// Accepted spellings; the first is canonical.
    fn names(&self) -> &'static [&'static str] {
        match self {
            Compression::None => &["none"],
            Compression::Bzip2 => &["bzip2", "bz2"],
            Compression::Gzip => &["gzip", "gz"],
            #[cfg(feature = "xz")]
            Compression::Xz => &["xz", "lzma"],
            #[cfg(feature = "zstd")]
            Compression::Zstd => &["zstd", "zst"],
        }
    }

    /// Suffix of a member stored in this format, dot included. Empty for
    /// [`None`](Self::None).
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Bzip2 => ".bz2",
            Compression::Gzip => ".gz",
            #[cfg(feature = "xz")]
            Compression::Xz => ".xz",
            #[cfg(feature = "zstd")]
            Compression::Zstd => ".zst",
        }
    }

    /// The format a member name's suffix says it is stored in.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let Some(suffix) = path.as_ref().extension().and_then(OsStr::to_str) else {
            return Compression::None;
        };
        Self::available()
            .into_iter()
            .find(|format| format.extension().strip_prefix('.').is_some_and(|ext| ext.eq_ignore_ascii_case(suffix)))
            .unwrap_or_default()
    }

    /// The format whose signature `head` starts with.
    #[must_use]
    pub fn sniff(head: &[u8]) -> Self {
        match head {
            [0x42, 0x5A, 0x68, ..] => Compression::Bzip2,
            [0x1F, 0x8B, ..] => Compression::Gzip,
            #[cfg(feature = "xz")]
            [0xFD, b'7', b'z', b'X', b'Z', 0x00, ..] => Compression::Xz,
            #[cfg(feature = "zstd")]
            [0x28, 0xB5, 0x2F, 0xFD, ..] => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.to_lowercase();
        if let Some(format) = Self::available().into_iter().find(|f| f.names().contains(&name.as_str())) {
            return Ok(format);
        }
        if KNOWN.contains(&name.as_str()) {
            exn::bail!(ErrorKind::DisabledFormat(s.to_string()));
        }
        exn::bail!(ErrorKind::UnsupportedFormat(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::Compression;
    use rstest::rstest;

    #[rstest]
    #[case("none", Compression::None)]
    #[case("BZIP2", Compression::Bzip2)]
    #[case("gz", Compression::Gzip)]
    #[cfg_attr(feature = "xz", case("lzma", Compression::Xz))]
    #[cfg_attr(feature = "zstd", case("zst", Compression::Zstd))]
    fn test_from_str(#[case] name: &str, #[case] expected: Compression) {
        assert_eq!(name.parse::<Compression>().unwrap(), expected);
    }

    #[rstest]
    #[case("brotli")]
    #[case("")]
    fn test_from_str_unsupported(#[case] name: &str) {
        assert!(name.parse::<Compression>().is_err());
    }

    #[test]
    fn test_canonical_names_round_trip() {
        for format in Compression::available() {
            assert_eq!(format.as_str().parse::<Compression>().unwrap(), format);
            assert_eq!(format.to_string(), format.as_str());
        }
    }

    #[rstest]
    #[case("0000002a.file", Compression::None)]
    #[case("0000002a", Compression::None)]
    #[case(".gz", Compression::None)]
    #[case("0000002a.GZ", Compression::Gzip)]
    #[case("0000002a.bz2", Compression::Bzip2)]
    #[cfg_attr(feature = "xz", case("0000002a.xz", Compression::Xz))]
    fn test_from_path(#[case] name: &str, #[case] expected: Compression) {
        assert_eq!(Compression::from_path(name), expected);
    }

    #[rstest]
    #[case(b"plain text", Compression::None)]
    #[case(b"", Compression::None)]
    #[case(b"BZh91AY", Compression::Bzip2)]
    #[case(&[0x1F, 0x8B, 0x08, 0x00], Compression::Gzip)]
    #[cfg_attr(feature = "xz", case(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00], Compression::Xz))]
    #[cfg_attr(feature = "zstd", case(&[0x28, 0xB5, 0x2F, 0xFD], Compression::Zstd))]
    fn test_sniff(#[case] head: &[u8], #[case] expected: Compression) {
        assert_eq!(Compression::sniff(head), expected);
    }
}
