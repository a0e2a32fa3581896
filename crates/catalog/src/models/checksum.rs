use super::{from_sql_int, from_sql_time, to_sql_int, to_sql_time};
use crate::CollectionId;
use crate::error::{Error, ErrorKind, Result};
use std::str::FromStr;
use time::UtcDateTime;

const NO_LONGER_NEEDED: &str = "no_longer_needed";

/// The recorded whole-file checksum of an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Checksum {
    /// BLAKE3 hash (lowercase hex) of the archive file as published.
    Live(String),
    /// Every member was expired by compaction; any remote copy can go.
    NoLongerNeeded,
}

impl Checksum {
    fn as_str(&self) -> &str {
        match self {
            Checksum::Live(hash) => hash,
            Checksum::NoLongerNeeded => NO_LONGER_NEEDED,
        }
    }
}

impl From<String> for Checksum {
    fn from(value: String) -> Self {
        if value == NO_LONGER_NEEDED { Checksum::NoLongerNeeded } else { Checksum::Live(value) }
    }
}

/// What last happened to an archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveStatus {
    /// Written by a backup run.
    Active,
    /// Rebuilt by compaction with some members removed.
    Stripped,
    /// Removed entirely by compaction.
    Removed,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::Active => "active",
            ArchiveStatus::Stripped => "stripped",
            ArchiveStatus::Removed => "removed",
        }
    }
}

impl FromStr for ArchiveStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ArchiveStatus::Active),
            "stripped" => Ok(ArchiveStatus::Stripped),
            "removed" => Ok(ArchiveStatus::Removed),
            _ => exn::bail!(ErrorKind::InvalidData("archive status")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveChecksum {
    /// File name of the archive, e.g. `00000001_0001.tar`.
    pub name: String,
    pub checksum: Checksum,
    pub written_at: UtcDateTime,
    /// The compaction cutoff that produced this record, if any.
    pub cutoff: Option<CollectionId>,
    pub status: ArchiveStatus,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ChecksumRow {
    pub(crate) name: String,
    pub(crate) checksum: String,
    pub(crate) written_at: i64,
    pub(crate) cutoff: Option<i64>,
    pub(crate) status: String,
}

impl TryFrom<&ArchiveChecksum> for ChecksumRow {
    type Error = Error;
    fn try_from(record: &ArchiveChecksum) -> Result<Self> {
        Ok(Self {
            name: record.name.clone(),
            checksum: record.checksum.as_str().to_string(),
            written_at: to_sql_time(record.written_at),
            cutoff: record.cutoff.map(|c| to_sql_int(c, "cutoff")).transpose()?,
            status: record.status.as_str().to_string(),
        })
    }
}

impl TryFrom<ChecksumRow> for ArchiveChecksum {
    type Error = Error;
    fn try_from(row: ChecksumRow) -> Result<Self> {
        Ok(Self {
            name: row.name,
            checksum: Checksum::from(row.checksum),
            written_at: from_sql_time(row.written_at, "checksum timestamp")?,
            cutoff: row.cutoff.map(|c| from_sql_int(c, "cutoff")).transpose()?,
            status: row.status.parse()?,
        })
    }
}
