use super::{from_sql_int, sqlx_hates_paths, to_sql_int};
use crate::error::{Error, ErrorKind, Result};
use crate::{CollectionId, ContentId};
use exn::ResultExt;
use std::path::PathBuf;
use std::str::FromStr;
use time::UtcDateTime;

/// Where a tracked path is in the two-phase backup run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileStatus {
    /// Seen as new or changed, waiting to be hashed.
    Queued,
    /// Up to date as of [`FileRecord::collection`].
    Complete,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Queued => "queued",
            FileStatus::Complete => "complete",
        }
    }
}

impl FromStr for FileStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(FileStatus::Queued),
            "complete" => Ok(FileStatus::Complete),
            _ => exn::bail!(ErrorKind::InvalidData("file status")),
        }
    }
}

/// A filesystem path tracked across backup runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub id: u64,
    pub path: PathBuf,
    /// The most recent collection that touched this path.
    pub collection: CollectionId,
    pub status: FileStatus,
    /// Unset until the path has been hashed successfully at least once.
    pub content: Option<ContentId>,
    pub modified: UtcDateTime,
    pub length: u64,
    /// Unix permission bits (zero where the platform has none).
    pub permissions: u32,
}

/// A path seen for the first time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFile {
    pub path: PathBuf,
    pub collection: CollectionId,
    pub status: FileStatus,
    pub content: Option<ContentId>,
    pub modified: UtcDateTime,
    pub length: u64,
    pub permissions: u32,
}

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    pub(crate) id: i64,
    pub(crate) path: String,
    pub(crate) collection_id: i64,
    pub(crate) status: String,
    pub(crate) content_id: Option<i64>,
    pub(crate) modified_ns: i64,
    pub(crate) length: i64,
    pub(crate) permissions: i64,
}

fn modified_to_ns(modified: UtcDateTime) -> Result<i64> {
    i64::try_from(modified.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("modification time"))
}

impl FileRow {
    #[allow(clippy::too_many_arguments)]
    fn build(
        id: i64,
        path: &std::path::Path,
        collection: CollectionId,
        status: FileStatus,
        content: Option<ContentId>,
        modified: UtcDateTime,
        length: u64,
        permissions: u32,
    ) -> Result<Self> {
        Ok(Self {
            id,
            path: sqlx_hates_paths(path)?,
            collection_id: to_sql_int(collection, "collection id")?,
            status: status.as_str().to_string(),
            content_id: content.map(|c| to_sql_int(c, "content id")).transpose()?,
            modified_ns: modified_to_ns(modified)?,
            length: to_sql_int(length, "file length")?,
            permissions: i64::from(permissions),
        })
    }
}

impl TryFrom<&NewFile> for FileRow {
    type Error = Error;
    fn try_from(file: &NewFile) -> Result<Self> {
        Self::build(
            0,
            &file.path,
            file.collection,
            file.status,
            file.content,
            file.modified,
            file.length,
            file.permissions,
        )
    }
}

impl TryFrom<&FileRecord> for FileRow {
    type Error = Error;
    fn try_from(file: &FileRecord) -> Result<Self> {
        Self::build(
            to_sql_int(file.id, "file id")?,
            &file.path,
            file.collection,
            file.status,
            file.content,
            file.modified,
            file.length,
            file.permissions,
        )
    }
}

impl TryFrom<FileRow> for FileRecord {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self> {
        Ok(Self {
            id: from_sql_int(row.id, "file id")?,
            path: PathBuf::from(row.path),
            collection: from_sql_int(row.collection_id, "collection id")?,
            status: row.status.parse()?,
            content: row.content_id.map(|c| from_sql_int(c, "content id")).transpose()?,
            modified: UtcDateTime::from_unix_timestamp_nanos(i128::from(row.modified_ns))
                .or_raise(|| ErrorKind::InvalidData("modification time"))?,
            length: from_sql_int(row.length, "file length")?,
            permissions: u32::try_from(row.permissions).or_raise(|| ErrorKind::InvalidData("permissions"))?,
        })
    }
}
