mod checksum;
mod collection;
mod content;
mod file;
mod setting;

pub use self::checksum::{ArchiveChecksum, ArchiveStatus, Checksum};
pub(crate) use self::checksum::ChecksumRow;
pub use self::collection::{Collection, CollectionId, CollectionTotals};
pub(crate) use self::collection::CollectionRow;
pub use self::content::{Content, ContentId, Location, NewContent};
pub(crate) use self::content::ContentRow;
pub use self::file::{FileRecord, FileStatus, NewFile};
pub(crate) use self::file::FileRow;
pub(crate) use self::setting::SettingRow;

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use std::path::Path;
use time::UtcDateTime;

// SQLite only knows signed 64-bit integers.

pub(crate) fn to_sql_int(value: u64, field: &'static str) -> Result<i64> {
    i64::try_from(value).or_raise(|| ErrorKind::InvalidData(field))
}

pub(crate) fn from_sql_int(value: i64, field: &'static str) -> Result<u64> {
    u64::try_from(value).or_raise(|| ErrorKind::InvalidData(field))
}

pub(crate) fn to_sql_time(value: UtcDateTime) -> i64 {
    value.unix_timestamp()
}

pub(crate) fn from_sql_time(value: i64, field: &'static str) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp(value).or_raise(|| ErrorKind::InvalidData(field))
}

pub(crate) fn sqlx_hates_paths(path: impl AsRef<Path>) -> Result<String> {
    Ok(path.as_ref().to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string())
}
