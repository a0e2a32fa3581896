use super::{from_sql_int, from_sql_time};
use crate::error::{Error, Result};
use time::UtcDateTime;

/// Collections are numbered from 1 upwards; ids are never reused once a run
/// has committed.
pub type CollectionId = u64;

/// Aggregate counts written onto a collection when its run finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectionTotals {
    /// Every file that ended the run in the `Complete` state.
    pub total_files: u64,
    /// Content records created by this run.
    pub new_files: u64,
    /// Bytes written into this run's archives (after compression).
    pub new_bytes: u64,
}

/// A single backup run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collection {
    pub id: CollectionId,
    pub started_at: UtcDateTime,
    /// Unset until the run has completed successfully.
    pub finished_at: Option<UtcDateTime>,
    pub totals: CollectionTotals,
}

impl Collection {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CollectionRow {
    pub(crate) id: i64,
    pub(crate) started_at: i64,
    pub(crate) finished_at: Option<i64>,
    pub(crate) total_files: i64,
    pub(crate) new_files: i64,
    pub(crate) new_bytes: i64,
}

impl TryFrom<CollectionRow> for Collection {
    type Error = Error;
    fn try_from(row: CollectionRow) -> Result<Self> {
        Ok(Self {
            id: from_sql_int(row.id, "collection id")?,
            started_at: from_sql_time(row.started_at, "collection start")?,
            finished_at: row.finished_at.map(|t| from_sql_time(t, "collection finish")).transpose()?,
            totals: CollectionTotals {
                total_files: from_sql_int(row.total_files, "total files")?,
                new_files: from_sql_int(row.new_files, "new files")?,
                new_bytes: from_sql_int(row.new_bytes, "new bytes")?,
            },
        })
    }
}
