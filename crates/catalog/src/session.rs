//! Transaction-scoped access to the catalog.
//!
//! Every mutation the engine performs happens inside one [`Session`]. The
//! crash-safety of compaction depends on being able to commit catalog
//! changes strictly before touching bytes on disk, so sessions are explicit
//! rather than hidden behind a pool.

use crate::error::{ErrorKind, Result};
use crate::models::{
    ArchiveChecksum, ChecksumRow, Collection, CollectionId, CollectionRow, CollectionTotals, Content, ContentId,
    ContentRow, FileRecord, FileRow, FileStatus, Location, NewContent, NewFile, SettingRow, sqlx_hates_paths,
    to_sql_int, to_sql_time,
};
use coffer_compress::Compression;
use exn::ResultExt;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::path::Path;
use time::UtcDateTime;
use tracing::instrument;

// Well below SQLite's bound-parameter limit.
const DELETE_CHUNK: usize = 500;

/// A single catalog transaction.
///
/// Dropping a session without calling [`commit`](Self::commit) rolls back
/// every change made through it.
pub struct Session {
    tx: Transaction<'static, Sqlite>,
}

impl Session {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }

    /// Make every change in this session durable.
    #[instrument("committing catalog session", skip_all)]
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    /// Discard every change in this session.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Collections
    // =========================================================================

    /// Start a new collection. The id is allocated by the database.
    pub async fn insert_collection(&mut self, started_at: UtcDateTime) -> Result<Collection> {
        let row: CollectionRow = sqlx::query_as(include_str!("../queries/insert_collection.sql"))
            .bind(to_sql_time(started_at))
            .fetch_one(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.try_into()
    }

    pub async fn get_collection(&mut self, id: CollectionId) -> Result<Collection> {
        let row: Option<CollectionRow> = sqlx::query_as(include_str!("../queries/get_collection.sql"))
            .bind(to_sql_int(id, "collection id")?)
            .fetch_optional(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match row {
            Some(row) => row.try_into(),
            None => exn::bail!(ErrorKind::CollectionNotFound(id)),
        }
    }

    /// The collection with the highest id, finished or not.
    pub async fn last_collection(&mut self) -> Result<Option<Collection>> {
        let row: Option<CollectionRow> = sqlx::query_as(include_str!("../queries/last_collection.sql"))
            .fetch_optional(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|r| r.try_into()).transpose()
    }

    /// All collections, oldest first.
    pub async fn list_collections(&mut self) -> Result<Vec<Collection>> {
        let rows: Vec<CollectionRow> = sqlx::query_as(include_str!("../queries/list_collections.sql"))
            .fetch_all(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Record the finish time and aggregate counts of a collection.
    pub async fn finish_collection(
        &mut self,
        id: CollectionId,
        finished_at: UtcDateTime,
        totals: CollectionTotals,
    ) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/finish_collection.sql"))
            .bind(to_sql_time(finished_at))
            .bind(to_sql_int(totals.total_files, "total files")?)
            .bind(to_sql_int(totals.new_files, "new files")?)
            .bind(to_sql_int(totals.new_bytes, "new bytes")?)
            .bind(to_sql_int(id, "collection id")?)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::CollectionNotFound(id));
        }
        Ok(())
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub async fn get_file_by_path(&mut self, path: impl AsRef<Path>) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/get_file_by_path.sql"))
            .bind(sqlx_hates_paths(path)?)
            .fetch_optional(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|r| r.try_into()).transpose()
    }

    pub async fn insert_file(&mut self, file: &NewFile) -> Result<FileRecord> {
        let row = FileRow::try_from(file)?;
        let row: FileRow = sqlx::query_as(include_str!("../queries/insert_file.sql"))
            .bind(row.path)
            .bind(row.collection_id)
            .bind(row.status)
            .bind(row.content_id)
            .bind(row.modified_ns)
            .bind(row.length)
            .bind(row.permissions)
            .fetch_one(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.try_into()
    }

    /// Overwrite every mutable column of an existing file record.
    pub async fn update_file(&mut self, file: &FileRecord) -> Result<()> {
        let row = FileRow::try_from(file)?;
        sqlx::query(include_str!("../queries/update_file.sql"))
            .bind(row.collection_id)
            .bind(row.status)
            .bind(row.content_id)
            .bind(row.modified_ns)
            .bind(row.length)
            .bind(row.permissions)
            .bind(row.id)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn delete_file(&mut self, id: u64) -> Result<()> {
        sqlx::query(include_str!("../queries/delete_file.sql"))
            .bind(to_sql_int(id, "file id")?)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Every tracked file, optionally limited to one status, ordered by path.
    pub async fn list_files(&mut self, status: Option<FileStatus>) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/list_files.sql"))
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Delete queued file records last touched by a collection older than
    /// `current`. Returns the number of records deleted.
    #[instrument(skip(self))]
    pub async fn delete_stale_queued(&mut self, current: CollectionId) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/delete_stale_queued.sql"))
            .bind(to_sql_int(current, "collection id")?)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    /// Delete every file record pointing at one of the given content records.
    pub async fn delete_files_referencing(&mut self, ids: &[ContentId]) -> Result<u64> {
        self.delete_where_in("DELETE FROM files WHERE content_id IN (", ids).await
    }

    // =========================================================================
    // Contents
    // =========================================================================

    /// Look up content by its deduplication key.
    pub async fn find_content(&mut self, hash: &str, length: u64) -> Result<Option<Content>> {
        let row: Option<ContentRow> = sqlx::query_as(include_str!("../queries/find_content.sql"))
            .bind(hash)
            .bind(to_sql_int(length, "content length")?)
            .fetch_optional(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|r| r.try_into()).transpose()
    }

    pub async fn get_content(&mut self, id: ContentId) -> Result<Content> {
        let row: Option<ContentRow> = sqlx::query_as(include_str!("../queries/get_content.sql"))
            .bind(to_sql_int(id, "content id")?)
            .fetch_optional(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match row {
            Some(row) => row.try_into(),
            None => exn::bail!(ErrorKind::ContentNotFound(id)),
        }
    }

    /// Record new content at `location`, allocating a fresh id.
    ///
    /// The watermark starts at the location's collection. Storage details are
    /// filled in by [`update_content_storage`](Self::update_content_storage)
    /// once the bytes have been packed.
    pub async fn insert_content(&mut self, content: &NewContent, location: Location) -> Result<Content> {
        let row: ContentRow = sqlx::query_as(include_str!("../queries/insert_content.sql"))
            .bind(&content.hash)
            .bind(i64::from(content.crc32))
            .bind(to_sql_int(content.length, "content length")?)
            .bind(to_sql_int(location.collection, "collection id")?)
            .bind(i64::from(location.archive))
            .fetch_one(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.try_into()
    }

    /// Record where and how the bytes of a content record were stored.
    pub async fn update_content_storage(
        &mut self,
        id: ContentId,
        location: Location,
        stored_length: u64,
        compression: Compression,
    ) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/update_content_storage.sql"))
            .bind(to_sql_int(location.collection, "collection id")?)
            .bind(i64::from(location.archive))
            .bind(to_sql_int(stored_length, "stored length")?)
            .bind(compression.as_str())
            .bind(to_sql_int(id, "content id")?)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::ContentNotFound(id));
        }
        Ok(())
    }

    /// Raise the watermark of a content record to `collection`.
    ///
    /// A watermark never moves backwards; bumping to an older collection is
    /// a no-op.
    pub async fn bump_watermark(&mut self, id: ContentId, collection: CollectionId) -> Result<()> {
        let result = sqlx::query(include_str!("../queries/bump_watermark.sql"))
            .bind(to_sql_int(collection, "collection id")?)
            .bind(to_sql_int(id, "content id")?)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::ContentNotFound(id));
        }
        Ok(())
    }

    /// Every content record, grouped by origin archive.
    pub async fn list_contents(&mut self) -> Result<Vec<Content>> {
        let rows: Vec<ContentRow> = sqlx::query_as(include_str!("../queries/list_contents.sql"))
            .fetch_all(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn list_contents_in_archive(&mut self, location: Location) -> Result<Vec<Content>> {
        let rows: Vec<ContentRow> = sqlx::query_as(include_str!("../queries/list_contents_in_archive.sql"))
            .bind(to_sql_int(location.collection, "collection id")?)
            .bind(i64::from(location.archive))
            .fetch_all(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Bulk-delete content records by id. Returns the number deleted.
    #[instrument(skip_all, fields(count = ids.len()))]
    pub async fn delete_contents(&mut self, ids: &[ContentId]) -> Result<u64> {
        self.delete_where_in("DELETE FROM contents WHERE id IN (", ids).await
    }

    async fn delete_where_in(&mut self, statement: &'static str, ids: &[ContentId]) -> Result<u64> {
        let mut deleted = 0u64;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let chunk = chunk.iter().map(|&id| to_sql_int(id, "content id")).collect::<Result<Vec<_>>>()?;
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(statement);
            let mut list = builder.separated(", ");
            for id in chunk {
                list.push_bind(id);
            }
            list.push_unseparated(")");
            let result = builder.build().execute(&mut *self.tx).await.or_raise(|| ErrorKind::Database)?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    // =========================================================================
    // Archive checksums
    // =========================================================================

    /// Insert or replace the checksum record for an archive name.
    pub async fn upsert_checksum(&mut self, record: &ArchiveChecksum) -> Result<()> {
        let row = ChecksumRow::try_from(record)?;
        sqlx::query(include_str!("../queries/upsert_checksum.sql"))
            .bind(row.name)
            .bind(row.checksum)
            .bind(row.written_at)
            .bind(row.cutoff)
            .bind(row.status)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn get_checksum(&mut self, name: &str) -> Result<Option<ArchiveChecksum>> {
        let row: Option<ChecksumRow> = sqlx::query_as(include_str!("../queries/get_checksum.sql"))
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|r| r.try_into()).transpose()
    }

    pub async fn list_checksums(&mut self) -> Result<Vec<ArchiveChecksum>> {
        let rows: Vec<ChecksumRow> = sqlx::query_as(include_str!("../queries/list_checksums.sql"))
            .fetch_all(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|r| r.try_into()).collect()
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn get_setting(&mut self, key: &str) -> Result<Option<String>> {
        let row: Option<SettingRow> = sqlx::query_as(include_str!("../queries/get_setting.sql"))
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(|r| r.value))
    }

    pub async fn set_setting(&mut self, key: &str, value: &str) -> Result<()> {
        sqlx::query(include_str!("../queries/set_setting.sql"))
            .bind(key)
            .bind(value)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArchiveStatus, Catalog, Checksum};
    use std::path::PathBuf;

    fn content(hash: &str, length: u64) -> NewContent {
        NewContent { hash: hash.to_string(), crc32: 0xDEAD_BEEF, length }
    }

    fn file(path: &str, collection: CollectionId) -> NewFile {
        NewFile {
            path: PathBuf::from(path),
            collection,
            status: FileStatus::Queued,
            content: None,
            modified: UtcDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            length: 100,
            permissions: 0o644,
        }
    }

    #[tokio::test]
    async fn test_collection_lifecycle() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        assert!(session.last_collection().await.unwrap().is_none());
        let first = session.insert_collection(UtcDateTime::now()).await.unwrap();
        let second = session.insert_collection(UtcDateTime::now()).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        let totals = CollectionTotals { total_files: 3, new_files: 1, new_bytes: 64 };
        session.finish_collection(1, UtcDateTime::now(), totals).await.unwrap();
        let fetched = session.get_collection(1).await.unwrap();
        assert!(fetched.is_finished());
        assert_eq!(fetched.totals, totals);
        assert_eq!(session.last_collection().await.unwrap().unwrap().id, 2);
        assert_eq!(session.list_collections().await.unwrap().len(), 2);
        assert!(session.get_collection(9).await.is_err());
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_dropped_session_rolls_back() {
        let db = Catalog::connect_in_memory().await.unwrap();
        {
            let mut session = db.begin().await.unwrap();
            session.insert_collection(UtcDateTime::now()).await.unwrap();
        }
        let mut session = db.begin().await.unwrap();
        assert!(session.last_collection().await.unwrap().is_none());
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_content_ids_are_never_reused() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        let location = Location { collection: 1, archive: 0 };
        let first = session.insert_content(&content("aa", 10), location).await.unwrap();
        session.delete_contents(&[first.id]).await.unwrap();
        let second = session.insert_content(&content("aa", 10), location).await.unwrap();
        assert!(second.id > first.id);
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_content_is_unique_by_hash_and_length() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        let location = Location { collection: 1, archive: 0 };
        session.insert_content(&content("aa", 10), location).await.unwrap();
        session.insert_content(&content("aa", 11), location).await.unwrap();
        assert!(session.insert_content(&content("aa", 10), location).await.is_err());
        assert_eq!(session.find_content("aa", 11).await.unwrap().unwrap().length, 11);
        assert!(session.find_content("bb", 10).await.unwrap().is_none());
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_watermark_never_decreases() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        let stored = session.insert_content(&content("aa", 10), Location { collection: 2, archive: 0 }).await.unwrap();
        assert_eq!(stored.watermark, 2);
        session.bump_watermark(stored.id, 5).await.unwrap();
        session.bump_watermark(stored.id, 3).await.unwrap();
        assert_eq!(session.get_content(stored.id).await.unwrap().watermark, 5);
        assert!(session.bump_watermark(999, 5).await.is_err());
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_update_content_storage() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        let placeholder = Location { collection: 1, archive: 0 };
        let stored = session.insert_content(&content("aa", 10), placeholder).await.unwrap();
        let packed = Location { collection: 1, archive: 2 };
        session.update_content_storage(stored.id, packed, 7, Compression::Gzip).await.unwrap();
        let fetched = session.get_content(stored.id).await.unwrap();
        assert_eq!(fetched.location, packed);
        assert_eq!(fetched.stored_length, 7);
        assert_eq!(fetched.compression, Compression::Gzip);
        assert_eq!(session.list_contents_in_archive(packed).await.unwrap().len(), 1);
        assert!(session.list_contents_in_archive(placeholder).await.unwrap().is_empty());
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        let mut record = session.insert_file(&file("/data/a.txt", 1)).await.unwrap();
        session.insert_file(&file("/data/b.txt", 1)).await.unwrap();
        assert!(session.insert_file(&file("/data/a.txt", 2)).await.is_err());

        let stored = session.insert_content(&content("aa", 100), Location { collection: 1, archive: 1 }).await.unwrap();
        record.status = FileStatus::Complete;
        record.content = Some(stored.id);
        session.update_file(&record).await.unwrap();

        let fetched = session.get_file_by_path("/data/a.txt").await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert_eq!(session.list_files(None).await.unwrap().len(), 2);
        assert_eq!(session.list_files(Some(FileStatus::Complete)).await.unwrap().len(), 1);
        assert_eq!(session.list_files(Some(FileStatus::Queued)).await.unwrap()[0].path, PathBuf::from("/data/b.txt"));

        assert_eq!(session.delete_files_referencing(&[stored.id]).await.unwrap(), 1);
        assert!(session.get_file_by_path("/data/a.txt").await.unwrap().is_none());
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_delete_stale_queued_only_touches_older_collections() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        session.insert_file(&file("/old", 1)).await.unwrap();
        session.insert_file(&file("/current", 2)).await.unwrap();
        let mut done = session.insert_file(&file("/done", 1)).await.unwrap();
        done.status = FileStatus::Complete;
        session.update_file(&done).await.unwrap();

        assert_eq!(session.delete_stale_queued(2).await.unwrap(), 1);
        let remaining: Vec<_> = session.list_files(None).await.unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(remaining, vec![PathBuf::from("/current"), PathBuf::from("/done")]);
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_bulk_delete_spans_chunks() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        let location = Location { collection: 1, archive: 1 };
        let mut ids = Vec::new();
        for n in 0..(DELETE_CHUNK as u64 + 20) {
            ids.push(session.insert_content(&content(&format!("{n:x}"), n), location).await.unwrap().id);
        }
        assert_eq!(session.delete_contents(&ids).await.unwrap(), ids.len() as u64);
        assert!(session.list_contents().await.unwrap().is_empty());
        assert_eq!(session.delete_contents(&[]).await.unwrap(), 0);
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_checksum_upsert_replaces() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        let mut record = ArchiveChecksum {
            name: "00000001_0001.tar".to_string(),
            checksum: Checksum::Live("abc".to_string()),
            written_at: UtcDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            cutoff: None,
            status: ArchiveStatus::Active,
        };
        session.upsert_checksum(&record).await.unwrap();
        record.checksum = Checksum::NoLongerNeeded;
        record.cutoff = Some(1);
        record.status = ArchiveStatus::Removed;
        session.upsert_checksum(&record).await.unwrap();
        assert_eq!(session.get_checksum(&record.name).await.unwrap(), Some(record.clone()));
        assert_eq!(session.list_checksums().await.unwrap(), vec![record]);
        assert!(session.get_checksum("missing").await.unwrap().is_none());
        session.commit().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_settings() {
        let db = Catalog::connect_in_memory().await.unwrap();
        let mut session = db.begin().await.unwrap();
        assert!(session.get_setting("container").await.unwrap().is_none());
        session.set_setting("container", "tar").await.unwrap();
        session.set_setting("container", "7z").await.unwrap();
        assert_eq!(session.get_setting("container").await.unwrap().as_deref(), Some("7z"));
        session.commit().await.unwrap();
        db.close().await;
    }
}
