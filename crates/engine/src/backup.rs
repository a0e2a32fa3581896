//! Backup orchestration.
//!
//! A run is two phases inside one catalog transaction:
//!
//! 1. **Enqueue**: walk the roots and diff every path against its record.
//!    Unchanged paths are completed straight away (their content's watermark
//!    is bumped), new and changed paths are queued. Nothing is hashed, so the
//!    number of files left to process is known up front.
//! 2. **Process**: hash every queued path, look the identity up, and either
//!    reuse the existing content or pack the file into this run's archives.
//!
//! The transaction commits only after every archive has been sealed,
//! verified and published. An aborted run leaves the catalog exactly as it
//! was; any archive it published is overwritten by the next run, which
//! reuses the same collection id.

use crate::error::{ErrorKind, Result};
use crate::group::Group;
use crate::hasher::{Hasher, Identity, is_unchanged};
use crate::report::{BackupReport, Issue};
use crate::walk::{Observed, exclusions, walk};
use coffer_archive::{ArchiveManager, Published};
use coffer_catalog::{
    ArchiveChecksum, ArchiveStatus, Checksum, CollectionId, CollectionTotals, FileRecord, FileStatus, Location,
    NewContent, NewFile, Session,
};
use coffer_compress::{MAGIC_PEEK_LEN, is_incompressible};
use exn::{OptionExt, ResultExt};
use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, Read};
use std::path::Path;
use time::UtcDateTime;
use tracing::instrument;

/// What Phase 1 decided about one observed path.
enum Diff {
    New,
    Changed(FileRecord),
    Unchanged(FileRecord),
}

async fn diff(session: &mut Session, observed: &Observed, group: &Group) -> Result<Diff> {
    let record = session.get_file_by_path(&observed.path).await.or_raise(|| ErrorKind::Catalog)?;
    Ok(match record {
        None => Diff::New,
        Some(record) if is_unchanged(&record, observed.length, observed.modified, group.config().scan_mode) => {
            Diff::Unchanged(record)
        },
        Some(record) => Diff::Changed(record),
    })
}

/// Walk and diff without changing anything.
#[instrument(skip_all, fields(group = group.name()))]
pub async fn preview(group: &Group) -> Result<BackupReport> {
    let mut report = BackupReport::default();
    let exclude = exclusions(&group.config().exclude)?;
    let observed = walk(&group.config().roots, &exclude, &mut report.issues);
    let mut session = group.catalog().begin().await.or_raise(|| ErrorKind::Catalog)?;
    for file in &observed {
        match diff(&mut session, file, group).await? {
            Diff::New => report.new += 1,
            Diff::Changed(_) => report.changed += 1,
            Diff::Unchanged(_) => report.unchanged += 1,
        }
    }
    session.rollback().await.or_raise(|| ErrorKind::Catalog)?;
    tracing::info!(new = report.new, changed = report.changed, unchanged = report.unchanged, "backup preview");
    Ok(report)
}

/// Run a backup of every root in the group into a new collection.
#[instrument(skip_all, fields(group = group.name()))]
pub async fn run(group: &Group) -> Result<BackupReport> {
    let mut report = BackupReport::default();
    let exclude = exclusions(&group.config().exclude)?;
    let mut session = group.catalog().begin().await.or_raise(|| ErrorKind::Catalog)?;
    let collection = session.insert_collection(UtcDateTime::now()).await.or_raise(|| ErrorKind::Catalog)?;
    let id = collection.id;
    report.collection = Some(id);
    tracing::info!(collection = id, "starting backup");

    let observed = walk(&group.config().roots, &exclude, &mut report.issues);
    enqueue(&mut session, group, id, &observed, &mut report).await?;
    tracing::info!(
        collection = id,
        queued = report.queued(),
        unchanged = report.unchanged,
        "files to process",
    );

    let mut manager = ArchiveManager::new(
        group.tool(),
        group.layout(),
        id,
        group.config().pack_options(),
        group.retry(),
    )
    .or_raise(|| ErrorKind::Archive)?;
    let completed = process(&mut session, group, &mut manager, &mut report).await?;

    report.forgotten = session.delete_stale_queued(id).await.or_raise(|| ErrorKind::Catalog)?;
    let totals = CollectionTotals {
        total_files: report.unchanged.checked_add(completed).ok_or_raise(|| ErrorKind::Overflow)?,
        new_files: report.new_contents,
        new_bytes: report.new_bytes,
    };
    session.finish_collection(id, UtcDateTime::now(), totals).await.or_raise(|| ErrorKind::Catalog)?;

    let published = manager.finish().or_raise(|| ErrorKind::Archive)?;
    record_published(&mut session, &published).await?;
    report.archives = published.into_iter().map(|p| p.name).collect();
    session.commit().await.or_raise(|| ErrorKind::Catalog)?;

    tracing::info!(
        collection = id,
        files = totals.total_files,
        new_contents = report.new_contents,
        new_bytes = report.new_bytes,
        archives = report.archives.len(),
        issues = report.issues.len(),
        "backup complete",
    );
    Ok(report)
}

/// Phase 1.
async fn enqueue(
    session: &mut Session,
    group: &Group,
    collection: CollectionId,
    observed: &[Observed],
    report: &mut BackupReport,
) -> Result<()> {
    for file in observed {
        match diff(session, file, group).await? {
            Diff::New => {
                let new = NewFile {
                    path: file.path.clone(),
                    collection,
                    status: FileStatus::Queued,
                    content: None,
                    modified: file.modified,
                    length: file.length,
                    permissions: file.permissions,
                };
                session.insert_file(&new).await.or_raise(|| ErrorKind::Catalog)?;
                report.new += 1;
            },
            Diff::Changed(mut record) => {
                record.collection = collection;
                record.status = FileStatus::Queued;
                record.modified = file.modified;
                record.length = file.length;
                record.permissions = file.permissions;
                session.update_file(&record).await.or_raise(|| ErrorKind::Catalog)?;
                report.changed += 1;
            },
            Diff::Unchanged(mut record) => {
                record.collection = collection;
                record.permissions = file.permissions;
                session.update_file(&record).await.or_raise(|| ErrorKind::Catalog)?;
                if let Some(content) = record.content {
                    session.bump_watermark(content, collection).await.or_raise(|| ErrorKind::Catalog)?;
                }
                report.unchanged += 1;
            },
        }
    }
    Ok(())
}

/// Phase 2. Returns the number of queued records that were completed.
async fn process(
    session: &mut Session,
    group: &Group,
    manager: &mut ArchiveManager<'_>,
    report: &mut BackupReport,
) -> Result<u64> {
    let collection = manager.collection();
    let hasher = group.hasher();
    let queued = session.list_files(Some(FileStatus::Queued)).await.or_raise(|| ErrorKind::Catalog)?;
    let mut completed = 0u64;
    for mut record in queued.into_iter().filter(|r| r.collection == collection) {
        let identity = match open_and_identify(group, &hasher, &record.path) {
            Ok(identity) => identity,
            Err(Unreadable::Vanished) => {
                tracing::debug!(path = %record.path.display(), "file vanished before it was processed");
                session.delete_file(record.id).await.or_raise(|| ErrorKind::Catalog)?;
                report.vanished += 1;
                continue;
            },
            Err(Unreadable::Failed(message)) => {
                unreadable(session, &record, collection, message, report).await?;
                continue;
            },
        };
        report.hashed += 1;

        let length = identity.length;
        let content = match session.find_content(&identity.hash, length).await.or_raise(|| ErrorKind::Catalog)? {
            Some(content) => {
                session.bump_watermark(content.id, collection).await.or_raise(|| ErrorKind::Catalog)?;
                report.deduplicated += 1;
                content.id
            },
            None => {
                let placeholder = Location { collection, archive: 0 };
                let new = NewContent::from(identity);
                let content = session.insert_content(&new, placeholder).await.or_raise(|| ErrorKind::Catalog)?;
                let compress = group.config().compress && !is_incompressible(&record.path, &peek(&record.path));
                let label = record.path.to_string_lossy();
                let stored = manager.add(content.id, &record.path, compress, &label).or_raise(|| ErrorKind::Archive)?;
                session
                    .update_content_storage(content.id, stored.location, stored.stored_length, stored.compression)
                    .await
                    .or_raise(|| ErrorKind::Catalog)?;
                report.new_contents += 1;
                report.new_bytes =
                    report.new_bytes.checked_add(stored.stored_length).ok_or_raise(|| ErrorKind::Overflow)?;
                content.id
            },
        };
        record.content = Some(content);
        record.status = FileStatus::Complete;
        session.update_file(&record).await.or_raise(|| ErrorKind::Catalog)?;
        completed += 1;
    }
    Ok(completed)
}

enum Unreadable {
    /// Gone since Phase 1.
    Vanished,
    /// Still there, but couldn't be read or hashed.
    Failed(String),
}

fn open_and_identify(
    group: &Group,
    hasher: &Hasher<'_>,
    path: &Path,
) -> std::result::Result<Identity, Unreadable> {
    let file = match group.retry().run("open file", || File::open(path)) {
        Ok(file) => file,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Err(Unreadable::Vanished),
        Err(e) => return Err(Unreadable::Failed(e.to_string())),
    };
    hasher.identify(path, file).map_err(|e| Unreadable::Failed(e.to_string()))
}

/// A queued path that exists but could not be read.
///
/// Without a previously archived version there is nothing to keep, so the
/// record is dropped. Otherwise the record keeps pointing at the last
/// archived content and stays queued, so the next run tries again.
async fn unreadable(
    session: &mut Session,
    record: &FileRecord,
    collection: CollectionId,
    message: String,
    report: &mut BackupReport,
) -> Result<()> {
    tracing::warn!(path = %record.path.display(), error = %message, "unreadable file");
    match record.content {
        None => {
            session.delete_file(record.id).await.or_raise(|| ErrorKind::Catalog)?;
            report.issues.push(Issue::new(&record.path, format!("skipped, never archived: {message}")));
        },
        Some(content) => {
            session.bump_watermark(content, collection).await.or_raise(|| ErrorKind::Catalog)?;
            report
                .issues
                .push(Issue::new(&record.path, format!("kept the previously archived version: {message}")));
        },
    }
    Ok(())
}

/// The first few bytes of a file, for spotting already-compressed content.
fn peek(path: &Path) -> Vec<u8> {
    let mut head = Vec::with_capacity(MAGIC_PEEK_LEN);
    if let Ok(file) = File::open(path) {
        let _ = file.take(MAGIC_PEEK_LEN as u64).read_to_end(&mut head);
    }
    head
}

async fn record_published(session: &mut Session, published: &[Published]) -> Result<()> {
    let now = UtcDateTime::now();
    for archive in published {
        let record = ArchiveChecksum {
            name: archive.name.clone(),
            checksum: Checksum::Live(archive.checksum.clone()),
            written_at: now,
            cutoff: None,
            status: ArchiveStatus::Active,
        };
        session.upsert_checksum(&record).await.or_raise(|| ErrorKind::Catalog)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_archive::ContainerFormat;
    use coffer_config::{GroupConfig, RetryConfig, ScanMode};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        root: TempDir,
        group: Group,
        _data: TempDir,
    }

    impl Fixture {
        async fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let data = tempfile::tempdir().unwrap();
            let config = GroupConfig {
                roots: vec![root.path().to_path_buf()],
                exclude: Vec::new(),
                data_dir: data.path().to_path_buf(),
                archive_target_size: 1024 * 1024,
                archive_max_items: 100,
                compress: false,
                write_manifest: false,
                scan_mode: ScanMode::Fast,
                separate_audio_metadata: false,
                tag_tool: None,
                container: ContainerFormat::Tar,
                retention_days: 30,
                strip_threshold_bytes: 0,
                retry: RetryConfig { attempts: 1, delay_ms: 0 },
            };
            let group = Group::open("test", &config).await.unwrap();
            Self { root, group, _data: data }
        }

        fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
            let path = self.root.path().join(name);
            fs::write(&path, contents).unwrap();
            path
        }

        /// Phase 1 of a new run, left open so the tree can change before Phase 2.
        async fn enqueued(&self) -> (Session, CollectionId, BackupReport) {
            let mut session = self.group.catalog().begin().await.unwrap();
            let id = session.insert_collection(UtcDateTime::now()).await.unwrap().id;
            let mut report = BackupReport::default();
            let observed = walk(&self.group.config().roots, &exclusions(&[]).unwrap(), &mut report.issues);
            enqueue(&mut session, &self.group, id, &observed, &mut report).await.unwrap();
            (session, id, report)
        }

        async fn processed(&self, session: &mut Session, collection: CollectionId, report: &mut BackupReport) -> u64 {
            let group = &self.group;
            let mut manager = ArchiveManager::new(
                group.tool(),
                group.layout(),
                collection,
                group.config().pack_options(),
                group.retry(),
            )
            .unwrap();
            let completed = process(session, group, &mut manager, report).await.unwrap();
            manager.finish().unwrap();
            completed
        }
    }

    /// Swap a file for a directory of the same name: still there, but
    /// unreadable as a file.
    fn make_unreadable(path: &Path) {
        fs::remove_file(path).unwrap();
        fs::create_dir(path).unwrap();
    }

    #[tokio::test]
    async fn test_file_vanishing_before_processing_is_dropped() {
        let fixture = Fixture::new().await;
        let path = fixture.write("brief.txt", b"here for a moment");
        let (mut session, id, mut report) = fixture.enqueued().await;
        assert_eq!(report.new, 1);

        fs::remove_file(&path).unwrap();
        let completed = fixture.processed(&mut session, id, &mut report).await;
        assert_eq!((completed, report.hashed, report.vanished), (0, 0, 1));
        assert!(report.issues.is_empty(), "{:?}", report.issues);
        assert!(session.get_file_by_path(&path).await.unwrap().is_none());
        session.rollback().await.unwrap();
        fixture.group.close().await;
    }

    #[tokio::test]
    async fn test_unreadable_new_file_is_dropped() {
        let fixture = Fixture::new().await;
        let path = fixture.write("locked.txt", b"can't touch this");
        let (mut session, id, mut report) = fixture.enqueued().await;

        make_unreadable(&path);
        let completed = fixture.processed(&mut session, id, &mut report).await;
        assert_eq!((completed, report.vanished), (0, 0));
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].message.starts_with("skipped, never archived"));
        assert!(session.get_file_by_path(&path).await.unwrap().is_none());
        assert!(session.list_contents().await.unwrap().is_empty());
        session.rollback().await.unwrap();
        fixture.group.close().await;
    }

    #[tokio::test]
    async fn test_unreadable_file_keeps_its_archived_version_until_forgotten() {
        let fixture = Fixture::new().await;
        let path = fixture.write("notes.txt", b"first version");
        run(&fixture.group).await.unwrap();
        let previous = {
            let mut session = fixture.group.catalog().begin().await.unwrap();
            session.get_file_by_path(&path).await.unwrap().unwrap().content.unwrap()
        };

        fixture.write("notes.txt", b"a longer second version");
        let (mut session, id, mut report) = fixture.enqueued().await;
        assert_eq!((id, report.changed), (2, 1));
        make_unreadable(&path);
        let completed = fixture.processed(&mut session, id, &mut report).await;
        assert_eq!(completed, 0);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].message.starts_with("kept the previously archived version"));

        let record = session.get_file_by_path(&path).await.unwrap().unwrap();
        assert_eq!(record.content, Some(previous));
        assert_eq!((record.status, record.collection), (FileStatus::Queued, id));
        assert_eq!(session.get_content(previous).await.unwrap().watermark, id);
        session.commit().await.unwrap();

        let next = run(&fixture.group).await.unwrap();
        assert_eq!(next.collection, Some(3));
        assert_eq!(next.forgotten, 1);
        let mut session = fixture.group.catalog().begin().await.unwrap();
        assert!(session.get_file_by_path(&path).await.unwrap().is_none());
        session.rollback().await.unwrap();
        fixture.group.close().await;
    }
}
