//! Compaction: expiring content no collection newer than the cutoff uses.
//!
//! `ChooseCutoff → GatherStats → Classify → Execute`. Every archive bucket
//! whose content has all expired is removed; in thorough mode, buckets with
//! enough expired bytes are rebuilt without them. Thorough mode also rebuilds
//! archives still holding members nothing refers to, which is what a strip
//! interrupted after its catalog commit leaves behind.
//!
//! Catalog changes for a bucket are always committed before its archive is
//! touched. A crash in between leaves bytes on disk that nothing refers to,
//! never a record pointing at bytes that are gone. [`Compactor::commit`] and
//! [`Compactor::apply`] are the two halves of that sequence.

use crate::error::{ErrorKind, Result};
use crate::group::Group;
use crate::report::{CompactReport, Issue};
use coffer_archive::naming::{MANIFEST, archive_name, member_name};
use coffer_archive::{file_checksum, repack};
use coffer_catalog::{
    ArchiveChecksum, ArchiveStatus, Checksum, Collection, CollectionId, Content, ContentId, Location, Session,
};
use exn::{OptionExt, ResultExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use time::{Duration, UtcDateTime};
use tracing::instrument;

const SAFE_TO_DELETE_SUFFIX: &str = ".safe_to_delete";

/// Per-archive totals, split at the cutoff.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub old_items: u64,
    pub old_bytes: u64,
    pub new_items: u64,
    pub new_bytes: u64,
    /// Only collected in thorough mode.
    pub old_ids: Vec<ContentId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing in the archive is still referenced.
    Remove,
    /// Rebuild the archive with only the content still referenced.
    Strip,
    Keep,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketPlan {
    pub location: Location,
    pub name: String,
    pub stats: BucketStats,
    pub action: Action,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Unset when no collection is old enough; the plan is then empty.
    pub cutoff: Option<CollectionId>,
    pub buckets: Vec<BucketPlan>,
}

impl CompactionPlan {
    pub fn actionable(&self) -> impl Iterator<Item = &BucketPlan> {
        self.buckets.iter().filter(|b| b.action != Action::Keep)
    }
}

/// Newest-first, skipping the newest collection, the first one that
/// finished before `now - retention`.
pub fn choose_cutoff(collections: &[Collection], now: UtcDateTime, retention: Duration) -> Option<CollectionId> {
    let threshold = now.checked_sub(retention)?;
    let mut newest_first: Vec<&Collection> = collections.iter().collect();
    newest_first.sort_by(|a, b| b.id.cmp(&a.id));
    newest_first
        .into_iter()
        .skip(1)
        .find(|c| c.finished_at.is_some_and(|finished| finished < threshold))
        .map(|c| c.id)
}

/// Bucket every content record by the archive it lives in. Content is old
/// once its watermark is at or below the cutoff.
pub fn gather_stats(
    contents: &[Content],
    cutoff: CollectionId,
    thorough: bool,
) -> Result<BTreeMap<Location, BucketStats>> {
    let mut buckets: BTreeMap<Location, BucketStats> = BTreeMap::new();
    for content in contents {
        let stats = buckets.entry(content.location).or_default();
        if content.watermark > cutoff {
            stats.new_items += 1;
            stats.new_bytes = stats.new_bytes.checked_add(content.stored_length).ok_or_raise(|| ErrorKind::Overflow)?;
        } else {
            stats.old_items += 1;
            stats.old_bytes = stats.old_bytes.checked_add(content.stored_length).ok_or_raise(|| ErrorKind::Overflow)?;
            if thorough {
                stats.old_ids.push(content.id);
            }
        }
    }
    Ok(buckets)
}

pub fn classify(stats: &BucketStats, thorough: bool, strip_threshold: u64) -> Action {
    if stats.old_items > 0 && stats.new_items == 0 {
        Action::Remove
    } else if thorough && stats.old_items > 0 && stats.old_bytes > strip_threshold {
        Action::Strip
    } else {
        Action::Keep
    }
}

/// Disk work owed for a bucket whose catalog changes have been committed.
#[must_use = "committed catalog changes leave orphaned bytes until applied"]
#[derive(Debug)]
pub enum Pending {
    Remove { name: String },
    Strip { name: String, keep: BTreeSet<String>, manifest: Option<String> },
}

pub struct Compactor<'g> {
    group: &'g Group,
    thorough: bool,
    now: UtcDateTime,
}

impl<'g> Compactor<'g> {
    pub fn new(group: &'g Group, thorough: bool) -> Self {
        Self { group, thorough, now: UtcDateTime::now() }
    }

    /// Judge collection ages against `now` instead of the current time.
    pub fn at(mut self, now: UtcDateTime) -> Self {
        self.now = now;
        self
    }

    fn retention(&self) -> Result<Duration> {
        let seconds = self.group.config().retention_days.checked_mul(86_400).ok_or_raise(|| ErrorKind::Overflow)?;
        Ok(Duration::seconds(i64::try_from(seconds).or_raise(|| ErrorKind::Overflow)?))
    }

    /// Choose the cutoff and classify every bucket, without changing anything.
    #[instrument(skip(self), fields(group = self.group.name(), thorough = self.thorough))]
    pub async fn plan(&self) -> Result<CompactionPlan> {
        let mut session = self.group.catalog().begin().await.or_raise(|| ErrorKind::Catalog)?;
        let collections = session.list_collections().await.or_raise(|| ErrorKind::Catalog)?;
        let Some(cutoff) = choose_cutoff(&collections, self.now, self.retention()?) else {
            tracing::info!("no collection is old enough to compact");
            session.rollback().await.or_raise(|| ErrorKind::Catalog)?;
            return Ok(CompactionPlan::default());
        };
        let contents = session.list_contents().await.or_raise(|| ErrorKind::Catalog)?;
        session.rollback().await.or_raise(|| ErrorKind::Catalog)?;

        let extension = self.group.tool().extension();
        let threshold = self.group.config().strip_threshold_bytes;
        let mut buckets = gather_stats(&contents, cutoff, self.thorough)?
            .into_iter()
            .map(|(location, stats)| BucketPlan {
                location,
                name: archive_name(location, extension),
                action: classify(&stats, self.thorough, threshold),
                stats,
            })
            .collect::<Vec<_>>();
        if self.thorough {
            for bucket in buckets.iter_mut().filter(|b| b.action == Action::Keep) {
                if self.has_leftovers(bucket, &contents) {
                    tracing::info!(archive = %bucket.name, "finishing an interrupted strip");
                    bucket.action = Action::Strip;
                }
            }
        }
        tracing::info!(cutoff, buckets = buckets.len(), "compaction planned");
        Ok(CompactionPlan { cutoff: Some(cutoff), buckets })
    }

    /// Whether the archive on disk holds members no content record refers to.
    fn has_leftovers(&self, bucket: &BucketPlan, contents: &[Content]) -> bool {
        let path = self.group.layout().ready().join(&bucket.name);
        if !path.exists() {
            return false;
        }
        let referenced: BTreeSet<String> = contents
            .iter()
            .filter(|c| c.location == bucket.location)
            .map(|c| member_name(c.id, c.compression))
            .collect();
        match self.group.tool().list(&path) {
            Ok(members) => members.iter().any(|m| m.name != MANIFEST && !referenced.contains(&m.name)),
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(archive = %bucket.name, error = %message, "could not list archive");
                false
            },
        }
    }

    /// Plan and execute.
    pub async fn run(&self) -> Result<CompactReport> {
        let plan = self.plan().await?;
        self.execute(&plan).await
    }

    #[instrument(skip_all, fields(group = self.group.name(), cutoff = ?plan.cutoff))]
    pub async fn execute(&self, plan: &CompactionPlan) -> Result<CompactReport> {
        let mut report = CompactReport { cutoff: plan.cutoff, ..Default::default() };
        let Some(cutoff) = plan.cutoff else {
            return Ok(report);
        };
        for bucket in plan.actionable() {
            let pending = self.commit(cutoff, bucket, &mut report).await?;
            self.apply(cutoff, pending, &mut report).await?;
        }
        tracing::info!(
            removed = report.removed_archives.len(),
            stripped = report.stripped_archives.len(),
            contents = report.deleted_contents,
            bytes = report.reclaimed_bytes,
            "compaction complete",
        );
        Ok(report)
    }

    /// Delete the bucket's expired records in one committed transaction.
    ///
    /// Fails for a bucket the plan decided to keep.
    pub async fn commit(
        &self,
        cutoff: CollectionId,
        bucket: &BucketPlan,
        report: &mut CompactReport,
    ) -> Result<Pending> {
        let mut session = self.group.catalog().begin().await.or_raise(|| ErrorKind::Catalog)?;
        let (pending, contents, files) = match bucket.action {
            Action::Keep => exn::bail!(ErrorKind::NothingToCompact(bucket.name.clone())),
            Action::Remove => self.expire_archive(&mut session, cutoff, bucket).await?,
            Action::Strip => self.expire_members(&mut session, bucket).await?,
        };
        session.commit().await.or_raise(|| ErrorKind::Catalog)?;

        tracing::debug!(archive = %bucket.name, contents, files, "expired records committed");
        report.deleted_contents += contents;
        report.deleted_files += files;
        report.reclaimed_bytes =
            report.reclaimed_bytes.checked_add(bucket.stats.old_bytes).ok_or_raise(|| ErrorKind::Overflow)?;
        Ok(pending)
    }

    /// Every record in the archive goes, and its checksum is retired.
    async fn expire_archive(
        &self,
        session: &mut Session,
        cutoff: CollectionId,
        bucket: &BucketPlan,
    ) -> Result<(Pending, u64, u64)> {
        let expired: Vec<ContentId> = session
            .list_contents_in_archive(bucket.location)
            .await
            .or_raise(|| ErrorKind::Catalog)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let files = session.delete_files_referencing(&expired).await.or_raise(|| ErrorKind::Catalog)?;
        let contents = session.delete_contents(&expired).await.or_raise(|| ErrorKind::Catalog)?;
        let record = ArchiveChecksum {
            name: bucket.name.clone(),
            checksum: Checksum::NoLongerNeeded,
            written_at: self.now,
            cutoff: Some(cutoff),
            status: ArchiveStatus::Removed,
        };
        session.upsert_checksum(&record).await.or_raise(|| ErrorKind::Catalog)?;
        Ok((Pending::Remove { name: bucket.name.clone() }, contents, files))
    }

    /// Only the expired records go; the survivors decide what the rebuilt
    /// archive keeps.
    async fn expire_members(&self, session: &mut Session, bucket: &BucketPlan) -> Result<(Pending, u64, u64)> {
        let expired = &bucket.stats.old_ids;
        let files = session.delete_files_referencing(expired).await.or_raise(|| ErrorKind::Catalog)?;
        let contents = session.delete_contents(expired).await.or_raise(|| ErrorKind::Catalog)?;
        let survivors = session.list_contents_in_archive(bucket.location).await.or_raise(|| ErrorKind::Catalog)?;
        let keep = survivors.iter().map(|c| member_name(c.id, c.compression)).collect();
        let manifest = if self.group.config().write_manifest {
            let paths: BTreeMap<ContentId, String> = session
                .list_files(None)
                .await
                .or_raise(|| ErrorKind::Catalog)?
                .into_iter()
                .filter_map(|f| Some((f.content?, f.path.to_string_lossy().into_owned())))
                .collect();
            let mut text = String::new();
            for content in &survivors {
                let label = paths.get(&content.id).map(String::as_str).unwrap_or_default();
                text.push_str(&format!("{}\t{label}\n", member_name(content.id, content.compression)));
            }
            Some(text)
        } else {
            None
        };
        Ok((Pending::Strip { name: bucket.name.clone(), keep, manifest }, contents, files))
    }

    /// Bring the archive on disk in line with the committed catalog.
    pub async fn apply(&self, cutoff: CollectionId, pending: Pending, report: &mut CompactReport) -> Result<()> {
        let layout = self.group.layout();
        let retry = self.group.retry();
        match pending {
            Pending::Remove { name } => {
                let active = layout.ready().join(&name);
                if active.exists() {
                    let removed = layout.removed().join(&name);
                    match retry.run("move expired archive", || fs::rename(&active, &removed)) {
                        Ok(()) => tracing::info!(archive = %name, "moved expired archive out of the ready directory"),
                        Err(e) => {
                            report.issues.push(Issue::new(&active, format!("could not move expired archive: {e}")));
                        },
                    }
                } else {
                    let marker = layout.removed().join(format!("{name}{SAFE_TO_DELETE_SUFFIX}"));
                    let text = format!("{name} expired at cutoff {cutoff}; any remote copy can be deleted\n");
                    report.issues.push(Issue::new(&active, "archive already missing locally"));
                    if let Err(e) = fs::write(&marker, text) {
                        report.issues.push(Issue::new(&marker, format!("could not write marker: {e}")));
                    }
                }
                report.removed_archives.push(name);
            },
            Pending::Strip { name, keep, manifest } => {
                let active = layout.ready().join(&name);
                if !active.exists() {
                    report.issues.push(Issue::new(&active, "archive missing locally, nothing to strip"));
                    return self.record_cutoff(&name, cutoff).await;
                }
                let tool = self.group.tool();
                let rebuilt =
                    repack(tool, layout, &active, &keep, manifest.as_deref()).or_raise(|| ErrorKind::Archive)?;
                rebuilt.install(&active, retry).or_raise(|| ErrorKind::Archive)?;
                let checksum = file_checksum(&active).or_raise(|| ErrorKind::Archive)?;

                let mut session = self.group.catalog().begin().await.or_raise(|| ErrorKind::Catalog)?;
                let record = ArchiveChecksum {
                    name: name.clone(),
                    checksum: Checksum::Live(checksum),
                    written_at: self.now,
                    cutoff: Some(cutoff),
                    status: ArchiveStatus::Stripped,
                };
                session.upsert_checksum(&record).await.or_raise(|| ErrorKind::Catalog)?;
                session.commit().await.or_raise(|| ErrorKind::Catalog)?;
                tracing::info!(archive = %name, members = keep.len(), "stripped archive");
                report.stripped_archives.push(name);
            },
        }
        Ok(())
    }

    /// Note the cutoff on an archive's checksum record without changing the
    /// checksum itself.
    async fn record_cutoff(&self, name: &str, cutoff: CollectionId) -> Result<()> {
        let mut session = self.group.catalog().begin().await.or_raise(|| ErrorKind::Catalog)?;
        if let Some(mut record) = session.get_checksum(name).await.or_raise(|| ErrorKind::Catalog)? {
            record.cutoff = Some(cutoff);
            session.upsert_checksum(&record).await.or_raise(|| ErrorKind::Catalog)?;
        }
        session.commit().await.or_raise(|| ErrorKind::Catalog)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_catalog::CollectionTotals;
    use coffer_compress::Compression;
    use rstest::rstest;

    fn at(days_ago: i64) -> UtcDateTime {
        now() - Duration::days(days_ago)
    }

    fn now() -> UtcDateTime {
        UtcDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    fn collection(id: CollectionId, finished_days_ago: Option<i64>) -> Collection {
        Collection {
            id,
            started_at: at(finished_days_ago.unwrap_or(0)),
            finished_at: finished_days_ago.map(at),
            totals: CollectionTotals::default(),
        }
    }

    fn content(id: ContentId, archive: u32, watermark: CollectionId, stored_length: u64) -> Content {
        Content {
            id,
            hash: format!("{id:064x}"),
            crc32: 0,
            length: stored_length,
            stored_length,
            compression: Compression::None,
            location: Location { collection: 1, archive },
            watermark,
        }
    }

    #[rstest]
    #[case::nothing(vec![], None)]
    #[case::only_the_newest_is_old(vec![collection(1, Some(400))], None)]
    #[case::first_old_enough(vec![collection(1, Some(400)), collection(2, Some(300)), collection(3, Some(1))], Some(2))]
    #[case::none_old_enough(vec![collection(1, Some(10)), collection(2, Some(5)), collection(3, Some(1))], None)]
    #[case::unfinished_skipped(vec![collection(1, Some(400)), collection(2, None), collection(3, Some(1))], Some(1))]
    fn test_choose_cutoff(#[case] collections: Vec<Collection>, #[case] expected: Option<CollectionId>) {
        assert_eq!(choose_cutoff(&collections, now(), Duration::days(180)), expected);
    }

    #[test]
    fn test_gather_stats_splits_at_the_cutoff() {
        let contents = [content(1, 1, 1, 10), content(2, 1, 2, 20), content(3, 2, 1, 30), content(4, 2, 1, 40)];
        let buckets = gather_stats(&contents, 1, true).unwrap();
        let first = &buckets[&Location { collection: 1, archive: 1 }];
        assert_eq!((first.old_items, first.old_bytes, first.new_items, first.new_bytes), (1, 10, 1, 20));
        assert_eq!(first.old_ids, vec![1]);
        let second = &buckets[&Location { collection: 1, archive: 2 }];
        assert_eq!((second.old_items, second.old_bytes, second.new_items), (2, 70, 0));

        let quick = gather_stats(&contents, 1, false).unwrap();
        assert!(quick.values().all(|b| b.old_ids.is_empty()));
    }

    #[rstest]
    #[case::all_old(3, 300, 0, false, Action::Remove)]
    #[case::all_old_thorough(3, 300, 0, true, Action::Remove)]
    #[case::mixed_quick(3, 300, 1, false, Action::Keep)]
    #[case::mixed_over_threshold(3, 300, 1, true, Action::Strip)]
    #[case::mixed_at_threshold(3, 100, 1, true, Action::Keep)]
    #[case::all_new(0, 0, 5, true, Action::Keep)]
    fn test_classify(
        #[case] old_items: u64,
        #[case] old_bytes: u64,
        #[case] new_items: u64,
        #[case] thorough: bool,
        #[case] expected: Action,
    ) {
        let stats = BucketStats { old_items, old_bytes, new_items, ..Default::default() };
        assert_eq!(classify(&stats, thorough, 100), expected);
    }
}
