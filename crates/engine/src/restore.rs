//! Restore orchestration.
//!
//! The catalog only keeps the latest state of every path, so a restore of
//! collection N picks every record still tracked at or after N and restores
//! the newest archived content for it. Records whose content can't be
//! guaranteed to match collection N are restored anyway and reported as
//! caveats.

use crate::error::{Error, ErrorKind, Result};
use crate::group::Group;
use crate::hasher::Hasher;
use crate::report::{Issue, RestoreReport};
use coffer_archive::naming::{archive_name, member_name};
use coffer_archive::{RetryPolicy, Selection};
use coffer_catalog::{CollectionId, Content, FileRecord, FileStatus};
use coffer_compress::Compression;
use exn::ResultExt;
use globset::GlobBuilder;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::instrument;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreRequest {
    pub collection: CollectionId,
    /// Glob matched against the absolute source path; `*` crosses directories.
    pub pattern: String,
    pub destination: PathBuf,
    /// List what would be restored without extracting anything.
    pub preview: bool,
    /// Don't re-hash restored files.
    pub skip_verify: bool,
}

/// `destination` joined with `source` minus its root and prefix.
pub fn target_path(destination: &Path, source: &Path) -> PathBuf {
    let relative: PathBuf = source.components().filter(|c| matches!(c, Component::Normal(_))).collect();
    destination.join(relative)
}

#[instrument(skip_all, fields(group = group.name(), collection = request.collection, pattern = %request.pattern))]
pub async fn run(group: &Group, request: &RestoreRequest) -> Result<RestoreReport> {
    let matcher = GlobBuilder::new(&request.pattern)
        .literal_separator(false)
        .build()
        .or_raise(|| ErrorKind::Pattern(request.pattern.clone()))?
        .compile_matcher();
    let mut session = group.catalog().begin().await.or_raise(|| ErrorKind::Catalog)?;
    let chosen = session.get_collection(request.collection).await.or_raise(|| ErrorKind::Catalog)?;
    if !chosen.is_finished() {
        tracing::warn!(collection = chosen.id, "restoring from a collection that never finished");
    }
    let files = session.list_files(None).await.or_raise(|| ErrorKind::Catalog)?;

    let workdir = group.layout().scratch().join("restore");
    if !request.preview {
        fs::create_dir_all(&workdir).or_raise(|| ErrorKind::Workspace(workdir.clone()))?;
    }
    let hasher = group.hasher();
    let mut report = RestoreReport::default();
    for record in files.iter().filter(|r| r.collection >= chosen.id && matcher.is_match(&r.path)) {
        report.matched += 1;
        if request.preview {
            report.paths.push(record.path.clone());
            continue;
        }
        let Some(content_id) = record.content else {
            report.issues.push(Issue::new(&record.path, "never archived"));
            continue;
        };
        let content = match session.get_content(content_id).await {
            Ok(content) => content,
            Err(e) => {
                report.issues.push(Issue::new(&record.path, e.to_string()));
                continue;
            },
        };
        if record.status != FileStatus::Complete {
            report.caveats.push(Issue::new(
                &record.path,
                format!("not fully backed up in collection {}; restored the last archived version", chosen.id),
            ));
        } else if content.location.collection > chosen.id {
            report.caveats.push(Issue::new(
                &record.path,
                format!("restored content was archived after collection {}", chosen.id),
            ));
        }
        let target = target_path(&request.destination, &record.path);
        match restore_one(group, &hasher, record, &content, &workdir, &target, request.skip_verify) {
            Ok(()) => report.restored += 1,
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(path = %record.path.display(), error = %message, "restore failed");
                report.issues.push(Issue::new(&record.path, message));
            },
        }
    }
    session.rollback().await.or_raise(|| ErrorKind::Catalog)?;
    if !request.preview {
        let _ = fs::remove_dir_all(&workdir);
    }
    tracing::info!(
        matched = report.matched,
        restored = report.restored,
        issues = report.issues.len(),
        "restore complete",
    );
    Ok(report)
}

fn describe<E>(err: exn::Exn<E>) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = (*err).to_string();
    err.raise(ErrorKind::Restore(message))
}

fn restore_one(
    group: &Group,
    hasher: &Hasher<'_>,
    record: &FileRecord,
    content: &Content,
    workdir: &Path,
    target: &Path,
    skip_verify: bool,
) -> Result<()> {
    let tool = group.tool();
    let archive = group.layout().ready().join(archive_name(content.location, tool.extension()));
    let member = member_name(content.id, content.compression);
    tool.extract(&archive, Selection::Member(&member), workdir).map_err(describe)?;
    let extracted = workdir.join(&member);
    let payload = match content.compression {
        Compression::None => extracted,
        compression => {
            let output = workdir.join(format!("{member}.out"));
            let decompressed = tool.decompress(compression, &extracted, &output);
            let _ = fs::remove_file(&extracted);
            decompressed.map_err(describe)?;
            output
        },
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).or_raise(|| ErrorKind::Workspace(parent.to_path_buf()))?;
    }
    move_into_place(&payload, target, group.retry())?;

    if !skip_verify {
        let restored = hasher.identify_path(target)?;
        if restored.hash != content.hash || restored.length != content.length || restored.crc32 != content.crc32 {
            exn::bail!(ErrorKind::Verification(format!(
                "restored content hashes to {} ({} bytes), expected {} ({} bytes)",
                restored.hash, restored.length, content.hash, content.length
            )));
        }
    }

    let file = File::options().write(true).open(target).map_err(ErrorKind::Io)?;
    file.set_modified(SystemTime::from(record.modified)).map_err(ErrorKind::Io)?;
    drop(file);
    set_permissions(target, record.permissions)?;
    tracing::debug!(path = %record.path.display(), target = %target.display(), "restored");
    Ok(())
}

/// Rename, falling back to copy-and-delete across filesystems.
fn move_into_place(from: &Path, to: &Path, retry: RetryPolicy) -> Result<()> {
    if retry.run("move restored file", || fs::rename(from, to)).is_ok() {
        return Ok(());
    }
    retry.run("copy restored file", || fs::copy(from, to)).map_err(ErrorKind::Io)?;
    let _ = fs::remove_file(from);
    Ok(())
}

#[cfg(unix)]
fn set_permissions(target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        fs::set_permissions(target, fs::Permissions::from_mode(mode)).map_err(ErrorKind::Io)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_target: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
