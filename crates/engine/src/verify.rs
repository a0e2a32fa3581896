//! Offline check of the ready directory against the catalog.
//!
//! An archive passes when its checksum matches the record and every member
//! the catalog refers to is present at its recorded size. Members nothing
//! refers to any more are what a compaction leaves behind when it stops
//! between committing the catalog and rebuilding the archive; they are
//! reported as reclaimable, not as damage.

use crate::error::{ErrorKind, Result};
use crate::group::Group;
use crate::report::{Issue, VerifyReport};
use coffer_archive::naming::{MANIFEST, member_name, parse_archive_name};
use coffer_archive::file_checksum;
use coffer_catalog::{ArchiveChecksum, Checksum, Session};
use exn::ResultExt;
use std::collections::BTreeMap;
use tracing::instrument;

/// Check every live archive's checksum and member listing.
///
/// Archives emptied by compaction aren't checked; they are listed as safe to
/// delete instead.
#[instrument(skip_all, fields(group = group.name()))]
pub async fn run(group: &Group) -> Result<VerifyReport> {
    let mut session = group.catalog().begin().await.or_raise(|| ErrorKind::Catalog)?;
    let checksums = session.list_checksums().await.or_raise(|| ErrorKind::Catalog)?;
    let mut report = VerifyReport::default();
    for record in &checksums {
        let Checksum::Live(expected) = &record.checksum else {
            report.safe_to_delete.push(record.name.clone());
            continue;
        };
        report.checked += 1;
        match check(&mut session, group, record, expected).await? {
            Checked::Passed { leftovers: None } => report.passed += 1,
            Checked::Passed { leftovers: Some(leftovers) } => {
                tracing::info!(archive = %record.name, detail = %leftovers.message, "archive holds expired members");
                report.passed += 1;
                report.reclaimable.push(leftovers);
            },
            Checked::Failed(issue) => {
                tracing::warn!(archive = %record.name, problem = %issue.message, "archive failed verification");
                report.issues.push(issue);
            },
        }
    }
    session.rollback().await.or_raise(|| ErrorKind::Catalog)?;
    tracing::info!(
        checked = report.checked,
        passed = report.passed,
        safe_to_delete = report.safe_to_delete.len(),
        reclaimable = report.reclaimable.len(),
        "verification complete",
    );
    Ok(report)
}

enum Checked {
    Passed { leftovers: Option<Issue> },
    Failed(Issue),
}

async fn check(
    session: &mut Session,
    group: &Group,
    record: &ArchiveChecksum,
    expected: &str,
) -> Result<Checked> {
    let path = group.layout().ready().join(&record.name);
    if !path.exists() {
        return Ok(Checked::Failed(Issue::new(&path, "archive missing")));
    }
    let actual = match file_checksum(&path) {
        Ok(actual) => actual,
        Err(e) => return Ok(Checked::Failed(Issue::new(&path, e.to_string()))),
    };
    if actual != expected {
        return Ok(Checked::Failed(Issue::new(&path, format!("checksum is {actual}, recorded {expected}"))));
    }
    let Some(location) = parse_archive_name(&record.name) else {
        return Ok(Checked::Failed(Issue::new(&path, "not a recognised archive name")));
    };

    let contents = session.list_contents_in_archive(location).await.or_raise(|| ErrorKind::Catalog)?;
    let mut present: BTreeMap<String, u64> = match group.tool().list(&path) {
        Ok(listed) => listed.into_iter().filter(|m| m.name != MANIFEST).map(|m| (m.name, m.size)).collect(),
        Err(e) => return Ok(Checked::Failed(Issue::new(&path, e.to_string()))),
    };
    for content in &contents {
        let name = member_name(content.id, content.compression);
        match present.remove(&name) {
            None => {
                let message = format!("member {name} ({} bytes) is missing", content.stored_length);
                return Ok(Checked::Failed(Issue::new(&path, message)));
            },
            Some(size) if size != content.stored_length => {
                let message = format!("member {name} is {size} bytes, recorded {}", content.stored_length);
                return Ok(Checked::Failed(Issue::new(&path, message)));
            },
            Some(_) => {},
        }
    }

    if present.is_empty() {
        return Ok(Checked::Passed { leftovers: None });
    }
    let bytes = present.values().fold(0u64, |total, size| total.saturating_add(*size));
    let message = format!("{} expired members ({bytes} bytes) left to reclaim", present.len());
    Ok(Checked::Passed { leftovers: Some(Issue::new(&path, message)) })
}
