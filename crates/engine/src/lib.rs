//! The coffer backup engine.
//!
//! Everything here works on an opened [`Group`]:
//!
//! - [`backup`]: walk the roots, deduplicate by content and pack anything new
//!   into this run's archives.
//! - [`restore`]: bring back the files of a past collection.
//! - [`compact`]: expire content that only collections older than the
//!   retention period use.
//! - [`verify`]: check the archives on disk against the catalog.
//!
//! Operations fail outright only when continuing could damage the catalog
//! or the archives. Anything else is reported per file on the returned
//! report.

pub mod backup;
pub mod compact;
pub mod error;
mod group;
pub mod hasher;
mod lock;
pub mod report;
pub mod restore;
mod settings;
pub mod tags;
pub mod verify;
mod walk;

pub use crate::compact::{Action, CompactionPlan, Compactor};
pub use crate::group::Group;
pub use crate::report::{BackupReport, CompactReport, Issue, RestoreReport, VerifyReport};
pub use crate::restore::RestoreRequest;
