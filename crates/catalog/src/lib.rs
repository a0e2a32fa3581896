//! SQLite catalog for a backup group.
//!
//! The catalog is the metadata store that lets any recorded point in time be
//! reconstructed from the archives on disk. It tracks:
//!
//! - **Collections**: one row per backup run, used as time markers for restore
//!   selection and for the compaction cutoff.
//! - **Contents**: one row per distinct piece of content, deduplicated by
//!   (BLAKE3 hash, comparable length). The row id is the member name inside
//!   the archive that holds the bytes.
//! - **Files**: one row per tracked path, pointing at its current content.
//! - **Archive checksums**: whole-archive checksums, or a marker saying an
//!   archive is no longer needed.
//! - **Settings**: small key/value pairs describing the group layout.
//!
//! Every read and write goes through a [`Session`], which wraps a single
//! database transaction. Nothing is visible to other sessions until
//! [`Session::commit`] succeeds, and dropping a session rolls it back.

mod db;
pub mod error;
mod models;
mod session;

pub use crate::db::Catalog;
pub use crate::models::{
    ArchiveChecksum, ArchiveStatus, Checksum, Collection, CollectionId, CollectionTotals, Content, ContentId,
    FileRecord, FileStatus, Location, NewContent, NewFile,
};
pub use crate::session::Session;
