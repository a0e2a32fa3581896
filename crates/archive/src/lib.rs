//! Archive containers for coffer.
//!
//! Content is packed into size-bounded containers, one or more per
//! collection. This crate owns everything about those containers:
//!
//! - **The container seam** ([`ContainerTool`]): add, list, extract,
//!   compress, decompress and verify, with a pure-library tar backend
//!   ([`TarContainer`]) and an external 7-Zip backend ([`SevenZipContainer`]).
//! - **Naming** ([`naming`]): archive and member file names.
//! - **The Archive Manager** ([`ArchiveManager`]): packing with rotation,
//!   verification on seal, and publishing into the ready directory, plus
//!   [`repack`] for rebuilding an archive with fewer members.
//! - **Retries** ([`RetryPolicy`]) shared by every disk and process call.

mod checksum;
mod container;
pub mod error;
mod layout;
mod manager;
pub mod naming;
pub mod retry;
mod sevenzip;
mod tarball;

pub use crate::checksum::file_checksum;
pub use crate::container::{ContainerFormat, ContainerTool, Member, Selection};
pub use crate::layout::Layout;
pub use crate::manager::{ArchiveManager, PackOptions, Published, Repacked, Stored, repack};
pub use crate::retry::RetryPolicy;
pub use crate::sevenzip::SevenZipContainer;
pub use crate::tarball::TarContainer;
