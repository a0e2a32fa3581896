//! Stream compression and format detection for archived content.
//!
//! This crate wraps several compression libraries behind a unified
//! [`Compression`] enum, providing:
//!
//! - **Format detection** from member suffixes ([`Compression::from_path`])
//!   or leading bytes ([`Compression::sniff`])
//! - **Streaming** ([`Compression::wrap_reader`],
//!   [`Compression::compress_stream`])
//! - **File-to-file** compression for staging archive members
//!   ([`Compression::compress_file`], [`Compression::decompress_file`])
//! - **Incompressibility checks** ([`is_incompressible`]) so that content
//!   which is already compressed gets stored as-is.
//!
//! Bzip2 and Gzip are always available. XZ is enabled by default, Zstd is
//! behind a feature flag.

pub mod error;
mod format;
mod incompressible;
mod ops;

pub use crate::incompressible::{MAGIC_PEEK_LEN, is_incompressible};

/// A supported compression format.
///
/// Variants gated behind feature flags (`xz`, `zstd`) are only available
/// when the corresponding feature is enabled. Defaults to
/// [`None`](Self::None) (uncompressed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Uncompressed
    #[default]
    None,
    /// Bzip2 compression (.bz2)
    Bzip2,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    #[cfg(feature = "xz")]
    Xz,
    /// Zstd compression (.zst)
    #[cfg(feature = "zstd")]
    Zstd,
}
