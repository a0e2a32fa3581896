use super::from_sql_int;
use crate::CollectionId;
use crate::error::{Error, ErrorKind, Result};
use coffer_compress::Compression;
use exn::ResultExt;

/// Content ids double as archive member names, so they are never reused.
pub type ContentId = u64;

/// Where the bytes of a content record physically live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub collection: CollectionId,
    /// Archive numbers start at 1 within each collection. Zero means the
    /// content has not been assigned to an archive yet.
    pub archive: u32,
}

/// One distinct piece of file content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Content {
    pub id: ContentId,
    /// BLAKE3 hash (lowercase hex) of the comparable payload.
    pub hash: String,
    /// CRC32 of the comparable payload, used as a cheap secondary check.
    pub crc32: u32,
    /// Comparable length: the raw length for ordinary files, the payload
    /// length (tags excluded) for audio files hashed with metadata separation.
    pub length: u64,
    /// Length of the member as stored inside its archive.
    pub stored_length: u64,
    /// How the member is stored ([`Compression::None`] for raw copies).
    pub compression: Compression,
    /// Where the bytes were first written ("origin").
    pub location: Location,
    /// The most recent collection with a file that still points at this content.
    pub watermark: CollectionId,
}

/// The identity of a piece of content that is about to be recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewContent {
    pub hash: String,
    pub crc32: u32,
    pub length: u64,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ContentRow {
    pub(crate) id: i64,
    pub(crate) hash: String,
    pub(crate) crc32: i64,
    pub(crate) length: i64,
    pub(crate) stored_length: i64,
    pub(crate) compression: String,
    pub(crate) collection_id: i64,
    pub(crate) archive_number: i64,
    pub(crate) watermark: i64,
}

impl TryFrom<ContentRow> for Content {
    type Error = Error;
    fn try_from(row: ContentRow) -> Result<Self> {
        Ok(Self {
            id: from_sql_int(row.id, "content id")?,
            hash: row.hash,
            crc32: u32::try_from(row.crc32).or_raise(|| ErrorKind::InvalidData("crc32"))?,
            length: from_sql_int(row.length, "content length")?,
            stored_length: from_sql_int(row.stored_length, "stored length")?,
            compression: row
                .compression
                .parse::<Compression>()
                .or_raise(|| ErrorKind::InvalidData("compression format"))?,
            location: Location {
                collection: from_sql_int(row.collection_id, "origin collection")?,
                archive: u32::try_from(row.archive_number).or_raise(|| ErrorKind::InvalidData("archive number"))?,
            },
            watermark: from_sql_int(row.watermark, "watermark")?,
        })
    }
}
