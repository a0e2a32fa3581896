//! Compression Operations

use crate::Compression;
use crate::error::{ErrorKind, Result};
use bzip2::{Compression as BzCompression, read::BzDecoder, write::BzEncoder};
use exn::ResultExt;
use flate2::{Compression as GzCompression, read::GzDecoder, write::GzEncoder};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::instrument;
#[cfg(feature = "xz")]
use xz2::{read::XzDecoder, write::XzEncoder};
#[cfg(feature = "zstd")]
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

// Archives are written once and kept for a long time, so storage space wins
// over speed. Pick a different format if these levels are too slow.
const BZIP2_LEVEL: BzCompression = BzCompression::best();
const GZIP_LEVEL: GzCompression = GzCompression::best();
#[cfg(feature = "xz")]
const XZ_LEVEL: u32 = 9;
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 19;

impl Compression {
    /// Wrap a reader with the appropriate decompression layer.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::io::{Cursor, Read};
    /// use coffer_compress::Compression;
    ///
    /// let mut compressed = Vec::new();
    /// Compression::Gzip.compress_stream(Cursor::new(b"Hello, world!"), &mut compressed).unwrap();
    /// let mut reader = Compression::Gzip.wrap_reader(Cursor::new(compressed)).unwrap();
    /// let mut decompressed = Vec::new();
    /// reader.read_to_end(&mut decompressed).unwrap();
    /// assert_eq!(decompressed, b"Hello, world!");
    /// ```
    pub fn wrap_reader<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Bzip2 => Box::new(BzDecoder::new(reader)),
            Compression::Gzip => Box::new(GzDecoder::new(reader)),
            #[cfg(feature = "xz")]
            Compression::Xz => Box::new(XzDecoder::new(reader)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => Box::new(ZstdDecoder::new(reader).or_raise(|| ErrorKind::Encoder)?),
        })
    }

    /// Compress everything from `reader` into `writer`, finishing the encoder
    /// before returning. Returns the number of uncompressed bytes consumed.
    pub fn compress_stream<R: Read, W: Write>(&self, mut reader: R, writer: W) -> Result<u64> {
        let consumed = match self {
            Compression::None => {
                let mut writer = writer;
                std::io::copy(&mut reader, &mut writer).or_raise(|| ErrorKind::Io)?
            },
            Compression::Bzip2 => {
                let mut encoder = BzEncoder::new(writer, BZIP2_LEVEL);
                let consumed = std::io::copy(&mut reader, &mut encoder).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
                consumed
            },
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(writer, GZIP_LEVEL);
                let consumed = std::io::copy(&mut reader, &mut encoder).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
                consumed
            },
            #[cfg(feature = "xz")]
            Compression::Xz => {
                let mut encoder = XzEncoder::new(writer, XZ_LEVEL);
                let consumed = std::io::copy(&mut reader, &mut encoder).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
                consumed
            },
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                let mut encoder = ZstdEncoder::new(writer, ZSTD_LEVEL).or_raise(|| ErrorKind::Encoder)?;
                let consumed = std::io::copy(&mut reader, &mut encoder).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?;
                consumed
            },
        };
        Ok(consumed)
    }

    /// Decompress from a reader to a writer, returning bytes written.
    pub fn decompress_stream<'a, R: Read + 'a, W: Write>(&self, reader: R, mut writer: W) -> Result<u64> {
        let mut reader = self.wrap_reader(reader)?;
        std::io::copy(&mut reader, &mut writer).or_raise(|| ErrorKind::InvalidData)
    }

    /// Compress the file at `input` into a new file at `output`.
    ///
    /// Returns the size of the compressed output on disk, which is what
    /// archive size accounting needs.
    #[instrument(skip_all, fields(format = %self, input = %input.as_ref().display(), output_size))]
    pub fn compress_file(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<u64> {
        let reader = BufReader::new(File::open(input.as_ref()).or_raise(|| ErrorKind::Io)?);
        let mut writer = BufWriter::new(File::create(output.as_ref()).or_raise(|| ErrorKind::Io)?);
        self.compress_stream(reader, &mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error()).or_raise(|| ErrorKind::Io)?;
        file.sync_all().or_raise(|| ErrorKind::Io)?;
        let size = file.metadata().or_raise(|| ErrorKind::Io)?.len();
        tracing::Span::current().record("output_size", size);
        Ok(size)
    }

    /// Decompress the file at `input` into a new file at `output`, returning
    /// the number of decompressed bytes written.
    #[instrument(skip_all, fields(format = %self, input = %input.as_ref().display()))]
    pub fn decompress_file(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<u64> {
        let reader = BufReader::new(File::open(input.as_ref()).or_raise(|| ErrorKind::Io)?);
        let mut writer = BufWriter::new(File::create(output.as_ref()).or_raise(|| ErrorKind::Io)?);
        let written = self.decompress_stream(reader, &mut writer)?;
        writer.flush().or_raise(|| ErrorKind::Io)?;
        Ok(written)
    }
}
