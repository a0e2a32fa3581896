//! Tag-stripping tools, used to hash audio files without their metadata.

use crate::error::{ErrorKind, Result};
use crate::hasher::{Identity, hash_reader};
use coffer_archive::RetryPolicy;
use coffer_config::TagToolConfig;
use exn::ResultExt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

const ID3V2_HEADER: u64 = 10;
const ID3V2_FOOTER: u64 = 10;
const ID3V1_TAG: u64 = 128;

pub trait TagTool {
    /// Whether files of this type (lowercase extension) carry tags this tool
    /// knows how to strip.
    fn supports(&self, file_type: &str) -> bool;

    /// Identity of the file's payload, with tag metadata excluded.
    fn strip_and_hash(&self, path: &Path) -> Result<Identity>;
}

/// Built-in MP3 support: skips a leading ID3v2 tag and a trailing ID3v1 tag.
#[derive(Clone, Copy, Debug, Default)]
pub struct Id3Stripper;

impl Id3Stripper {
    /// Byte range of the payload within a file of `length` bytes.
    fn payload(file: &mut File, length: u64) -> std::io::Result<(u64, u64)> {
        let mut start = 0;
        if length >= ID3V2_HEADER {
            let mut header = [0u8; ID3V2_HEADER as usize];
            file.read_exact(&mut header)?;
            // The size is "synchsafe": 7 bits per byte, high bit always clear.
            if &header[..3] == b"ID3" && header[6..].iter().all(|b| b & 0x80 == 0) {
                let size = header[6..].iter().fold(0u64, |acc, b| (acc << 7) | u64::from(*b));
                let footer = if header[5] & 0x10 != 0 { ID3V2_FOOTER } else { 0 };
                start = (ID3V2_HEADER + size + footer).min(length);
            }
        }
        let mut end = length;
        if end - start >= ID3V1_TAG {
            let mut marker = [0u8; 3];
            file.seek(SeekFrom::Start(end - ID3V1_TAG))?;
            file.read_exact(&mut marker)?;
            if &marker == b"TAG" {
                end -= ID3V1_TAG;
            }
        }
        Ok((start, end))
    }
}

impl TagTool for Id3Stripper {
    fn supports(&self, file_type: &str) -> bool {
        file_type == "mp3"
    }

    fn strip_and_hash(&self, path: &Path) -> Result<Identity> {
        let mut file = File::open(path).map_err(ErrorKind::Io)?;
        let length = file.metadata().map_err(ErrorKind::Io)?.len();
        let (start, end) = Self::payload(&mut file, length).map_err(ErrorKind::Io)?;
        file.seek(SeekFrom::Start(start)).map_err(ErrorKind::Io)?;
        tracing::trace!(path = %path.display(), start, end, "hashing audio payload");
        Ok(hash_reader(file.take(end - start)).map_err(ErrorKind::Io)?)
    }
}

/// A configured external command that writes a file's payload, tags
/// removed, to an output file which is then hashed.
#[derive(Clone, Debug)]
pub struct ExternalTagTool {
    program: PathBuf,
    args: Vec<String>,
    extensions: Vec<String>,
    output: PathBuf,
    retry: RetryPolicy,
}

impl ExternalTagTool {
    /// Locate the configured program. A tool that cannot be found is fatal
    /// before any file is processed.
    pub fn new(config: &TagToolConfig, scratch: &Path, retry: RetryPolicy) -> Result<Self> {
        let program =
            which::which(&config.program).or_raise(|| ErrorKind::TagToolNotFound(config.program.clone()))?;
        Ok(Self {
            program,
            args: config.args.clone(),
            extensions: config.extensions.iter().map(|e| e.to_lowercase()).collect(),
            output: scratch.join("tagless.payload"),
            retry,
        })
    }

    fn args_for(&self, input: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = self.output.to_string_lossy();
        self.args.iter().map(|arg| arg.replace("{input}", &input).replace("{output}", &output)).collect()
    }
}

impl TagTool for ExternalTagTool {
    fn supports(&self, file_type: &str) -> bool {
        self.extensions.iter().any(|e| e == file_type)
    }

    fn strip_and_hash(&self, path: &Path) -> Result<Identity> {
        let _ = fs::remove_file(&self.output);
        let args = self.args_for(path);
        let output = self
            .retry
            .run("run tag tool", || Command::new(&self.program).args(&args).output())
            .map_err(ErrorKind::Io)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            exn::bail!(ErrorKind::TagTool(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        let file = File::open(&self.output)
            .or_raise(|| ErrorKind::TagTool(format!("no payload written for {}", path.display())))?;
        let identity = hash_reader(file).map_err(ErrorKind::Io);
        let _ = fs::remove_file(&self.output);
        Ok(identity?)
    }
}
