//! External 7-Zip backend.
//!
//! Every call shells out to `7z` (or `7za`/`7zz`) and goes through the retry
//! policy. 7-Zip reports files locked by another process as a warning (exit
//! code 1), which is retried; anything else fails immediately with the exit
//! status and stderr.

use crate::container::{ContainerTool, Member, Selection};
use crate::error::{ErrorKind, Result};
use crate::retry::RetryPolicy;
use exn::ResultExt;
use regex::Regex;
use std::ffi::{OsStr, OsString};
use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;
use tracing::instrument;

const EXECUTABLES: [&str; 3] = ["7z", "7za", "7zz"];

static PROPERTY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(Path|Size|Folder|Attributes) = (.*)$").unwrap());

#[derive(Clone, Debug)]
pub struct SevenZipContainer {
    binary: PathBuf,
    retry: RetryPolicy,
}

impl SevenZipContainer {
    /// Find a 7-Zip executable on `PATH`.
    pub fn discover(retry: RetryPolicy) -> Result<Self> {
        for exe in EXECUTABLES {
            if let Ok(binary) = which::which(exe) {
                tracing::debug!(binary = %binary.display(), "discovered 7-Zip");
                return Ok(Self { binary, retry });
            }
        }
        tracing::info!("7-Zip executable not found in PATH");
        exn::bail!(ErrorKind::ToolNotFound("7z, 7za, 7zz"));
    }

    pub fn with_binary(binary: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self { binary: binary.into(), retry }
    }

    fn run(&self, operation: &str, args: &[&OsStr], cwd: Option<&Path>) -> Result<String> {
        let output = self
            .retry
            .run(operation, || {
                let mut command = Command::new(&self.binary);
                command.args(args);
                if let Some(cwd) = cwd {
                    command.current_dir(cwd);
                }
                let output = command.output()?;
                match output.status.code() {
                    Some(0) => Ok(output),
                    Some(1) => Err(IoError::new(IoErrorKind::WouldBlock, describe(&output))),
                    _ => Err(IoError::other(describe(&output))),
                }
            })
            .or_raise(|| ErrorKind::Tool(format!("7-Zip {operation}")))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn describe(output: &Output) -> String {
    format!("{}: {}", output.status, String::from_utf8_lossy(&output.stderr).trim())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| ErrorKind::io(e, path).into())
}

/// Parse the technical listing (`7z l -slt`) into members, skipping folders.
fn parse_listing(listing: &str) -> Vec<Member> {
    // Everything before the dashed separator describes the archive itself.
    let Some((_, entries)) = listing.split_once("\n----------") else {
        return Vec::new();
    };
    let mut members = Vec::new();
    let mut current: Option<(String, u64, bool)> = None;
    for line in entries.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some((name, size, false)) = current.take() {
                members.push(Member { name, size });
            }
            continue;
        }
        let Some(captures) = PROPERTY.captures(line) else {
            continue;
        };
        let value = &captures[2];
        match &captures[1] {
            "Path" => {
                if let Some((name, size, false)) = current.take() {
                    members.push(Member { name, size });
                }
                current = Some((value.to_string(), 0, false));
            },
            "Size" => {
                if let Some(entry) = current.as_mut() {
                    entry.1 = value.parse().unwrap_or(0);
                }
            },
            "Folder" if value == "+" => {
                if let Some(entry) = current.as_mut() {
                    entry.2 = true;
                }
            },
            "Attributes" if value.starts_with('D') => {
                if let Some(entry) = current.as_mut() {
                    entry.2 = true;
                }
            },
            _ => {},
        }
    }
    if let Some((name, size, false)) = current {
        members.push(Member { name, size });
    }
    members
}

impl ContainerTool for SevenZipContainer {
    fn extension(&self) -> &'static str {
        "7z"
    }

    #[instrument(skip(self, container, input), fields(container = %container.display()))]
    fn add(&self, container: &Path, input: &Path, member: &str, expected_size: u64) -> Result<()> {
        let size = std::fs::metadata(input).map_err(|e| ErrorKind::io(e, input))?.len();
        if size != expected_size {
            exn::bail!(ErrorKind::Verification(format!(
                "{} is {size} bytes, expected {expected_size}",
                input.display()
            )));
        }
        let container = absolute(container)?;
        // 7-Zip names a member after the path it was given, so the input is
        // staged under its member name and added from that directory.
        let mut stage = container.clone().into_os_string();
        stage.push(".add");
        let stage = PathBuf::from(stage);
        std::fs::create_dir_all(&stage).or_raise(|| ErrorKind::Workspace(stage.clone()))?;
        let staged = stage.join(member);
        let _ = std::fs::remove_file(&staged);
        self.retry
            .run("stage member", || {
                std::fs::hard_link(input, &staged).or_else(|_| std::fs::copy(input, &staged).map(|_| ()))
            })
            .map_err(|e| ErrorKind::io(e, input))?;
        let args = [
            OsStr::new("a"),
            OsStr::new("-t7z"),
            OsStr::new("-bd"),
            OsStr::new("-y"),
            container.as_os_str(),
            OsStr::new(member),
        ];
        let result = self.run("add", &args, Some(&stage));
        let _ = std::fs::remove_dir_all(&stage);
        result.map(|_| ())
    }

    fn list(&self, container: &Path) -> Result<Vec<Member>> {
        if !container.exists() {
            exn::bail!(ErrorKind::NotFound(container.to_path_buf()));
        }
        let args = [OsStr::new("l"), OsStr::new("-slt"), container.as_os_str()];
        Ok(parse_listing(&self.run("list", &args, None)?))
    }

    #[instrument(skip(self, container, destination), fields(container = %container.display()))]
    fn extract(&self, container: &Path, selection: Selection<'_>, destination: &Path) -> Result<()> {
        if let Selection::Member(member) = selection
            && !self.list(container)?.iter().any(|m| m.name == member)
        {
            exn::bail!(ErrorKind::MemberNotFound(member.to_string()));
        }
        let mut output = OsString::from("-o");
        output.push(destination.as_os_str());
        let mut args = vec![OsStr::new("e"), OsStr::new("-bd"), OsStr::new("-y"), output.as_os_str()];
        args.push(container.as_os_str());
        if let Selection::Member(member) = selection {
            args.push(OsStr::new(member));
        }
        self.run("extract", &args, None).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
7-Zip [64] 16.02 : Copyright (c) 1999-2016 Igor Pavlov : 2016-05-21

Scanning the drive for archives:
1 file, 512 bytes (1 KiB)

Listing archive: 00000001_0001.7z

--
Path = 00000001_0001.7z
Type = 7z
Physical Size = 512
Headers Size = 180
Method = LZMA2:12
Solid = +
Blocks = 1

----------
Path = 00000001.file
Size = 100
Packed Size = 60
Modified = 2024-01-01 00:00:00
Attributes = A_ -rw-r--r--
CRC = CBF43926

Path = nested
Size = 0
Folder = +
Attributes = D_ drwxr-xr-x

Path = 00000002.xz
Size = 64
Packed Size =
Attributes = A_ -rw-r--r--
";

    #[test]
    fn test_parse_listing_skips_archive_header_and_folders() {
        assert_eq!(
            parse_listing(LISTING),
            vec![Member::new("00000001.file", 100), Member::new("00000002.xz", 64)]
        );
    }

    #[test]
    fn test_parse_listing_without_entries() {
        assert!(parse_listing("7-Zip 16.02\n\nPath = empty.7z\nType = 7z\n").is_empty());
    }

    #[test]
    fn test_missing_binary_is_reported_as_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("c.7z");
        std::fs::write(&container, b"").unwrap();
        let tool = SevenZipContainer::with_binary(dir.path().join("no-such-7z"), RetryPolicy::none());
        let err = tool.list(&container).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Tool(_)));
    }
}
