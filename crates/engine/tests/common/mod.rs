#![allow(dead_code)]

use coffer_archive::ContainerFormat;
use coffer_catalog::{Content, FileRecord};
use coffer_config::{GroupConfig, RetryConfig, ScanMode};
use coffer_engine::Group;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// A root to back up and a data directory, both temporary.
pub struct Fixture {
    pub root: TempDir,
    pub data: TempDir,
    pub restore: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            data: tempfile::tempdir().unwrap(),
            restore: tempfile::tempdir().unwrap(),
        }
    }

    pub fn config(&self) -> GroupConfig {
        GroupConfig {
            roots: vec![self.root.path().to_path_buf()],
            exclude: Vec::new(),
            data_dir: self.data.path().to_path_buf(),
            archive_target_size: 1024 * 1024,
            archive_max_items: 100,
            compress: true,
            write_manifest: true,
            scan_mode: ScanMode::Fast,
            separate_audio_metadata: false,
            tag_tool: None,
            container: ContainerFormat::Tar,
            retention_days: 30,
            strip_threshold_bytes: 0,
            retry: RetryConfig { attempts: 1, delay_ms: 0 },
        }
    }

    pub async fn open(&self) -> Group {
        Group::open("test", &self.config()).await.unwrap()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    /// Write `contents` to `relative`, stamped `age` seconds in the past so
    /// successive writes always change the modification time.
    pub fn write(&self, relative: &str, contents: &[u8], age: u64) -> PathBuf {
        let path = self.path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        set_modified(&path, SystemTime::now() - Duration::from_secs(age));
        path
    }

    /// Where `source` ends up when restored into the restore directory.
    pub fn restored(&self, source: &Path) -> PathBuf {
        coffer_engine::restore::target_path(self.restore.path(), source)
    }
}

pub fn set_modified(path: &Path, when: SystemTime) {
    File::options().write(true).open(path).unwrap().set_modified(when).unwrap();
}

pub fn modified(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

pub async fn contents(group: &Group) -> Vec<Content> {
    let mut session = group.catalog().begin().await.unwrap();
    let contents = session.list_contents().await.unwrap();
    session.rollback().await.unwrap();
    contents
}

pub async fn file(group: &Group, path: &Path) -> Option<FileRecord> {
    let mut session = group.catalog().begin().await.unwrap();
    let record = session.get_file_by_path(path).await.unwrap();
    session.rollback().await.unwrap();
    record
}

/// Names of the archives in the ready directory.
pub fn ready(group: &Group) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(group.layout().ready())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
