//! Configuration for coffer.
//!
//! Configuration is layered with `figment`: built-in defaults, then a config
//! file (TOML, YAML or JSON, chosen by extension), then `COFFER_`-prefixed
//! environment variables. Nested keys are separated by a double underscore,
//! so `COFFER_GROUPS__HOME__RETENTION_DAYS=30` overrides
//! `groups.home.retention_days`.
//!
//! ```toml
//! [groups.home]
//! roots = ["/home/pooh"]
//! exclude = ["**/.cache/**", "**/*.tmp"]
//! data_dir = "/mnt/backup/home"
//! retention_days = 90
//! ```

mod defaults;
pub mod error;

use crate::defaults::*;
use crate::error::{ErrorKind, Result};
use coffer_archive::{ContainerFormat, PackOptions, RetryPolicy};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "COFFER_";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

/// One backup group: a set of roots backed up together into one data directory.
#[derive(Clone, Debug, Deserialize)]
pub struct GroupConfig {
    /// Directories to walk. Must be absolute.
    pub roots: Vec<PathBuf>,
    /// Glob patterns matched against absolute paths; matches are skipped.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Where the catalog and archives live. Must be absolute.
    pub data_dir: PathBuf,
    #[serde(default = "default_archive_target_size")]
    pub archive_target_size: u64,
    #[serde(default = "default_archive_max_items")]
    pub archive_max_items: u64,
    /// Compress members that aren't already compressed.
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default = "default_true")]
    pub write_manifest: bool,
    #[serde(default)]
    pub scan_mode: ScanMode,
    /// Hash audio files without their tags, so tag-only edits don't store a
    /// second copy.
    #[serde(default)]
    pub separate_audio_metadata: bool,
    /// External tag-stripping command; the built-in MP3 stripper is used
    /// when unset.
    #[serde(default)]
    pub tag_tool: Option<TagToolConfig>,
    #[serde(default, deserialize_with = "from_str")]
    pub container: ContainerFormat,
    /// How old a collection must be before compaction may expire it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Thorough compaction only rewrites an archive once at least this many
    /// expired bytes can be reclaimed from it.
    #[serde(default = "default_strip_threshold_bytes")]
    pub strip_threshold_bytes: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Whether unchanged length and modification time are trusted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Skip hashing files whose length and modification time are unchanged.
    /// Content edited without changing either goes unnoticed.
    #[default]
    Fast,
    /// Hash every file on every run.
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TagToolConfig {
    pub program: PathBuf,
    /// Arguments; `{input}` and `{output}` are replaced with the audio file
    /// and the file the stripped payload must be written to.
    #[serde(default)]
    pub args: Vec<String>,
    /// File extensions (lowercase, without the dot) the tool handles.
    #[serde(default = "default_tag_extensions")]
    pub extensions: Vec<String>,
}

fn default_tag_extensions() -> Vec<String> {
    vec!["mp3".to_string()]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { attempts: default_retry_attempts(), delay_ms: default_retry_delay_ms() }
    }
}

fn from_str<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(serde::de::Error::custom)
}

impl Config {
    /// `<config dir>/coffer/config.toml` for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "coffer").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path` (or the default location) merged with the
    /// environment, then validate every group.
    ///
    /// An explicit `path` must exist; a missing default file is fine.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.exists() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };
        let mut figment = Figment::new();
        if let Some(file) = file {
            tracing::debug!(path = %file.display(), "loading configuration file");
            figment = match file.extension().and_then(|e| e.to_str()) {
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => figment.merge(Toml::file(file)),
            };
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Parse)?;
        for (name, group) in &config.groups {
            group.validate(name)?;
        }
        Ok(config)
    }

    pub fn group(&self, name: &str) -> Result<&GroupConfig> {
        match self.groups.get(name) {
            Some(group) => Ok(group),
            None => exn::bail!(ErrorKind::UnknownGroup(name.to_string())),
        }
    }
}

impl GroupConfig {
    fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: String| ErrorKind::Invalid { group: name.to_string(), reason };
        if self.roots.is_empty() {
            exn::bail!(invalid("at least one root is required".to_string()));
        }
        if let Some(root) = self.roots.iter().find(|r| !r.is_absolute()) {
            exn::bail!(invalid(format!("root {} is not absolute", root.display())));
        }
        if !self.data_dir.is_absolute() {
            exn::bail!(invalid(format!("data_dir {} is not absolute", self.data_dir.display())));
        }
        if let Some(root) = self.roots.iter().find(|r| self.data_dir.starts_with(r)) {
            exn::bail!(invalid(format!("data_dir is inside root {}", root.display())));
        }
        if self.archive_target_size == 0 {
            exn::bail!(invalid("archive_target_size must be greater than zero".to_string()));
        }
        if self.archive_max_items == 0 {
            exn::bail!(invalid("archive_max_items must be greater than zero".to_string()));
        }
        if let Some(tool) = &self.tag_tool
            && !tool.args.iter().any(|a| a.contains("{output}"))
        {
            exn::bail!(invalid("tag_tool.args must contain an {output} placeholder".to_string()));
        }
        Ok(())
    }

    pub fn pack_options(&self) -> PackOptions {
        PackOptions {
            target_size: self.archive_target_size,
            max_items: self.archive_max_items,
            write_manifest: self.write_manifest,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { attempts: self.retry.attempts, delay: Duration::from_millis(self.retry.delay_ms) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    const MINIMAL: &str = r#"
        [groups.home]
        roots = ["/home/pooh"]
        data_dir = "/mnt/backup/home"
    "#;

    fn parse(toml: &str) -> Result<Config> {
        Config::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    #[test]
    fn test_defaults() {
        let config = parse(MINIMAL).unwrap();
        let group = config.group("home").unwrap();
        assert_eq!(group.scan_mode, ScanMode::Fast);
        assert_eq!(group.container, ContainerFormat::Tar);
        assert!(group.compress);
        assert!(group.write_manifest);
        assert!(!group.separate_audio_metadata);
        assert_eq!(group.retry_policy(), RetryPolicy { attempts: 5, delay: Duration::from_millis(250) });
        assert_eq!(group.pack_options().target_size, 512 * 1024 * 1024);
    }

    #[test]
    fn test_full_group() {
        let config = parse(
            r#"
            [groups.music]
            roots = ["/srv/music"]
            exclude = ["**/*.tmp"]
            data_dir = "/mnt/backup/music"
            archive_target_size = 1048576
            archive_max_items = 50
            compress = false
            scan_mode = "full"
            separate_audio_metadata = true
            container = "7z"
            retention_days = 30
            tag_tool = { program = "/usr/bin/strip-tags", args = ["{input}", "{output}"] }
            retry = { attempts = 2, delay_ms = 10 }
            "#,
        )
        .unwrap();
        let group = config.group("music").unwrap();
        assert_eq!(group.scan_mode, ScanMode::Full);
        assert_eq!(group.container, ContainerFormat::SevenZip);
        assert_eq!(group.tag_tool.as_ref().unwrap().extensions, vec!["mp3".to_string()]);
        assert_eq!(group.pack_options().max_items, 50);
        assert_eq!(group.retry_policy().attempts, 2);
    }

    #[rstest]
    #[case::no_roots("roots = []\ndata_dir = \"/mnt/b\"")]
    #[case::relative_root("roots = [\"home\"]\ndata_dir = \"/mnt/b\"")]
    #[case::relative_data_dir("roots = [\"/home\"]\ndata_dir = \"b\"")]
    #[case::data_dir_inside_root("roots = [\"/home\"]\ndata_dir = \"/home/backup\"")]
    #[case::zero_target("roots = [\"/home\"]\ndata_dir = \"/mnt/b\"\narchive_target_size = 0")]
    #[case::zero_items("roots = [\"/home\"]\ndata_dir = \"/mnt/b\"\narchive_max_items = 0")]
    #[case::tag_tool_without_output(
        "roots = [\"/home\"]\ndata_dir = \"/mnt/b\"\ntag_tool = { program = \"x\", args = [\"{input}\"] }"
    )]
    fn test_invalid_groups(#[case] body: &str) {
        let err = parse(&format!("[groups.bad]\n{body}")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid { .. }), "{err:?}");
    }

    #[rstest]
    #[case::unknown_container("container = \"zip\"")]
    #[case::unknown_scan_mode("scan_mode = \"paranoid\"")]
    fn test_unparseable_values(#[case] line: &str) {
        let err = parse(&format!("{MINIMAL}\n{line}")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Parse));
    }

    #[test]
    fn test_unknown_group() {
        let config = parse(MINIMAL).unwrap();
        assert!(matches!(&*config.group("work").unwrap_err(), ErrorKind::UnknownGroup(_)));
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("coffer.yaml", "groups:\n  home:\n    roots: [/home/pooh]\n    data_dir: /mnt/b\n")?;
            jail.set_env("COFFER_GROUPS__HOME__RETENTION_DAYS", "7");
            let config = Config::load(Some(Path::new("coffer.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.group("home").map_err(|e| e.to_string())?.retention_days, 7);
            Ok(())
        });
    }
}
