//! Optional `config.toml` with defaults for everything the CLI does not set.
//!
//! The format is a flat list of `key = value` lines. Strings and lists are
//! double-quoted, lists are comma separated, and `#` starts a comment outside
//! quotes.

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use mediarelay_core::{AnalyzerDialect, Script};

/// Flat `key = value` file configuration for mediarelay defaults.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// Content source API root.
    pub source_endpoint: Option<String>,
    /// Upload sink API root.
    pub sink_endpoint: Option<String>,
    /// Directory for assembly buffers.
    pub work_dir: Option<PathBuf>,
    /// Concurrent segment workers per item (1..=64).
    pub download_workers: Option<usize>,
    /// Segment size in bytes.
    pub segment_size: Option<u64>,
    /// Upload chunk size in bytes.
    pub upload_chunk_size: Option<u64>,
    /// Fetch attempts per segment.
    pub segment_attempts: Option<u32>,
    /// Attempts per upload request.
    pub upload_attempts: Option<u32>,
    /// Attempts per analyzer stage.
    pub analyzer_attempts: Option<u32>,
    /// Analyzer call timeout in seconds.
    pub analyzer_timeout_secs: Option<u64>,
    /// Per-item deadline in seconds.
    pub item_timeout_secs: Option<u64>,
    /// Progress throttle in milliseconds.
    pub progress_interval_ms: Option<u64>,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Title byte limit.
    pub title_max_bytes: Option<usize>,
    /// Description byte limit.
    pub description_max_bytes: Option<usize>,
    /// Fallback title.
    pub default_title: Option<String>,
    /// Fallback category.
    pub default_category: Option<String>,
    /// Fallback description.
    pub default_description: Option<String>,
    /// Fallback tags.
    pub default_tags: Option<Vec<String>>,
    /// Scripts forbidden in final titles.
    pub forbidden_scripts: Option<Vec<Script>>,
    /// Visibility of uploaded objects.
    pub privacy_status: Option<String>,
    /// Platform category id.
    pub category_id: Option<String>,
    /// Sink error reasons meaning quota exhaustion.
    pub quota_signatures: Option<Vec<String>>,
    /// Category to playlist id.
    pub playlists: Option<HashMap<String, String>>,
    /// Image uploaded as thumbnail after each upload.
    pub thumbnail_path: Option<PathBuf>,
    /// Primary analyzer settings.
    pub primary: AnalyzerFileConfig,
    /// Secondary analyzer settings.
    pub secondary: AnalyzerFileConfig,
}

/// Per-stage analyzer settings.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerFileConfig {
    /// API root.
    pub endpoint: Option<String>,
    /// Model name.
    pub model: Option<String>,
    /// Wire dialect.
    pub dialect: Option<AnalyzerDialect>,
}

impl FileConfig {
    /// Range checks that cannot be expressed by the value syntax alone.
    pub fn validate(&self) -> Result<()> {
        check_range("download_workers", self.download_workers, 1..=64)?;
        check_range("segment_size", self.segment_size, 1..=u64::MAX)?;
        check_range("upload_chunk_size", self.upload_chunk_size, 1..=u64::MAX)?;
        check_range("item_timeout_secs", self.item_timeout_secs, 1..=u64::MAX)?;
        for (field, attempts) in [
            ("segment_attempts", self.segment_attempts),
            ("upload_attempts", self.upload_attempts),
            ("analyzer_attempts", self.analyzer_attempts),
        ] {
            check_range(field, attempts, 1..=20)?;
        }
        for (field, secs) in [
            ("analyzer_timeout_secs", self.analyzer_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ] {
            check_range(field, secs, 1..=3600)?;
        }
        Ok(())
    }

    fn assign(&mut self, key: &str, value: Value<'_>) -> Result<()> {
        match key {
            "source_endpoint" => self.source_endpoint = Some(value.string()?),
            "sink_endpoint" => self.sink_endpoint = Some(value.string()?),
            "work_dir" => self.work_dir = Some(value.string()?.into()),
            "download_workers" => self.download_workers = Some(value.integer()?),
            "segment_size" => self.segment_size = Some(value.integer()?),
            "upload_chunk_size" => self.upload_chunk_size = Some(value.integer()?),
            "segment_attempts" => self.segment_attempts = Some(value.integer()?),
            "upload_attempts" => self.upload_attempts = Some(value.integer()?),
            "analyzer_attempts" => self.analyzer_attempts = Some(value.integer()?),
            "analyzer_timeout_secs" => self.analyzer_timeout_secs = Some(value.integer()?),
            "item_timeout_secs" => self.item_timeout_secs = Some(value.integer()?),
            "progress_interval_ms" => self.progress_interval_ms = Some(value.integer()?),
            "connect_timeout_secs" => self.connect_timeout_secs = Some(value.integer()?),
            "read_timeout_secs" => self.read_timeout_secs = Some(value.integer()?),
            "title_max_bytes" => self.title_max_bytes = Some(value.integer()?),
            "description_max_bytes" => self.description_max_bytes = Some(value.integer()?),
            "default_title" => self.default_title = Some(value.string()?),
            "default_category" => self.default_category = Some(value.string()?),
            "default_description" => self.default_description = Some(value.string()?),
            "default_tags" => self.default_tags = Some(value.list()?),
            "forbidden_scripts" => {
                let scripts = value
                    .list()?
                    .iter()
                    .map(|name| name.parse::<Script>())
                    .collect::<Result<Vec<_>, _>>()?;
                self.forbidden_scripts = Some(scripts);
            }
            "privacy_status" => self.privacy_status = Some(value.string()?),
            "category_id" => self.category_id = Some(value.string()?),
            "quota_signatures" => self.quota_signatures = Some(value.list()?),
            "playlists" => self.playlists = Some(value.map()?),
            "thumbnail_path" => self.thumbnail_path = Some(value.string()?.into()),
            _ => {
                let Some((stage, field)) = key.split_once('_') else {
                    bail!("no such setting");
                };
                let analyzer = match stage {
                    "primary" => &mut self.primary,
                    "secondary" => &mut self.secondary,
                    _ => bail!("no such setting"),
                };
                match field {
                    "endpoint" => analyzer.endpoint = Some(value.string()?),
                    "model" => analyzer.model = Some(value.string()?),
                    "dialect" => {
                        let dialect = value.string()?;
                        analyzer.dialect = Some(dialect.parse().map_err(|e: String| anyhow!(e))?);
                    }
                    _ => bail!("no such setting"),
                }
            }
        }
        Ok(())
    }
}

fn check_range<T>(field: &str, value: Option<T>, allowed: RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    match value {
        Some(value) if !allowed.contains(&value) => bail!(
            "`{field}` = {value} is outside {}..={}",
            allowed.start(),
            allowed.end()
        ),
        _ => Ok(()),
    }
}

/// Config file location and contents, if one was found.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: Option<PathBuf>,
    pub config: Option<FileConfig>,
}

/// Reads `explicit` when given, failing if it is absent. Otherwise the
/// default location is used only when the file exists there.
pub fn load_file_config_from(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let (path, required) = match explicit {
        Some(path) => (Some(path.to_path_buf()), true),
        None => (default_config_path(), false),
    };
    let config = match path.as_deref() {
        Some(found) if required || found.exists() => Some(read_config(found)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

/// `$XDG_CONFIG_HOME/mediarelay/config.toml`, falling back to `~/.config`.
fn default_config_path() -> Option<PathBuf> {
    let base = non_empty_env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| non_empty_env("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("mediarelay").join("config.toml"))
}

fn non_empty_env(name: &str) -> Option<OsString> {
    env::var_os(name).filter(|value| !value.is_empty())
}

fn read_config(path: &Path) -> Result<FileConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    parse_config(&text).with_context(|| format!("bad config file {}", path.display()))
}

fn parse_config(text: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = without_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let (key, raw_value) = line
            .split_once('=')
            .with_context(|| format!("line {line_no}: expected `key = value`"))?;
        let key = key.trim();
        cfg.assign(key, Value(raw_value.trim()))
            .with_context(|| format!("line {line_no}: bad `{key}`"))?;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn without_comment(line: &str) -> &str {
    let mut quoted = false;
    line.char_indices()
        .find(|&(_, ch)| {
            if ch == '"' {
                quoted = !quoted;
            }
            ch == '#' && !quoted
        })
        .map_or(line, |(cut, _)| &line[..cut])
}

/// Right-hand side of one config line.
#[derive(Clone, Copy)]
struct Value<'a>(&'a str);

impl Value<'_> {
    fn string(self) -> Result<String> {
        self.0
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("expected a double-quoted string, got {}", self.0))
    }

    fn integer<T: TryFrom<u64>>(self) -> Result<T> {
        if self.0.starts_with('-') {
            bail!("expected a non-negative integer, got {}", self.0);
        }
        let wide: u64 = self
            .0
            .parse()
            .with_context(|| format!("expected an integer, got {}", self.0))?;
        T::try_from(wide).map_err(|_| anyhow!("{wide} is too large"))
    }

    /// `"a, b, c"`; blank entries are dropped.
    fn list(self) -> Result<Vec<String>> {
        Ok(self
            .string()?
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// `"Physics=PL1, Chemistry=PL2"`.
    fn map(self) -> Result<HashMap<String, String>> {
        self.list()?
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
                    Ok((k.trim().to_string(), v.trim().to_string()))
                }
                _ => Err(anyhow!("expected name=value, got {entry}")),
            })
            .collect()
    }
}
