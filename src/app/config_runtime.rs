//! Layers CLI flags over the config file over library defaults.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mediarelay_core::http_client::HttpTimeouts;
use mediarelay_core::{AnalyzerDialect, PipelineConfig, Stage};

use crate::app_config::{AnalyzerFileConfig, FileConfig};
use crate::cli::Args;

pub(crate) const ENV_SOURCE_TOKEN: &str = "MEDIARELAY_SOURCE_TOKEN";
pub(crate) const ENV_SINK_TOKEN: &str = "MEDIARELAY_SINK_TOKEN";
pub(crate) const ENV_PRIMARY_API_KEY: &str = "MEDIARELAY_PRIMARY_API_KEY";
pub(crate) const ENV_SECONDARY_API_KEY: &str = "MEDIARELAY_SECONDARY_API_KEY";
pub(crate) const ENV_SOURCE_ENDPOINT: &str = "MEDIARELAY_SOURCE_ENDPOINT";
pub(crate) const ENV_SINK_ENDPOINT: &str = "MEDIARELAY_SINK_ENDPOINT";

const DEFAULT_PRIMARY_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_PRIMARY_MODEL: &str = "gemini-1.5-flash";
const DEFAULT_SECONDARY_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_SECONDARY_MODEL: &str = "gpt-4o-mini";

/// Secrets read from the environment only.
#[derive(Clone, Default)]
pub(crate) struct Credentials {
    pub(crate) source_token: Option<String>,
    pub(crate) sink_token: Option<String>,
    pub(crate) primary_api_key: Option<String>,
    pub(crate) secondary_api_key: Option<String>,
}

impl Credentials {
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            source_token: read(ENV_SOURCE_TOKEN),
            sink_token: read(ENV_SINK_TOKEN),
            primary_api_key: read(ENV_PRIMARY_API_KEY),
            secondary_api_key: read(ENV_SECONDARY_API_KEY),
        }
    }

    pub(crate) fn require_sink_token(&self) -> Result<String> {
        self.sink_token
            .clone()
            .with_context(|| format!("No upload credentials: set {ENV_SINK_TOKEN}"))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |value: &Option<String>| if value.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("source_token", &mark(&self.source_token))
            .field("sink_token", &mark(&self.sink_token))
            .field("primary_api_key", &mark(&self.primary_api_key))
            .field("secondary_api_key", &mark(&self.secondary_api_key))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoints {
    pub(crate) source: String,
    pub(crate) sink: String,
}

/// Environment wins over the config file; both endpoints are required.
pub(crate) fn resolve_endpoints(
    file_config: Option<&FileConfig>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Endpoints> {
    let pick = |env_name: &str, from_file: Option<&String>| {
        lookup(env_name)
            .filter(|value| !value.trim().is_empty())
            .or_else(|| from_file.cloned())
    };

    let Some(sink) = pick(ENV_SINK_ENDPOINT, file_config.and_then(|c| c.sink_endpoint.as_ref()))
    else {
        bail!("No upload sink configured: set `sink_endpoint` in the config file or {ENV_SINK_ENDPOINT}");
    };
    let Some(source) = pick(
        ENV_SOURCE_ENDPOINT,
        file_config.and_then(|c| c.source_endpoint.as_ref()),
    ) else {
        bail!(
            "No content source configured: set `source_endpoint` in the config file or {ENV_SOURCE_ENDPOINT}"
        );
    };
    Ok(Endpoints { source, sink })
}

/// Builds the pipeline config: CLI flag > config file > default.
pub(crate) fn resolve_pipeline_config(
    args: &Args,
    file_config: Option<&FileConfig>,
) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::default();

    if let Some(file) = file_config {
        apply_file_config(&mut config, file)?;
    }

    if let Some(workers) = args.workers {
        config.download_workers = usize::from(workers);
    }
    if let Some(kib) = args.segment_size_kib {
        config.segment_size = kib.saturating_mul(1024);
    }
    if let Some(kib) = args.chunk_size_kib {
        config.upload_chunk_size = usize::try_from(kib.saturating_mul(1024))
            .context("Invalid --chunk-size-kib: too large for this platform")?;
    }
    if let Some(attempts) = args.segment_attempts {
        config.segment_retry.max_attempts = attempts;
    }
    if let Some(attempts) = args.upload_attempts {
        config.upload_retry.max_attempts = attempts;
    }
    if let Some(secs) = args.item_timeout {
        config.item_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(work_dir) = &args.work_dir {
        config.work_dir.clone_from(work_dir);
    }
    if let Some(privacy) = &args.privacy {
        config.privacy_status.clone_from(privacy);
    }
    if !args.forbid_scripts.is_empty() {
        config.forbidden_scripts.clone_from(&args.forbid_scripts);
    }

    config
        .validate()
        .context("Invalid effective configuration")?;
    Ok(config)
}

fn apply_file_config(config: &mut PipelineConfig, file: &FileConfig) -> Result<()> {
    if let Some(work_dir) = &file.work_dir {
        config.work_dir.clone_from(work_dir);
    }
    if let Some(workers) = file.download_workers {
        config.download_workers = workers;
    }
    if let Some(size) = file.segment_size {
        config.segment_size = size;
    }
    if let Some(size) = file.upload_chunk_size {
        config.upload_chunk_size = usize::try_from(size)
            .context("Invalid `upload_chunk_size`: too large for this platform")?;
    }
    if let Some(attempts) = file.segment_attempts {
        config.segment_retry.max_attempts = attempts;
    }
    if let Some(attempts) = file.upload_attempts {
        config.upload_retry.max_attempts = attempts;
    }
    if let Some(attempts) = file.analyzer_attempts {
        config.analyzer_retry.max_attempts = attempts;
    }
    if let Some(secs) = file.analyzer_timeout_secs {
        config.analyzer_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = file.item_timeout_secs {
        config.item_timeout = Some(Duration::from_secs(secs));
    }
    if let Some(ms) = file.progress_interval_ms {
        config.progress_interval = Duration::from_millis(ms);
    }
    if let Some(bytes) = file.title_max_bytes {
        config.title_max_bytes = bytes;
    }
    if let Some(bytes) = file.description_max_bytes {
        config.description_max_bytes = bytes;
    }
    if let Some(title) = &file.default_title {
        config.default_title.clone_from(title);
    }
    if let Some(category) = &file.default_category {
        config.default_category.clone_from(category);
    }
    if let Some(description) = &file.default_description {
        config.default_description.clone_from(description);
    }
    if let Some(tags) = &file.default_tags {
        config.default_tags.clone_from(tags);
    }
    if let Some(scripts) = &file.forbidden_scripts {
        config.forbidden_scripts.clone_from(scripts);
    }
    if let Some(privacy) = &file.privacy_status {
        config.privacy_status.clone_from(privacy);
    }
    if let Some(category_id) = &file.category_id {
        config.category_id.clone_from(category_id);
    }
    if let Some(signatures) = &file.quota_signatures {
        config.quota_signatures.clone_from(signatures);
    }
    if let Some(playlists) = &file.playlists {
        config.playlists.clone_from(playlists);
    }
    Ok(())
}

pub(crate) fn resolve_http_timeouts(file_config: Option<&FileConfig>) -> HttpTimeouts {
    let mut timeouts = HttpTimeouts::default();
    let Some(file_config) = file_config else {
        return timeouts;
    };
    if let Some(secs) = file_config.connect_timeout_secs {
        timeouts.connect = Duration::from_secs(secs);
    }
    if let Some(secs) = file_config.read_timeout_secs {
        timeouts.read = Duration::from_secs(secs);
    }
    timeouts
}

/// Effective settings for one remote analyzer stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AnalyzerSettings {
    pub(crate) stage: Stage,
    pub(crate) dialect: AnalyzerDialect,
    pub(crate) endpoint: String,
    pub(crate) model: String,
    pub(crate) api_key: Option<String>,
}

/// A stage is configured when its endpoint is set or its key is present.
/// Without a key the stage still runs and abstains.
pub(crate) fn resolve_analyzer(
    stage: Stage,
    file: Option<&AnalyzerFileConfig>,
    api_key: Option<String>,
) -> Option<AnalyzerSettings> {
    let endpoint = file.and_then(|f| f.endpoint.clone());
    if endpoint.is_none() && api_key.is_none() {
        return None;
    }
    let (default_dialect, default_endpoint, default_model) = match stage {
        Stage::Secondary => (
            AnalyzerDialect::ChatCompletions,
            DEFAULT_SECONDARY_ENDPOINT,
            DEFAULT_SECONDARY_MODEL,
        ),
        Stage::Primary | Stage::LocalHeuristic => (
            AnalyzerDialect::GenerateContent,
            DEFAULT_PRIMARY_ENDPOINT,
            DEFAULT_PRIMARY_MODEL,
        ),
    };
    Some(AnalyzerSettings {
        stage,
        dialect: file.and_then(|f| f.dialect).unwrap_or(default_dialect),
        endpoint: endpoint.unwrap_or_else(|| default_endpoint.to_string()),
        model: file
            .and_then(|f| f.model.clone())
            .unwrap_or_else(|| default_model.to_string()),
        api_key,
    })
}

pub(crate) fn resolve_default_log_level(args: &Args) -> &'static str {
    if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
