//! Immutable pipeline configuration.
//!
//! [`PipelineConfig`] carries every tunable the stages read: worker counts,
//! chunk sizes, retry budgets, limits, defaults, and the forced-fallback
//! script list. It is built once (the binary layers CLI flags over a config
//! file over [`Default`]), validated, and shared behind an `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::{MAX_WORKERS, MIN_WORKERS};
use crate::enrich::{
    EnrichmentRules, FallbackDefaults, ForcedFallbackRule, MetadataLimits, Script,
};
use crate::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::retry::RetryPolicy;

/// Default segment size (4 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// Default quota error signatures.
pub const DEFAULT_QUOTA_SIGNATURES: [&str; 5] = [
    "quotaExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
    "uploadLimitExceeded",
];

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric field is out of range.
    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted range.
        expected: &'static str,
    },

    /// A string field must not be empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Field name.
        field: &'static str,
    },
}

/// Backoff settings for one retrying stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
}

impl RetrySettings {
    /// Builds a doubling [`RetryPolicy`] from these settings.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay, self.max_delay, 2.0)
    }
}

/// Named tunables for every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Target segment size in bytes.
    pub segment_size: u64,
    /// Concurrent segment workers per item.
    pub download_workers: usize,
    /// Per-segment fetch budget and backoff.
    pub segment_retry: RetrySettings,
    /// Upload chunk size in bytes.
    pub upload_chunk_size: usize,
    /// Per-chunk upload budget and backoff.
    pub upload_retry: RetrySettings,
    /// Per-analyzer budget and backoff.
    pub analyzer_retry: RetrySettings,
    /// Timeout for one analyzer call.
    pub analyzer_timeout: Duration,
    /// Optional deadline for one whole item.
    pub item_timeout: Option<Duration>,
    /// Minimum spacing between progress emissions.
    pub progress_interval: Duration,
    /// Title byte limit.
    pub title_max_bytes: usize,
    /// Description byte limit.
    pub description_max_bytes: usize,
    /// Title used when nothing else is derivable.
    pub default_title: String,
    /// Category used when nothing matches.
    pub default_category: String,
    /// Description used when nothing else is available.
    pub default_description: String,
    /// Tags used when analyzers give none.
    pub default_tags: Vec<String>,
    /// Scripts forbidden in final titles.
    pub forbidden_scripts: Vec<Script>,
    /// Directory for assembly buffers.
    pub work_dir: PathBuf,
    /// Visibility of uploaded objects.
    pub privacy_status: String,
    /// Platform category id.
    pub category_id: String,
    /// Sink error reasons meaning quota exhaustion.
    pub quota_signatures: Vec<String>,
    /// Category to playlist id.
    pub playlists: HashMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let defaults = FallbackDefaults::default();
        let limits = MetadataLimits::default();
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            download_workers: crate::download::DEFAULT_WORKERS,
            segment_retry: RetrySettings {
                max_attempts: 5,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(8),
            },
            upload_chunk_size: crate::upload::DEFAULT_CHUNK_SIZE,
            upload_retry: RetrySettings {
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(32),
            },
            analyzer_retry: RetrySettings {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(16),
            },
            analyzer_timeout: Duration::from_secs(30),
            item_timeout: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            title_max_bytes: limits.title_max_bytes,
            description_max_bytes: limits.description_max_bytes,
            default_title: defaults.title,
            default_category: defaults.category,
            default_description: defaults.description,
            default_tags: defaults.tags,
            forbidden_scripts: Vec::new(),
            work_dir: PathBuf::from("./downloads"),
            privacy_status: "private".to_string(),
            category_id: "27".to_string(),
            quota_signatures: DEFAULT_QUOTA_SIGNATURES
                .iter()
                .map(ToString::to_string)
                .collect(),
            playlists: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Checks every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size == 0 {
            return Err(out_of_range("segment_size", self.segment_size, "> 0"));
        }
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.download_workers) {
            return Err(out_of_range(
                "download_workers",
                self.download_workers,
                "1..=64",
            ));
        }
        if self.upload_chunk_size == 0 {
            return Err(out_of_range("upload_chunk_size", 0, "> 0"));
        }
        for (field, retry) in [
            ("segment_retry.max_attempts", self.segment_retry),
            ("upload_retry.max_attempts", self.upload_retry),
            ("analyzer_retry.max_attempts", self.analyzer_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(out_of_range(field, 0, ">= 1"));
            }
        }
        if self.analyzer_timeout.is_zero() {
            return Err(out_of_range("analyzer_timeout", "0s", "> 0s"));
        }
        if self.item_timeout.is_some_and(|t| t.is_zero()) {
            return Err(out_of_range("item_timeout", "0s", "> 0s"));
        }
        if self.title_max_bytes == 0 {
            return Err(out_of_range("title_max_bytes", 0, "> 0"));
        }
        if self.default_title.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "default_title",
            });
        }
        if self.default_title.len() > self.title_max_bytes {
            return Err(out_of_range(
                "default_title",
                format!("{} bytes", self.default_title.len()),
                "<= title_max_bytes",
            ));
        }
        if self.default_category.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "default_category",
            });
        }
        if self.privacy_status.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "privacy_status",
            });
        }
        Ok(())
    }

    /// Enrichment limits, forced-fallback rule, and defaults.
    #[must_use]
    pub fn enrichment_rules(&self) -> EnrichmentRules {
        EnrichmentRules {
            limits: MetadataLimits {
                title_max_bytes: self.title_max_bytes,
                description_max_bytes: self.description_max_bytes,
            },
            forced_fallback: ForcedFallbackRule::new(self.forbidden_scripts.iter().copied()),
            defaults: FallbackDefaults {
                title: self.default_title.clone(),
                category: self.default_category.clone(),
                description: self.default_description.clone(),
                tags: self.default_tags.clone(),
            },
        }
    }
}

fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        expected,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_worker_bounds() {
        let mut config = PipelineConfig::default();
        config.download_workers = 0;
        assert!(config.validate().is_err());
        config.download_workers = 65;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("download_workers"));
        config.download_workers = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = PipelineConfig::default();
        config.segment_size = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.upload_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = PipelineConfig::default();
        config.upload_retry.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("upload_retry"));
    }

    #[test]
    fn test_default_title_must_fit_limit() {
        let mut config = PipelineConfig::default();
        config.title_max_bytes = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enrichment_rules_follow_config() {
        let config = PipelineConfig {
            forbidden_scripts: vec![Script::Sinhala],
            title_max_bytes: 60,
            ..PipelineConfig::default()
        };
        let rules = config.enrichment_rules();
        assert_eq!(rules.limits.title_max_bytes, 60);
        assert!(rules.forced_fallback.violated_by("පාඩම"));
        assert_eq!(rules.defaults.category, "General");
    }
}
