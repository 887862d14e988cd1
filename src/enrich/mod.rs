//! Metadata enrichment chain.
//!
//! The chain runs a fixed sequence of stages over an item's accompanying
//! text: the primary analyzer, the secondary analyzer, then the
//! [`LocalHeuristic`]. The first structurally valid reply wins, subject to
//! the [`ForcedFallbackRule`]: a valid reply whose title contains a forbidden
//! character is discarded, and the local pass over the original text is used
//! instead. The local pass never fails, so [`EnrichmentChain::enrich`] always
//! returns complete metadata.
//!
//! # Example
//!
//! ```
//! use mediarelay_core::enrich::{EnrichInput, EnrichmentChain, EnrichmentRules, Stage};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let chain = EnrichmentChain::local_only(EnrichmentRules::default());
//! let result = chain
//!     .enrich(&EnrichInput { locator: "c/1/2", raw_text: Some("Calculus revision") })
//!     .await;
//! assert_eq!(result.stage, Stage::LocalHeuristic);
//! assert_eq!(result.metadata.category, "Mathematics");
//! # }
//! ```

mod analyzer;
mod local;
mod validate;

pub use analyzer::{
    Analyzer, AnalyzerDialect, AnalyzerError, AnalyzerStage, HttpAnalyzer, build_prompt,
    classify_analyzer_error, parse_reply, strip_code_fences,
};
pub use local::{DICTIONARY, DictionaryEntry, LocalHeuristic};
pub use validate::{
    AnalyzerReply, ForcedFallbackRule, MetadataLimits, Script, UnknownScript, truncate_to_bytes,
    validate_reply,
};

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Metadata attached to an upload. Always fully populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedMetadata {
    /// Title within the platform byte limit.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Subject category.
    pub category: String,
    /// Ordered tags.
    pub tags: Vec<String>,
}

/// Text handed to each stage.
#[derive(Debug, Clone, Copy)]
pub struct EnrichInput<'a> {
    /// Locator the item was resolved from.
    pub locator: &'a str,
    /// Text that accompanied the media, if any.
    pub raw_text: Option<&'a str>,
}

/// Fixed positions in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// First remote analyzer.
    Primary,
    /// Second remote analyzer.
    Secondary,
    /// Dictionary-driven local pass.
    LocalHeuristic,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::LocalHeuristic => write!(f, "local"),
        }
    }
}

/// What one stage produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// A structurally valid result.
    Accepted(EnrichedMetadata),
    /// The stage could not run (no credentials, unreachable, budget spent).
    Abstain {
        /// Why the stage abstained.
        reason: String,
    },
    /// The stage answered with something unusable.
    Invalid {
        /// What was wrong with the reply.
        reason: String,
    },
}

/// Defaults used when a field cannot be derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackDefaults {
    /// Title when no usable text remains.
    pub title: String,
    /// Category when nothing matches.
    pub category: String,
    /// Description when the analyzer or source gives none.
    pub description: String,
    /// Tags when the analyzer gives none.
    pub tags: Vec<String>,
}

impl Default for FallbackDefaults {
    fn default() -> Self {
        Self {
            title: "Untitled Upload".to_string(),
            category: "General".to_string(),
            description: String::new(),
            tags: vec!["educational".to_string(), "archived".to_string()],
        }
    }
}

/// Limits, forced-fallback predicate, and defaults shared by every stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentRules {
    /// Platform byte limits.
    pub limits: MetadataLimits,
    /// Scripts forbidden in the final title.
    pub forced_fallback: ForcedFallbackRule,
    /// Deterministic defaults.
    pub defaults: FallbackDefaults,
}

/// Final chain result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    /// Metadata to upload with.
    pub metadata: EnrichedMetadata,
    /// Stage whose output was used.
    pub stage: Stage,
    /// True when a remote result was overridden by the forced-fallback rule.
    pub forced_fallback: bool,
}

/// Ordered analyzer stages with a local fallback.
#[derive(Debug, Clone)]
pub struct EnrichmentChain {
    remote: Vec<AnalyzerStage>,
    local: LocalHeuristic,
}

impl EnrichmentChain {
    /// Creates a chain with only the local pass.
    #[must_use]
    pub fn local_only(rules: EnrichmentRules) -> Self {
        Self {
            remote: Vec::new(),
            local: LocalHeuristic::new(rules),
        }
    }

    /// Creates a chain from optional primary and secondary stages.
    #[must_use]
    pub fn new(
        rules: EnrichmentRules,
        primary: Option<AnalyzerStage>,
        secondary: Option<AnalyzerStage>,
    ) -> Self {
        let mut remote: Vec<AnalyzerStage> = primary.into_iter().chain(secondary).collect();
        remote.sort_by_key(|s| match s.stage() {
            Stage::Primary => 0,
            Stage::Secondary => 1,
            Stage::LocalHeuristic => 2,
        });
        Self {
            remote,
            local: LocalHeuristic::new(rules),
        }
    }

    /// Rules applied by this chain.
    #[must_use]
    pub fn rules(&self) -> &EnrichmentRules {
        self.local.rules()
    }

    /// Runs the chain. Never fails.
    #[instrument(skip_all, fields(locator = %input.locator, remote_stages = self.remote.len()))]
    pub async fn enrich(&self, input: &EnrichInput<'_>) -> Enrichment {
        for stage in &self.remote {
            match stage.attempt(input, self.rules()).await {
                StageOutcome::Accepted(metadata) => {
                    if self.rules().forced_fallback.violated_by(&metadata.title) {
                        warn!(
                            stage = %stage.stage(),
                            title = %metadata.title,
                            "title contains a forbidden script; using local pass"
                        );
                        return Enrichment {
                            metadata: self.local.enrich(input),
                            stage: Stage::LocalHeuristic,
                            forced_fallback: true,
                        };
                    }
                    info!(stage = %stage.stage(), title = %metadata.title, "metadata enriched");
                    return Enrichment {
                        metadata,
                        stage: stage.stage(),
                        forced_fallback: false,
                    };
                }
                StageOutcome::Abstain { reason } => {
                    debug!(stage = %stage.stage(), %reason, "stage abstained");
                }
                StageOutcome::Invalid { reason } => {
                    warn!(stage = %stage.stage(), %reason, "stage returned invalid metadata");
                }
            }
        }

        let metadata = self.local.enrich(input);
        info!(stage = %Stage::LocalHeuristic, title = %metadata.title, "metadata enriched");
        Enrichment {
            metadata,
            stage: Stage::LocalHeuristic,
            forced_fallback: false,
        }
    }
}
