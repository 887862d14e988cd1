//! Structural and content validation for enriched metadata.
//!
//! Structural checks decide whether an analyzer reply is usable at all.
//! The [`ForcedFallbackRule`] is the content check layered on top: a title
//! that contains a character from a forbidden script is rejected even when
//! it is structurally fine.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::{EnrichmentRules, EnrichedMetadata};

/// Unicode script blocks the forced-fallback rule can forbid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// U+0D80..U+0DFF
    Sinhala,
    /// U+0B80..U+0BFF
    Tamil,
    /// U+0900..U+097F
    Devanagari,
    /// U+0400..U+04FF
    Cyrillic,
    /// U+0600..U+06FF
    Arabic,
    /// U+0590..U+05FF
    Hebrew,
    /// U+0E00..U+0E7F
    Thai,
    /// U+0370..U+03FF
    Greek,
    /// CJK unified ideographs, U+4E00..U+9FFF
    Han,
    /// Hangul syllables, U+AC00..U+D7AF
    Hangul,
}

impl Script {
    /// Every supported script.
    pub const ALL: [Self; 10] = [
        Self::Sinhala,
        Self::Tamil,
        Self::Devanagari,
        Self::Cyrillic,
        Self::Arabic,
        Self::Hebrew,
        Self::Thai,
        Self::Greek,
        Self::Han,
        Self::Hangul,
    ];

    fn range(self) -> (u32, u32) {
        match self {
            Self::Sinhala => (0x0D80, 0x0DFF),
            Self::Tamil => (0x0B80, 0x0BFF),
            Self::Devanagari => (0x0900, 0x097F),
            Self::Cyrillic => (0x0400, 0x04FF),
            Self::Arabic => (0x0600, 0x06FF),
            Self::Hebrew => (0x0590, 0x05FF),
            Self::Thai => (0x0E00, 0x0E7F),
            Self::Greek => (0x0370, 0x03FF),
            Self::Han => (0x4E00, 0x9FFF),
            Self::Hangul => (0xAC00, 0xD7AF),
        }
    }

    /// Returns true if `c` falls inside this script's block.
    #[must_use]
    pub fn contains(self, c: char) -> bool {
        let (lo, hi) = self.range();
        (lo..=hi).contains(&u32::from(c))
    }

    /// Lowercase config name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sinhala => "sinhala",
            Self::Tamil => "tamil",
            Self::Devanagari => "devanagari",
            Self::Cyrillic => "cyrillic",
            Self::Arabic => "arabic",
            Self::Hebrew => "hebrew",
            Self::Thai => "thai",
            Self::Greek => "greek",
            Self::Han => "han",
            Self::Hangul => "hangul",
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised script name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown script '{0}' (expected one of: sinhala, tamil, devanagari, cyrillic, arabic, hebrew, thai, greek, han, hangul)")]
pub struct UnknownScript(pub String);

impl FromStr for Script {
    type Err = UnknownScript;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|script| script.as_str() == wanted)
            .ok_or_else(|| UnknownScript(s.trim().to_string()))
    }
}

/// Titles must not contain characters from any of these scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForcedFallbackRule {
    scripts: Vec<Script>,
}

impl ForcedFallbackRule {
    /// Creates a rule forbidding `scripts`. An empty list never triggers.
    #[must_use]
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        let mut unique = Vec::new();
        for script in scripts {
            if !unique.contains(&script) {
                unique.push(script);
            }
        }
        Self { scripts: unique }
    }

    /// Scripts forbidden by this rule.
    #[must_use]
    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    /// Returns true if `c` belongs to a forbidden script.
    #[must_use]
    pub fn is_forbidden(&self, c: char) -> bool {
        self.scripts.iter().any(|script| script.contains(c))
    }

    /// Returns true if `text` contains any forbidden character.
    #[must_use]
    pub fn violated_by(&self, text: &str) -> bool {
        !self.scripts.is_empty() && text.chars().any(|c| self.is_forbidden(c))
    }

    /// Removes forbidden characters and zero-width joiners left behind by them.
    #[must_use]
    pub fn strip(&self, text: &str) -> String {
        text.chars()
            .filter(|&c| !self.is_forbidden(c) && !is_zero_width(c))
            .collect()
    }
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}')
}

/// Byte limits imposed by the upload platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataLimits {
    /// Maximum title length in bytes.
    pub title_max_bytes: usize,
    /// Maximum description length in bytes.
    pub description_max_bytes: usize,
}

impl Default for MetadataLimits {
    fn default() -> Self {
        Self {
            title_max_bytes: 100,
            description_max_bytes: 5000,
        }
    }
}

/// Shape of the JSON object analyzers are asked to return.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzerReply {
    /// Proposed title.
    #[serde(default)]
    pub title: Option<String>,
    /// Proposed description.
    #[serde(default)]
    pub description: Option<String>,
    /// Proposed subject category.
    #[serde(default)]
    pub category: Option<String>,
    /// Proposed tags.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Checks required fields and limits, then fills optional fields from `rules`.
///
/// The title is never truncated here: an over-long title is a structural
/// failure. The description is truncated to its limit.
///
/// # Errors
///
/// Returns a human-readable reason when the reply is structurally invalid.
pub fn validate_reply(
    reply: AnalyzerReply,
    rules: &EnrichmentRules,
) -> Result<EnrichedMetadata, String> {
    let title = reply
        .title
        .map(|t| collapse_whitespace(&t))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "missing or empty title".to_string())?;

    if title.len() > rules.limits.title_max_bytes {
        return Err(format!(
            "title is {} bytes, limit is {}",
            title.len(),
            rules.limits.title_max_bytes
        ));
    }

    let category = reply
        .category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "missing or empty category".to_string())?;

    let description = reply
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| rules.defaults.description.clone());

    let tags: Vec<String> = reply
        .tags
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    Ok(EnrichedMetadata {
        title,
        description: truncate_to_bytes(&description, rules.limits.description_max_bytes),
        category,
        tags: if tags.is_empty() {
            rules.defaults.tags.clone()
        } else {
            tags
        },
    })
}

/// Truncates `text` to at most `max_bytes` bytes on a char boundary.
#[must_use]
pub fn truncate_to_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].trim_end().to_string()
}

/// Joins whitespace runs into single spaces and trims the ends.
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
