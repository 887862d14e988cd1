//! Deterministic local metadata pass.
//!
//! Translates known Sinhala and Tamil subject terms through a fixed
//! dictionary, strips any remaining forbidden-script characters, and builds a
//! title from the first usable line. This pass cannot fail; with no usable
//! text it returns the configured defaults.

use tracing::debug;

use super::validate::{collapse_whitespace, truncate_to_bytes};
use super::{EnrichInput, EnrichedMetadata, EnrichmentRules};

/// One fixed substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryEntry {
    /// Phrase as it appears in source text.
    pub phrase: &'static str,
    /// English replacement.
    pub english: &'static str,
    /// Subject category implied by the phrase, if any.
    pub category: Option<&'static str>,
}

const fn entry(
    phrase: &'static str,
    english: &'static str,
    category: Option<&'static str>,
) -> DictionaryEntry {
    DictionaryEntry {
        phrase,
        english,
        category,
    }
}

/// Sinhala and Tamil lesson/subject vocabulary.
pub const DICTIONARY: &[DictionaryEntry] = &[
    // Sinhala
    entry("සංයුක්ත ගණිතය", "Combined Mathematics", Some("Mathematics")),
    entry("ගණිතය", "Mathematics", Some("Mathematics")),
    entry("භෞතික විද්‍යාව", "Physics", Some("Physics")),
    entry("රසායන විද්‍යාව", "Chemistry", Some("Chemistry")),
    entry("ජීව විද්‍යාව", "Biology", Some("Biology")),
    entry("විද්‍යාව", "Science", Some("Science")),
    entry("ඉංග්‍රීසි", "English", Some("English")),
    entry("තාක්ෂණවේදය", "Technology", Some("Technology")),
    entry("ප්‍රශ්න පත්‍රය", "Question Paper", None),
    entry("පුනරීක්ෂණ", "Revision", None),
    entry("පාඩම", "Lesson", None),
    entry("පන්තිය", "Class", None),
    entry("කොටස", "Part", None),
    entry("ඒකකය", "Unit", None),
    // Tamil
    entry("இயற்பியல்", "Physics", Some("Physics")),
    entry("வேதியியல்", "Chemistry", Some("Chemistry")),
    entry("கணிதம்", "Mathematics", Some("Mathematics")),
    entry("உயிரியல்", "Biology", Some("Biology")),
    entry("பாடம்", "Lesson", None),
    entry("வகுப்பு", "Class", None),
    entry("அலகு", "Unit", None),
    entry("மீட்டல்", "Revision", None),
];

/// English subject keywords, matched as whole lowercase words.
const KEYWORD_CATEGORIES: &[(&str, &str)] = &[
    ("physics", "Physics"),
    ("mechanics", "Physics"),
    ("chemistry", "Chemistry"),
    ("organic", "Chemistry"),
    ("mathematics", "Mathematics"),
    ("maths", "Mathematics"),
    ("math", "Mathematics"),
    ("calculus", "Mathematics"),
    ("algebra", "Mathematics"),
    ("biology", "Biology"),
    ("science", "Science"),
    ("english", "English"),
    ("technology", "Technology"),
    ("ict", "Technology"),
];

/// Dictionary-driven fallback that always yields complete metadata.
#[derive(Debug, Clone)]
pub struct LocalHeuristic {
    rules: EnrichmentRules,
    // Longest phrase first so compound terms win over their parts.
    entries: Vec<&'static DictionaryEntry>,
}

impl LocalHeuristic {
    /// Creates the pass over the built-in dictionary.
    #[must_use]
    pub fn new(rules: EnrichmentRules) -> Self {
        let mut entries: Vec<&'static DictionaryEntry> = DICTIONARY.iter().collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.phrase.chars().count()));
        Self { rules, entries }
    }

    /// Rules this pass enforces.
    #[must_use]
    pub fn rules(&self) -> &EnrichmentRules {
        &self.rules
    }

    /// Replaces dictionary phrases with English, returning the first category hit.
    #[must_use]
    pub fn translate(&self, text: &str) -> (String, Option<&'static str>) {
        let mut translated = text.to_string();
        let mut category = None;
        for entry in &self.entries {
            if translated.contains(entry.phrase) {
                translated = translated.replace(entry.phrase, &format!(" {} ", entry.english));
                if category.is_none() {
                    category = entry.category;
                }
            }
        }
        (translated, category)
    }

    /// Builds metadata from the original text alone.
    #[must_use]
    pub fn enrich(&self, input: &EnrichInput<'_>) -> EnrichedMetadata {
        let raw = input.raw_text.map(str::trim).unwrap_or_default();
        let (translated, dictionary_category) = self.translate(raw);

        let title = self.title_from(&translated);
        let category = dictionary_category
            .or_else(|| keyword_category(&translated))
            .map_or_else(|| self.rules.defaults.category.clone(), str::to_string);

        let description = if !raw.is_empty() {
            truncate_to_bytes(raw, self.rules.limits.description_max_bytes)
        } else if !self.rules.defaults.description.is_empty() {
            self.rules.defaults.description.clone()
        } else {
            format!("Transferred from {}", input.locator)
        };

        debug!(title = %title, category = %category, "local heuristic metadata");

        EnrichedMetadata {
            title,
            description,
            category,
            tags: self.rules.defaults.tags.clone(),
        }
    }

    fn title_from(&self, translated: &str) -> String {
        let first_line = translated
            .lines()
            .map(|line| {
                let cleaned = collapse_whitespace(&self.rules.forced_fallback.strip(line));
                cleaned
                    .trim_matches(|c: char| {
                        c.is_whitespace() || matches!(c, '-' | '|' | ':' | '*' | '#' | '•')
                    })
                    .to_string()
            })
            .find(|line| !line.is_empty());

        first_line
            .map(|line| truncate_to_bytes(&line, self.rules.limits.title_max_bytes))
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| self.rules.defaults.title.clone())
    }
}

fn keyword_category(text: &str) -> Option<&'static str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .find_map(|word| {
            let word = word.to_lowercase();
            KEYWORD_CATEGORIES
                .iter()
                .find(|(keyword, _)| *keyword == word)
                .map(|(_, category)| *category)
        })
}
