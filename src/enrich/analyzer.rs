//! Remote analyzers for the enrichment chain.
//!
//! An [`Analyzer`] turns a prompt into reply text. [`HttpAnalyzer`] speaks two
//! JSON dialects:
//! - [`AnalyzerDialect::GenerateContent`]: `POST {endpoint}/models/{model}:generateContent`,
//!   key in `x-goog-api-key`, reply text in `candidates[0].content.parts[*].text`
//! - [`AnalyzerDialect::ChatCompletions`]: `POST {endpoint}/chat/completions`,
//!   bearer key, reply text in `choices[0].message.content`
//!
//! [`AnalyzerStage`] wraps an analyzer with the prompt, retry loop, and reply
//! parsing, and reports a [`StageOutcome`] to the chain.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::validate::{AnalyzerReply, validate_reply};
use super::{EnrichInput, EnrichmentRules, Stage, StageOutcome};
use crate::http_client::{HttpTimeouts, build_http_client};
use crate::retry::{FailureType, RetryDecision, RetryPolicy, classify_http_status, parse_retry_after};

/// Prompt text used when the source item carries no text.
const PLACEHOLDER_TEXT: &str =
    "No description provided. Analyze the context of a generic tuition class.";

#[allow(clippy::expect_used)]
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").expect("valid code fence regex")
});

/// Errors from a single analyzer call.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// No API key configured; the stage abstains without calling out.
    #[error("{analyzer}: no credentials configured")]
    MissingCredentials {
        /// Analyzer name.
        analyzer: String,
    },

    /// Transport failure.
    #[error("{analyzer}: network error: {source}")]
    Network {
        /// Analyzer name.
        analyzer: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The call exceeded its timeout.
    #[error("{analyzer}: request timed out")]
    Timeout {
        /// Analyzer name.
        analyzer: String,
    },

    /// Non-success status.
    #[error("{analyzer}: HTTP {status}")]
    HttpStatus {
        /// Analyzer name.
        analyzer: String,
        /// Status code.
        status: u16,
        /// Parsed `Retry-After`, if sent.
        retry_after: Option<Duration>,
    },

    /// The response envelope did not contain reply text.
    #[error("{analyzer}: malformed response: {message}")]
    Malformed {
        /// Analyzer name.
        analyzer: String,
        /// What was missing.
        message: String,
    },
}

impl AnalyzerError {
    fn network(analyzer: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                analyzer: analyzer.to_string(),
            }
        } else {
            Self::Network {
                analyzer: analyzer.to_string(),
                source,
            }
        }
    }

    fn malformed(analyzer: &str, message: impl Into<String>) -> Self {
        Self::Malformed {
            analyzer: analyzer.to_string(),
            message: message.into(),
        }
    }

    /// Server-requested delay, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Maps an analyzer error onto the shared failure classes.
#[must_use]
pub fn classify_analyzer_error(error: &AnalyzerError) -> FailureType {
    match error {
        AnalyzerError::MissingCredentials { .. } => FailureType::NeedsAuth,
        AnalyzerError::Network { .. } | AnalyzerError::Timeout { .. } => FailureType::Transient,
        AnalyzerError::HttpStatus { status, .. } => classify_http_status(*status),
        AnalyzerError::Malformed { .. } => FailureType::Permanent,
    }
}

/// A remote text analyzer.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Sends `prompt` and returns the reply text.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError`] on transport, status, or envelope failures.
    async fn analyze(&self, prompt: &str) -> Result<String, AnalyzerError>;
}

/// Wire format spoken by an [`HttpAnalyzer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerDialect {
    /// `models/{model}:generateContent` with candidates/parts replies.
    GenerateContent,
    /// `chat/completions` with choices/message replies.
    ChatCompletions,
}

impl FromStr for AnalyzerDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generate_content" => Ok(Self::GenerateContent),
            "chat_completions" => Ok(Self::ChatCompletions),
            other => Err(format!(
                "unknown analyzer dialect '{other}' (expected generate_content or chat_completions)"
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP+JSON analyzer client.
pub struct HttpAnalyzer {
    name: String,
    dialect: AnalyzerDialect,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpAnalyzer {
    /// Creates a client for `endpoint`. A `None` key makes every call fail
    /// with [`AnalyzerError::MissingCredentials`].
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::Malformed`] if the HTTP client cannot be built.
    pub fn new(
        name: impl Into<String>,
        dialect: AnalyzerDialect,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AnalyzerError> {
        let name = name.into();
        let client = build_http_client(&name, HttpTimeouts::uniform(timeout))
            .map_err(|e| AnalyzerError::malformed(&name, e.to_string()))?;
        Ok(Self {
            name,
            dialect,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    fn request(&self, key: &str, prompt: &str) -> reqwest::RequestBuilder {
        match self.dialect {
            AnalyzerDialect::GenerateContent => self
                .client
                .post(format!("{}/models/{}:generateContent", self.endpoint, self.model))
                .header("x-goog-api-key", key)
                .json(&json!({
                    "contents": [{ "parts": [{ "text": prompt }] }]
                })),
            AnalyzerDialect::ChatCompletions => self
                .client
                .post(format!("{}/chat/completions", self.endpoint))
                .bearer_auth(key)
                .json(&json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }]
                })),
        }
    }

    fn extract_text(&self, body: &[u8]) -> Result<String, AnalyzerError> {
        let text = match self.dialect {
            AnalyzerDialect::GenerateContent => {
                let parsed: GenerateContentResponse = serde_json::from_slice(body)
                    .map_err(|e| AnalyzerError::malformed(&self.name, e.to_string()))?;
                parsed
                    .candidates
                    .into_iter()
                    .next()
                    .and_then(|c| c.content)
                    .map(|content| {
                        content
                            .parts
                            .into_iter()
                            .filter_map(|p| p.text)
                            .collect::<String>()
                    })
            }
            AnalyzerDialect::ChatCompletions => {
                let parsed: ChatCompletionsResponse = serde_json::from_slice(body)
                    .map_err(|e| AnalyzerError::malformed(&self.name, e.to_string()))?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message)
                    .and_then(|m| m.content)
            }
        };
        text.filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AnalyzerError::malformed(&self.name, "no reply text"))
    }
}

impl fmt::Debug for HttpAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAnalyzer")
            .field("name", &self.name)
            .field("dialect", &self.dialect)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("has_key", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, prompt), fields(analyzer = %self.name))]
    async fn analyze(&self, prompt: &str) -> Result<String, AnalyzerError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(AnalyzerError::MissingCredentials {
                analyzer: self.name.clone(),
            });
        };

        let response = self
            .request(key, prompt)
            .send()
            .await
            .map_err(|e| AnalyzerError::network(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            debug!(status = status.as_u16(), ?retry_after, "analyzer returned error status");
            return Err(AnalyzerError::HttpStatus {
                analyzer: self.name.clone(),
                status: status.as_u16(),
                retry_after,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AnalyzerError::network(&self.name, e))?;
        self.extract_text(&body)
    }
}

/// Builds the analyzer prompt for `raw_text`.
#[must_use]
pub fn build_prompt(raw_text: Option<&str>) -> String {
    let text = raw_text
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(PLACEHOLDER_TEXT);
    format!(
        "You are an assistant organizing recorded lesson videos.\n\
         Analyze this raw text that accompanied the video: \"{text}\"\n\n\
         Produce:\n\
         1. A clear, professional video title in English.\n\
         2. A short description.\n\
         3. A general subject category (e.g. Mechanics, Calculus, Organic Chemistry).\n\
         4. Up to five short tags.\n\n\
         Return ONLY a JSON object with keys: \"title\", \"description\", \"category\", \"tags\"."
    )
}

/// Removes a surrounding Markdown code fence, if present.
#[must_use]
pub fn strip_code_fences(reply: &str) -> &str {
    CODE_FENCE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map_or_else(|| reply.trim(), |m| m.as_str())
}

/// Parses reply text into an analyzer reply object.
///
/// # Errors
///
/// Returns the JSON error message when the text is not a matching object.
pub fn parse_reply(reply: &str) -> Result<AnalyzerReply, String> {
    serde_json::from_str(strip_code_fences(reply)).map_err(|e| format!("unparseable reply: {e}"))
}

/// One remote position in the chain.
#[derive(Clone)]
pub struct AnalyzerStage {
    stage: Stage,
    analyzer: Arc<dyn Analyzer>,
    retry: RetryPolicy,
}

impl AnalyzerStage {
    /// Wraps `analyzer` for `stage` with its retry budget.
    #[must_use]
    pub fn new(stage: Stage, analyzer: Arc<dyn Analyzer>, retry: RetryPolicy) -> Self {
        Self {
            stage,
            analyzer,
            retry,
        }
    }

    /// Position of this stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Calls the analyzer, retrying transient failures, and validates the reply.
    ///
    /// Transport failures that survive the retry budget become
    /// [`StageOutcome::Abstain`]; unusable replies become [`StageOutcome::Invalid`].
    #[instrument(skip_all, fields(stage = %self.stage, analyzer = %self.analyzer.name()))]
    pub async fn attempt(&self, input: &EnrichInput<'_>, rules: &EnrichmentRules) -> StageOutcome {
        let prompt = build_prompt(input.raw_text);
        let mut attempt = 1;

        let reply = loop {
            let error = match self.analyzer.analyze(&prompt).await {
                Ok(reply) => break reply,
                Err(error) => error,
            };

            let kind = classify_analyzer_error(&error);
            match self.retry.should_retry(kind, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let delay = match error.retry_after() {
                        Some(wait) if wait > self.retry.max_delay() => {
                            warn!(
                                retry_after_secs = wait.as_secs(),
                                "analyzer asked to wait longer than the retry cap"
                            );
                            return StageOutcome::Abstain {
                                reason: format!("{error} (Retry-After {}s)", wait.as_secs()),
                            };
                        }
                        Some(wait) => wait,
                        None => delay,
                    };
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "analyzer call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(error = %error, %reason, "analyzer stage abstains");
                    return StageOutcome::Abstain {
                        reason: error.to_string(),
                    };
                }
            }
        };

        match parse_reply(&reply).and_then(|parsed| validate_reply(parsed, rules)) {
            Ok(metadata) => StageOutcome::Accepted(metadata),
            Err(reason) => {
                debug!(%reason, "analyzer reply rejected");
                StageOutcome::Invalid { reason }
            }
        }
    }
}

impl fmt::Debug for AnalyzerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzerStage")
            .field("stage", &self.stage)
            .field("analyzer", &self.analyzer.name())
            .field("retry", &self.retry)
            .finish()
    }
}
