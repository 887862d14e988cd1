//! Error types for the upload sink and resumable uploader.

use thiserror::Error;

use crate::download::DownloadError;
use crate::retry::{FailureType, classify_http_status};

/// Errors returned by a single sink call.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Transport failure.
    #[error("network error talking to {url}: {source}")]
    Network {
        /// Target URL.
        url: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The call exceeded its timeout.
    #[error("timeout talking to {url}")]
    Timeout {
        /// Target URL.
        url: String,
    },

    /// Non-success status that is not a quota signal.
    #[error("HTTP {status} from sink{}", reason_suffix(.reason))]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Error reason reported by the sink, if any.
        reason: Option<String>,
    },

    /// Quota or rate limit exhausted.
    #[error("sink quota exhausted: {reason}")]
    QuotaExceeded {
        /// Matched signature or status description.
        reason: String,
    },

    /// The sink answered outside the resumable protocol.
    #[error("protocol violation: {message}")]
    Protocol {
        /// What was unexpected.
        message: String,
    },
}

impl SinkError {
    /// Creates a network error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

/// Maps a sink error onto the shared failure classes.
///
/// Quota errors map to [`FailureType::RateLimited`]; the uploader never
/// retries those.
#[must_use]
pub fn classify_sink_error(error: &SinkError) -> FailureType {
    match error {
        SinkError::Network { .. } | SinkError::Timeout { .. } => FailureType::Transient,
        SinkError::HttpStatus { status, .. } => classify_http_status(*status),
        SinkError::QuotaExceeded { .. } => FailureType::RateLimited,
        SinkError::Protocol { .. } => FailureType::Permanent,
    }
}

/// Errors from a whole upload.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The sink reported quota exhaustion.
    #[error("upload quota exhausted: {reason}")]
    QuotaExhausted {
        /// Sink-provided reason.
        reason: String,
    },

    /// The sink rejected the upload and retrying cannot help.
    #[error("upload rejected during {operation}: {source}")]
    Rejected {
        /// `initiate` or `chunk`.
        operation: &'static str,
        /// Final sink error.
        #[source]
        source: SinkError,
    },

    /// A transient failure persisted through every attempt.
    #[error("upload {operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        /// `initiate` or `chunk`.
        operation: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Final sink error.
        #[source]
        source: SinkError,
    },

    /// Reading the assembly buffer failed.
    #[error(transparent)]
    Buffer(#[from] DownloadError),

    /// Chunk size must be positive.
    #[error("invalid upload chunk size {0}")]
    InvalidChunkSize(usize),

    /// The upload was cancelled.
    #[error("upload cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sink_error() {
        let quota = SinkError::QuotaExceeded {
            reason: "quotaExceeded".to_string(),
        };
        assert_eq!(classify_sink_error(&quota), FailureType::RateLimited);

        let server = SinkError::HttpStatus {
            status: 503,
            reason: None,
        };
        assert_eq!(classify_sink_error(&server), FailureType::Transient);

        let bad = SinkError::HttpStatus {
            status: 400,
            reason: Some("invalidTitle".to_string()),
        };
        assert_eq!(classify_sink_error(&bad), FailureType::Permanent);
        assert!(bad.to_string().contains("invalidTitle"));

        assert_eq!(
            classify_sink_error(&SinkError::protocol("no Location")),
            FailureType::Permanent
        );
    }
}
