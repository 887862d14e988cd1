//! Error types for content source operations.

use thiserror::Error;

use crate::retry::{FailureType, classify_http_status};

/// Errors that can occur while resolving items or reading ranges.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The locator does not name an existing item.
    #[error("item not found: {locator}")]
    NotFound {
        /// The locator that was looked up.
        locator: String,
    },

    /// The source refused access to the item.
    #[error("access denied for {locator}")]
    AccessDenied {
        /// The locator that was refused.
        locator: String,
    },

    /// Network-level error (DNS resolution, connection refused, reset, etc.)
    #[error("network error reading {url}: {source}")]
    Network {
        /// The URL being read.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout reading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Unexpected HTTP status.
    #[error("HTTP {status} reading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The source replied with something that doesn't fit the protocol.
    #[error("malformed response from {url}: {message}")]
    Malformed {
        /// The URL that replied.
        url: String,
        /// What was wrong with the reply.
        message: String,
    },

    /// A range stream ended before delivering the requested bytes.
    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Start of the range.
        offset: u64,
        /// Requested length.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// A range stream failed mid-body without a transport error to wrap.
    #[error("stream interrupted: {message}")]
    Interrupted {
        /// Description of the interruption.
        message: String,
    },
}

impl SourceError {
    /// Creates a not-found error.
    pub fn not_found(locator: impl Into<String>) -> Self {
        Self::NotFound {
            locator: locator.into(),
        }
    }

    /// Creates an access-denied error.
    pub fn access_denied(locator: impl Into<String>) -> Self {
        Self::AccessDenied {
            locator: locator.into(),
        }
    }

    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a malformed-response error.
    pub fn malformed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a short-read error.
    #[must_use]
    pub fn short_read(offset: u64, expected: u64, actual: u64) -> Self {
        Self::ShortRead {
            offset,
            expected,
            actual,
        }
    }

    /// Creates an interrupted-stream error.
    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted {
            message: message.into(),
        }
    }
}

/// Classifies a source error for retry decisions.
///
/// Everything that can go wrong mid-stream is transient: the segment is
/// simply fetched again.
#[must_use]
pub fn classify_source_error(error: &SourceError) -> FailureType {
    match error {
        SourceError::NotFound { .. } | SourceError::Malformed { .. } => FailureType::Permanent,
        SourceError::AccessDenied { .. } => FailureType::NeedsAuth,
        SourceError::HttpStatus { status, .. } => classify_http_status(*status),
        SourceError::Network { .. }
        | SourceError::Timeout { .. }
        | SourceError::ShortRead { .. }
        | SourceError::Interrupted { .. } => FailureType::Transient,
    }
}
