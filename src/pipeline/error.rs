//! Item-level error taxonomy.
//!
//! Stage errors are wrapped in [`TransferError`]; [`TransferError::kind`]
//! collapses them into the serialisable [`ErrorKind`] recorded on each
//! failed [`TransferResult`](super::TransferResult).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::download::DownloadError;
use crate::source::SourceError;
use crate::upload::UploadError;

/// Classification of an item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// The object cannot be partitioned (declared size zero).
    InvalidSize,
    /// A segment ran out of fetch attempts.
    SegmentExhausted {
        /// Segment index.
        index: usize,
    },
    /// The source could not resolve or serve the item.
    SourceUnavailable,
    /// No analyzer could run. Absorbed by the local pass, so never recorded
    /// on a result; kept for completeness of the taxonomy.
    AnalyzerUnavailable,
    /// Upload kept failing transiently until its budget ran out.
    UploadTransient,
    /// The sink rejected the upload.
    UploadPermanent,
    /// The sink reported quota exhaustion.
    QuotaExhausted,
    /// The item was cancelled or timed out.
    Cancelled,
    /// Local storage or execution failure.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize => write!(f, "invalid_size"),
            Self::SegmentExhausted { index } => write!(f, "segment_exhausted({index})"),
            Self::SourceUnavailable => write!(f, "source_unavailable"),
            Self::AnalyzerUnavailable => write!(f, "analyzer_unavailable"),
            Self::UploadTransient => write!(f, "upload_transient"),
            Self::UploadPermanent => write!(f, "upload_permanent"),
            Self::QuotaExhausted => write!(f, "quota_exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Io => write!(f, "io"),
        }
    }
}

/// Failure of one item, wrapping the stage error that caused it.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Resolution or range reading failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Segment planning or download failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Upload failed.
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// Work directory could not be prepared.
    #[error("cannot prepare work directory {path}: {source}")]
    WorkDir {
        /// Directory path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The batch was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The item exceeded its deadline.
    #[error("item timed out after {}s", after.as_secs())]
    TimedOut {
        /// Configured deadline.
        after: Duration,
    },
}

impl TransferError {
    /// Taxonomy bucket for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Source(_) => ErrorKind::SourceUnavailable,
            Self::Download(error) => match error {
                DownloadError::InvalidSize { .. } => ErrorKind::InvalidSize,
                DownloadError::SegmentExhausted { index, .. } => {
                    ErrorKind::SegmentExhausted { index: *index }
                }
                DownloadError::Cancelled => ErrorKind::Cancelled,
                DownloadError::Incomplete { .. } => ErrorKind::SourceUnavailable,
                DownloadError::Io { .. }
                | DownloadError::OutOfBounds { .. }
                | DownloadError::InvalidConcurrency { .. }
                | DownloadError::Worker { .. } => ErrorKind::Io,
            },
            Self::Upload(error) => match error {
                UploadError::QuotaExhausted { .. } => ErrorKind::QuotaExhausted,
                UploadError::Exhausted { .. } => ErrorKind::UploadTransient,
                UploadError::Rejected { .. } | UploadError::InvalidChunkSize(_) => {
                    ErrorKind::UploadPermanent
                }
                UploadError::Buffer(_) => ErrorKind::Io,
                UploadError::Cancelled => ErrorKind::Cancelled,
            },
            Self::WorkDir { .. } => ErrorKind::Io,
            Self::Cancelled | Self::TimedOut { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns true when this error means the item was cancelled.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
