//! Error types for the download module.
//!
//! This module defines structured errors for segment planning, range fetching,
//! and assembly buffer I/O.

use std::path::PathBuf;

use thiserror::Error;

use crate::source::SourceError;

/// Errors that can occur while planning or running a segmented download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The object size or segment size cannot be partitioned.
    #[error("invalid size: total {total_size} bytes with segment size {segment_size}")]
    InvalidSize {
        /// Declared total size of the object.
        total_size: u64,
        /// Requested segment size.
        segment_size: u64,
    },

    /// Invalid worker count provided.
    #[error("invalid worker count {value}: must be between {min} and {max}")]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
        /// Smallest accepted value.
        min: usize,
        /// Largest accepted value.
        max: usize,
    },

    /// A segment failed on every allowed attempt.
    #[error("segment {index} exhausted after {attempts} attempts: {source}")]
    SegmentExhausted {
        /// Index of the segment in the plan.
        index: usize,
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: SourceError,
    },

    /// File system error on the assembly buffer.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The buffer path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A write fell outside the pre-sized buffer.
    #[error("write of {len} bytes at offset {offset} exceeds buffer size {capacity}")]
    OutOfBounds {
        /// Write offset.
        offset: u64,
        /// Write length.
        len: u64,
        /// Buffer size.
        capacity: u64,
    },

    /// The download was cancelled before completion.
    #[error("download cancelled")]
    Cancelled,

    /// Workers stopped but not every segment reached `Done`.
    #[error("download incomplete: {done} of {total} segments finished")]
    Incomplete {
        /// Segments finished.
        done: usize,
        /// Segments planned.
        total: usize,
    },

    /// A worker task panicked.
    #[error("segment worker failed: {message}")]
    Worker {
        /// Panic or join error description.
        message: String,
    },
}

impl DownloadError {
    /// Creates an invalid-size error.
    #[must_use]
    pub fn invalid_size(total_size: u64, segment_size: u64) -> Self {
        Self::InvalidSize {
            total_size,
            segment_size,
        }
    }

    /// Creates a segment-exhausted error.
    #[must_use]
    pub fn segment_exhausted(index: usize, attempts: u32, source: SourceError) -> Self {
        Self::SegmentExhausted {
            index,
            attempts,
            source,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a worker failure error.
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_exhausted_display_names_index() {
        let error = DownloadError::segment_exhausted(7, 5, SourceError::interrupted("reset"));
        let msg = error.to_string();
        assert!(msg.contains("segment 7"));
        assert!(msg.contains("5 attempts"));
        assert!(msg.contains("reset"));
    }

    #[test]
    fn test_invalid_size_display() {
        let msg = DownloadError::invalid_size(0, 1024).to_string();
        assert!(msg.contains("total 0"));
        assert!(msg.contains("1024"));
    }
}
