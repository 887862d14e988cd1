//! Mediarelay Core Library
//!
//! Moves large media objects from a range-addressable content source to a
//! resumable-upload sink, deriving upload metadata on the way.
//!
//! # Architecture
//!
//! - [`source`] - Content source contract and the HTTP source
//! - [`download`] - Segment planning, assembly buffer, parallel range downloader
//! - [`enrich`] - Analyzer chain with validation and a local fallback
//! - [`upload`] - Resumable uploader, HTTP sink, post steps
//! - [`pipeline`] - Per-item sequencing and batch failure policy
//! - [`retry`] - Shared backoff policy and failure classification
//! - [`progress`] - Throttled progress aggregation
//! - [`config`] - Validated tunables

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod enrich;
pub mod http_client;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod source;
pub mod upload;

// Re-export commonly used types
pub use config::{ConfigError, PipelineConfig, RetrySettings};
pub use download::{AssemblyBuffer, DownloadError, Segment, SegmentedDownloader, plan_segments};
pub use enrich::{
    Analyzer, AnalyzerDialect, AnalyzerStage, EnrichInput, EnrichedMetadata, Enrichment,
    EnrichmentChain, EnrichmentRules, HttpAnalyzer, Script, Stage,
};
pub use pipeline::{
    BatchReport, ErrorKind, ItemStatus, Outcome, Pipeline, TransferError, TransferItem,
    TransferResult,
};
pub use progress::{ProgressAggregator, ProgressCallback, ProgressSnapshot, TransferStage};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy};
pub use source::{HttpSource, MediaObject, MediaSource, RangeReader, ResolvedItem, SourceError};
pub use upload::{
    HttpResumableSink, PostStep, ResumableUploader, SinkError, SinkSettings, UploadError,
    UploadSink,
};
