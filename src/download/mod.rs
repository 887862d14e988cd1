//! Segmented download of one media object into a local assembly buffer.
//!
//! This module splits an object of known size into byte ranges, fetches the
//! ranges in parallel through the item's [`RangeReader`](crate::source::RangeReader),
//! and writes each range at its absolute offset into a pre-sized file.
//!
//! # Features
//!
//! - Contiguous, non-overlapping segment plans ([`plan_segments`])
//! - Bounded worker pool with per-segment retry by re-enqueueing
//! - Completion barrier on an outstanding-segment counter
//! - Cancellation through a `CancellationToken`
//! - Assembly buffer deleted on removal or drop
//!
//! # Example
//!
//! ```
//! use mediarelay_core::download::plan_segments;
//!
//! let segments = plan_segments(10, 4).unwrap();
//! assert_eq!(segments.len(), 3);
//! assert_eq!(segments[2].length, 2);
//! ```

mod buffer;
mod engine;
mod error;
mod planner;

pub use buffer::AssemblyBuffer;
pub use engine::{DEFAULT_WORKERS, DownloadReport, MAX_WORKERS, MIN_WORKERS, SegmentedDownloader};
pub use error::DownloadError;
pub use planner::{Segment, SegmentState, plan_segments};
