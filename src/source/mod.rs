//! Content source contract consumed by the pipeline.
//!
//! A [`MediaSource`] turns an opaque locator into a [`ResolvedItem`]: the
//! accompanying text and, when the item carries media, a [`MediaObject`]
//! whose [`RangeReader`] serves arbitrary byte ranges. Range reads are
//! independent of each other, which is what lets the segmented downloader
//! fetch them in parallel.
//!
//! - [`MediaSource`] - Async trait implemented by concrete sources
//! - [`HttpSource`] - HTTP+JSON source with `Range` reads

mod error;
mod http;

pub use error::{SourceError, classify_source_error};
pub use http::HttpSource;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

/// Stream of body chunks returned by one range read.
pub type ByteStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Reads byte ranges of one media object.
///
/// # Object Safety
///
/// Uses `async_trait` so the downloader can hold `Arc<dyn RangeReader>`.
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Opens a stream over `[offset, offset + length)`.
    ///
    /// The stream may yield fewer bytes than requested if the connection
    /// drops; the caller detects short reads.
    async fn read_range(&self, offset: u64, length: u64) -> Result<ByteStream, SourceError>;
}

/// Media payload of a resolved item.
#[derive(Clone)]
pub struct MediaObject {
    /// Declared total size in bytes.
    pub total_size: u64,
    /// File name suggested by the source, if any.
    pub file_name: Option<String>,
    /// Reader for byte ranges of this object.
    pub reader: Arc<dyn RangeReader>,
}

impl fmt::Debug for MediaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaObject")
            .field("total_size", &self.total_size)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// Result of resolving one locator.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    /// Stable identifier assigned by the source.
    pub item_id: String,
    /// Free text accompanying the media (caption, message body).
    pub raw_text: Option<String>,
    /// Media payload; `None` when the item has no media attached.
    pub media: Option<MediaObject>,
}

impl ResolvedItem {
    /// Returns true when the item carries media.
    #[must_use]
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

/// A remote content source addressed by opaque locators.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Looks up the item behind `locator`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] or [`SourceError::AccessDenied`] for
    /// unusable locators, and transport errors otherwise.
    async fn resolve(&self, locator: &str) -> Result<ResolvedItem, SourceError>;
}
