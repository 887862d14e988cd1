//! HTTP+JSON content source with ranged content reads.
//!
//! Protocol:
//! - `GET {base}/items/{locator}` returns an item descriptor
//!   (`{"id", "has_media", "size", "text", "file_name"}`)
//! - `GET {base}/items/{id}/content` with `Range: bytes=a-b` returns `206`
//!   and the requested slice

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, RANGE};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::{ByteStream, MediaObject, MediaSource, RangeReader, ResolvedItem, SourceError};
use crate::http_client::{HttpTimeouts, build_http_client};

#[derive(Debug, Deserialize)]
struct ItemDescriptor {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    has_media: bool,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
}

/// Content source speaking the item/content HTTP protocol.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSource {
    /// Creates a source rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Malformed`] when `base_url` is not a valid URL or
    /// the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeouts: HttpTimeouts,
    ) -> Result<Self, SourceError> {
        Url::parse(base_url).map_err(|e| SourceError::malformed(base_url, e.to_string()))?;
        let client = build_http_client("source", timeouts)
            .map_err(|e| SourceError::malformed(base_url, e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn item_url(&self, locator: &str) -> String {
        format!("{}/items/{}", self.base_url, urlencoding::encode(locator))
    }
}

#[async_trait]
impl MediaSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self), fields(source = "http"))]
    async fn resolve(&self, locator: &str) -> Result<ResolvedItem, SourceError> {
        let url = self.item_url(locator);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::network(&url, e))?;

        let status = response.status().as_u16();
        match status {
            404 | 410 => return Err(SourceError::not_found(locator)),
            401 | 403 => return Err(SourceError::access_denied(locator)),
            s if !(200..300).contains(&s) => return Err(SourceError::http_status(&url, s)),
            _ => {}
        }

        let descriptor: ItemDescriptor = response
            .json()
            .await
            .map_err(|e| SourceError::malformed(&url, e.to_string()))?;

        let item_id = descriptor
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| locator.to_string());

        debug!(
            item_id = %item_id,
            has_media = descriptor.has_media,
            size = descriptor.size,
            "resolved item"
        );

        let media = descriptor.has_media.then(|| MediaObject {
            total_size: descriptor.size,
            file_name: descriptor.file_name,
            reader: Arc::new(HttpRangeReader {
                client: self.client.clone(),
                url: format!("{}/content", self.item_url(&item_id)),
                token: self.token.clone(),
            }) as Arc<dyn RangeReader>,
        });

        Ok(ResolvedItem {
            item_id,
            raw_text: descriptor.text.filter(|text| !text.trim().is_empty()),
            media,
        })
    }
}

/// Issues `Range` requests against one content URL.
#[derive(Debug, Clone)]
struct HttpRangeReader {
    client: Client,
    url: String,
    token: Option<String>,
}

#[async_trait]
impl RangeReader for HttpRangeReader {
    async fn read_range(&self, offset: u64, length: u64) -> Result<ByteStream, SourceError> {
        if length == 0 {
            return Ok(futures_util::stream::empty().boxed());
        }
        let last = offset + length - 1;
        let mut request = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={offset}-{last}"));
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::network(&self.url, e))?;

        let status = response.status().as_u16();
        match status {
            206 => {}
            // A plain 200 is only acceptable when it is exactly the requested slice.
            200 if offset == 0 && declared_length(&response) == Some(length) => {}
            200 => {
                return Err(SourceError::malformed(
                    &self.url,
                    "server ignored the Range header",
                ));
            }
            s => return Err(SourceError::http_status(&self.url, s)),
        }

        let url = self.url.clone();
        Ok(response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| SourceError::network(&url, e)))
            .boxed())
    }
}

fn declared_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
