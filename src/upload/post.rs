//! Best-effort steps run after a successful upload.
//!
//! A failing post step is logged and reported, never propagated: the upload
//! it follows has already succeeded.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::enrich::EnrichedMetadata;
use crate::http_client::{HttpTimeouts, build_http_client};

/// Errors from a post step.
#[derive(Debug, Error)]
pub enum PostStepError {
    /// Transport failure.
    #[error("{step}: network error: {source}")]
    Network {
        /// Step name.
        step: &'static str,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// Non-success status.
    #[error("{step}: HTTP {status}")]
    HttpStatus {
        /// Step name.
        step: &'static str,
        /// Status code.
        status: u16,
    },

    /// Local file could not be read.
    #[error("{step}: cannot read {path}: {source}")]
    Io {
        /// Step name.
        step: &'static str,
        /// File path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The step could not be constructed.
    #[error("{step}: {message}")]
    Setup {
        /// Step name.
        step: &'static str,
        /// What went wrong.
        message: String,
    },
}

/// Action keyed by the remote id of a finished upload.
#[async_trait]
pub trait PostStep: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Applies the step to `remote_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PostStepError`] on failure; callers log and continue.
    async fn apply(&self, remote_id: &str, metadata: &EnrichedMetadata)
    -> Result<(), PostStepError>;
}

/// Runs every step in order and returns how many failed.
pub async fn run_post_steps(
    steps: &[Arc<dyn PostStep>],
    remote_id: &str,
    metadata: &EnrichedMetadata,
) -> usize {
    let mut failed = 0;
    for step in steps {
        match step.apply(remote_id, metadata).await {
            Ok(()) => debug!(step = step.name(), remote_id, "post step applied"),
            Err(e) => {
                warn!(step = step.name(), remote_id, error = %e, "post step failed");
                failed += 1;
            }
        }
    }
    failed
}

struct ApiClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl ApiClient {
    fn new(
        step: &'static str,
        endpoint: &str,
        token: String,
        timeouts: HttpTimeouts,
    ) -> Result<Self, PostStepError> {
        let client = build_http_client(step, timeouts).map_err(|e| PostStepError::Setup {
            step,
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn check(
        step: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<(), PostStepError> {
        let response = request
            .send()
            .await
            .map_err(|source| PostStepError::Network { step, source })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(PostStepError::HttpStatus {
                step,
                status: status.as_u16(),
            })
        }
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Adds the uploaded object to the playlist mapped from its category.
#[derive(Debug)]
pub struct PlaylistInsert {
    api: ApiClient,
    playlists: HashMap<String, String>,
}

impl PlaylistInsert {
    const NAME: &'static str = "playlist-insert";

    /// Creates the step. Categories are matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`PostStepError::Setup`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: &str,
        token: String,
        playlists: HashMap<String, String>,
        timeouts: HttpTimeouts,
    ) -> Result<Self, PostStepError> {
        Ok(Self {
            api: ApiClient::new(Self::NAME, endpoint, token, timeouts)?,
            playlists: playlists
                .into_iter()
                .map(|(category, id)| (category.to_lowercase(), id))
                .collect(),
        })
    }

    fn playlist_for(&self, category: &str) -> Option<&str> {
        self.playlists
            .get(&category.to_lowercase())
            .map(String::as_str)
    }
}

#[async_trait]
impl PostStep for PlaylistInsert {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn apply(
        &self,
        remote_id: &str,
        metadata: &EnrichedMetadata,
    ) -> Result<(), PostStepError> {
        let Some(playlist_id) = self.playlist_for(&metadata.category) else {
            debug!(category = %metadata.category, "no playlist mapped for category");
            return Ok(());
        };

        let request = self
            .api
            .client
            .post(format!("{}/playlistItems?part=snippet", self.api.endpoint))
            .bearer_auth(&self.api.token)
            .json(&json!({
                "snippet": {
                    "playlistId": playlist_id,
                    "resourceId": { "kind": "video", "videoId": remote_id },
                }
            }));
        ApiClient::check(Self::NAME, request).await?;
        info!(remote_id, playlist_id, "added to playlist");
        Ok(())
    }
}

/// Uploads a fixed image as the object's thumbnail.
#[derive(Debug)]
pub struct ThumbnailSet {
    api: ApiClient,
    image: PathBuf,
}

impl ThumbnailSet {
    const NAME: &'static str = "thumbnail-set";

    /// Creates the step for the image at `image`.
    ///
    /// # Errors
    ///
    /// Returns [`PostStepError::Setup`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: &str,
        token: String,
        image: impl Into<PathBuf>,
        timeouts: HttpTimeouts,
    ) -> Result<Self, PostStepError> {
        Ok(Self {
            api: ApiClient::new(Self::NAME, endpoint, token, timeouts)?,
            image: image.into(),
        })
    }

    fn content_type(&self) -> &'static str {
        match self
            .image
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("png") => "image/png",
            _ => "image/jpeg",
        }
    }
}

#[async_trait]
impl PostStep for ThumbnailSet {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn apply(
        &self,
        remote_id: &str,
        _metadata: &EnrichedMetadata,
    ) -> Result<(), PostStepError> {
        let image = tokio::fs::read(&self.image)
            .await
            .map_err(|source| PostStepError::Io {
                step: Self::NAME,
                path: self.image.clone(),
                source,
            })?;

        let request = self
            .api
            .client
            .post(format!(
                "{}/thumbnails/set?videoId={}",
                self.api.endpoint,
                urlencoding::encode(remote_id)
            ))
            .bearer_auth(&self.api.token)
            .header(CONTENT_TYPE, self.content_type())
            .body(image);
        ApiClient::check(Self::NAME, request).await?;
        info!(remote_id, "thumbnail set");
        Ok(())
    }
}
