//! Batch orchestrator.
//!
//! Items run strictly one after another in input order; concurrency lives
//! inside the download and upload stages. Each item goes
//! `Pending → Resolving → Downloading → Enriching → Uploading →
//! PostProcessing → Done`, and any stage may end it in `Failed`. Quota
//! exhaustion stops the batch: every later item is reported as
//! `Skipped("quota")`.
//!
//! The assembly buffer of an item is deleted after the item reaches its
//! terminal state, whatever that state is.

mod error;

pub use error::{ErrorKind, TransferError};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::download::{AssemblyBuffer, SegmentedDownloader, plan_segments};
use crate::enrich::{EnrichInput, EnrichmentChain};
use crate::progress::{ProgressAggregator, ProgressCallback, TransferStage};
use crate::source::{MediaObject, MediaSource};
use crate::upload::{PostStep, ResumableUploader, UploadError, UploadSink, run_post_steps};

/// Skip reason for items without media.
pub const SKIP_NO_MEDIA: &str = "no media";

/// Skip reason for items left unprocessed after quota exhaustion.
pub const SKIP_QUOTA: &str = "quota";

/// Lifecycle position of a [`TransferItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Accepted, not started.
    Pending,
    /// Looking up the locator.
    Resolving,
    /// Fetching segments.
    Downloading,
    /// Deriving metadata.
    Enriching,
    /// Sending chunks.
    Uploading,
    /// Running post steps.
    PostProcessing,
    /// Uploaded.
    Done,
    /// Resolved without media.
    Skipped,
    /// Ended in error.
    Failed,
}

impl ItemStatus {
    /// Lowercase name used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolving => "resolving",
            Self::Downloading => "downloading",
            Self::Enriching => "enriching",
            Self::Uploading => "uploading",
            Self::PostProcessing => "post_processing",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Done`, `Skipped` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of work, owned by the orchestrator while it runs.
#[derive(Debug, Clone)]
pub struct TransferItem {
    /// Opaque source locator.
    pub locator: String,
    /// Identifier assigned by the source, once resolved.
    pub item_id: Option<String>,
    /// Declared size, once resolved.
    pub total_size: Option<u64>,
    /// Identifier of the created remote object, once uploaded.
    pub remote_id: Option<String>,
    status: ItemStatus,
}

impl TransferItem {
    /// Creates a pending item.
    #[must_use]
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            item_id: None,
            total_size: None,
            remote_id: None,
            status: ItemStatus::Pending,
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ItemStatus {
        self.status
    }

    /// Source id if resolved, otherwise the locator.
    #[must_use]
    pub fn display_id(&self) -> &str {
        self.item_id.as_deref().unwrap_or(&self.locator)
    }

    fn advance(&mut self, next: ItemStatus) {
        debug!(
            item = self.display_id(),
            from = %self.status,
            to = %next,
            "item status"
        );
        self.status = next;
    }
}

/// Terminal outcome of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Uploaded.
    Success {
        /// Identifier of the created remote object.
        remote_id: String,
    },
    /// Not attempted.
    Skipped {
        /// Why the item was skipped.
        reason: String,
    },
    /// Failed; the batch continued.
    Failed {
        /// Failure classification.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
    /// The sink reported quota exhaustion; the batch stopped here.
    QuotaExhausted {
        /// Reason reported by the sink.
        reason: String,
    },
}

/// Terminal record for one input item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    /// Locator as given.
    pub locator: String,
    /// Source id if the item was resolved, otherwise the locator.
    pub item_id: String,
    /// What happened.
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl TransferResult {
    fn skipped(locator: &str, reason: &str) -> Self {
        Self {
            locator: locator.to_string(),
            item_id: locator.to_string(),
            outcome: Outcome::Skipped {
                reason: reason.to_string(),
            },
        }
    }

    /// Returns true for [`Outcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }
}

/// Results of one batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// One entry per input locator.
    pub results: Vec<TransferResult>,
    /// True when quota exhaustion cut the batch short.
    pub aborted_early: bool,
}

impl BatchReport {
    /// Number of uploaded items.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Success { .. }))
    }

    /// Number of skipped items.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped { .. }))
    }

    /// Number of failed items, the quota-exhausted one included.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. } | Outcome::QuotaExhausted { .. }))
    }

    /// Returns true when any item failed for a reason other than cancellation.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| match &r.outcome {
            Outcome::Failed { kind, .. } => *kind != ErrorKind::Cancelled,
            Outcome::QuotaExhausted { .. } => true,
            _ => false,
        })
    }

    fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(&r.outcome)).count()
    }
}

/// How an item ended when no error was raised.
enum Completed {
    Uploaded { remote_id: String },
    NoMedia,
}

/// Sequences resolve, download, enrich, upload and post steps per item.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    source: Arc<dyn MediaSource>,
    enrichment: EnrichmentChain,
    sink: Arc<dyn UploadSink>,
    post_steps: Vec<Arc<dyn PostStep>>,
    downloader: SegmentedDownloader,
    uploader: ResumableUploader,
    progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("source", &self.source.name())
            .field("sink", &self.sink.name())
            .field("post_steps", &self.post_steps.len())
            .field("downloader", &self.downloader)
            .field("uploader", &self.uploader)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any tunable is out of range.
    pub fn new(
        config: Arc<PipelineConfig>,
        source: Arc<dyn MediaSource>,
        enrichment: EnrichmentChain,
        sink: Arc<dyn UploadSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let downloader =
            SegmentedDownloader::new(config.download_workers, config.segment_retry.policy())
                .map_err(|_| ConfigError::OutOfRange {
                    field: "download_workers",
                    value: config.download_workers.to_string(),
                    expected: "1..=64",
                })?;
        let uploader =
            ResumableUploader::new(config.upload_chunk_size, config.upload_retry.policy())
                .map_err(|_| ConfigError::OutOfRange {
                    field: "upload_chunk_size",
                    value: config.upload_chunk_size.to_string(),
                    expected: "> 0",
                })?;
        Ok(Self {
            config,
            source,
            enrichment,
            sink,
            post_steps: Vec::new(),
            downloader,
            uploader,
            progress_callback: None,
        })
    }

    /// Adds steps run after each successful upload.
    #[must_use]
    pub fn with_post_steps(mut self, steps: Vec<Arc<dyn PostStep>>) -> Self {
        self.post_steps = steps;
        self
    }

    /// Routes progress snapshots of every stage to `callback`.
    #[must_use]
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Processes `locators` in order and returns one result per locator.
    ///
    /// Once `cancel` fires, the running item fails with
    /// [`ErrorKind::Cancelled`] and so does every item after it.
    #[instrument(skip_all, fields(items = locators.len()))]
    pub async fn run_batch(&self, locators: &[String], cancel: &CancellationToken) -> BatchReport {
        let mut report = BatchReport::default();

        for (position, locator) in locators.iter().enumerate() {
            if report.aborted_early {
                report.results.push(TransferResult::skipped(locator, SKIP_QUOTA));
                continue;
            }
            if cancel.is_cancelled() {
                report.results.push(TransferResult {
                    locator: locator.clone(),
                    item_id: locator.clone(),
                    outcome: Outcome::Failed {
                        kind: ErrorKind::Cancelled,
                        message: "batch cancelled before item started".to_string(),
                    },
                });
                continue;
            }

            let result = self.run_item(position, locator, cancel).await;
            if let Outcome::QuotaExhausted { reason } = &result.outcome {
                warn!(
                    item = %result.item_id,
                    reason = %reason,
                    remaining = locators.len() - position - 1,
                    "quota exhausted; skipping remaining items"
                );
                report.aborted_early = true;
            }
            report.results.push(result);
        }

        info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            aborted_early = report.aborted_early,
            "batch finished"
        );
        report
    }

    /// Runs one item under its own child token, with the optional deadline.
    async fn run_item(
        &self,
        position: usize,
        locator: &str,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let item_cancel = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let deadline = self.config.item_timeout.map(|limit| {
            let token = item_cancel.clone();
            let flag = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        let mut item = TransferItem::new(locator);
        info!(position, locator, "item started");
        let result = self.process(position, &mut item, &item_cancel).await;
        if let Some(handle) = deadline {
            handle.abort();
        }

        let result = match result {
            Err(e) if e.is_cancellation() && timed_out.load(Ordering::SeqCst) => {
                Err(TransferError::TimedOut {
                    after: self.config.item_timeout.unwrap_or(Duration::ZERO),
                })
            }
            other => other,
        };

        let outcome = match result {
            Ok(Completed::Uploaded { remote_id }) => {
                info!(item = item.display_id(), remote_id = %remote_id, "item done");
                Outcome::Success { remote_id }
            }
            Ok(Completed::NoMedia) => {
                info!(item = item.display_id(), "item has no media; skipped");
                Outcome::Skipped {
                    reason: SKIP_NO_MEDIA.to_string(),
                }
            }
            Err(TransferError::Upload(UploadError::QuotaExhausted { reason })) => {
                item.advance(ItemStatus::Failed);
                Outcome::QuotaExhausted { reason }
            }
            Err(e) => {
                item.advance(ItemStatus::Failed);
                warn!(item = item.display_id(), kind = %e.kind(), error = %e, "item failed");
                Outcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };

        TransferResult {
            locator: locator.to_string(),
            item_id: item.display_id().to_string(),
            outcome,
        }
    }

    async fn process(
        &self,
        position: usize,
        item: &mut TransferItem,
        cancel: &CancellationToken,
    ) -> Result<Completed, TransferError> {
        item.advance(ItemStatus::Resolving);
        let resolved = tokio::select! {
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
            resolved = self.source.resolve(&item.locator) => resolved?,
        };
        item.item_id = Some(resolved.item_id.clone());

        let Some(media) = resolved.media else {
            item.advance(ItemStatus::Skipped);
            return Ok(Completed::NoMedia);
        };
        item.total_size = Some(media.total_size);

        let segments = plan_segments(media.total_size, self.config.segment_size)?;

        let work_dir = &self.config.work_dir;
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|source| TransferError::WorkDir {
                path: work_dir.clone(),
                source,
            })?;
        let buffer = Arc::new(
            AssemblyBuffer::create(self.buffer_path(position, &resolved.item_id), media.total_size)
                .await?,
        );

        let result = self
            .transfer(item, media, segments, resolved.raw_text.as_deref(), &buffer, cancel)
            .await;

        // Drop also deletes the file; removing here surfaces the error in logs.
        if let Err(e) = buffer.remove().await {
            warn!(path = %buffer.path().display(), error = %e, "cannot remove assembly buffer");
        }
        result
    }

    async fn transfer(
        &self,
        item: &mut TransferItem,
        media: MediaObject,
        segments: Vec<crate::download::Segment>,
        raw_text: Option<&str>,
        buffer: &Arc<AssemblyBuffer>,
        cancel: &CancellationToken,
    ) -> Result<Completed, TransferError> {
        let item_id = item.display_id().to_string();

        item.advance(ItemStatus::Downloading);
        let progress = Arc::new(self.progress(TransferStage::Download, &item_id, media.total_size));
        let report = self
            .downloader
            .download(media.reader, segments, Arc::clone(buffer), progress, cancel)
            .await?;
        info!(
            item = %item_id,
            bytes = report.bytes,
            segments = report.segments,
            retried = report.retried,
            "download complete"
        );

        item.advance(ItemStatus::Enriching);
        let input = EnrichInput {
            locator: &item.locator,
            raw_text,
        };
        let enrichment = tokio::select! {
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
            enrichment = self.enrichment.enrich(&input) => enrichment,
        };
        info!(
            item = %item_id,
            stage = %enrichment.stage,
            forced_fallback = enrichment.forced_fallback,
            title = %enrichment.metadata.title,
            "metadata ready"
        );

        item.advance(ItemStatus::Uploading);
        let progress = self.progress(TransferStage::Upload, &item_id, media.total_size);
        let receipt = self
            .uploader
            .upload(
                self.sink.as_ref(),
                buffer,
                &enrichment.metadata,
                &progress,
                cancel,
            )
            .await?;
        item.remote_id = Some(receipt.remote_id.clone());

        if !self.post_steps.is_empty() {
            item.advance(ItemStatus::PostProcessing);
            let failed =
                run_post_steps(&self.post_steps, &receipt.remote_id, &enrichment.metadata).await;
            if failed > 0 {
                warn!(item = %item_id, failed, "some post steps failed");
            }
        }

        item.advance(ItemStatus::Done);
        Ok(Completed::Uploaded {
            remote_id: receipt.remote_id,
        })
    }

    fn progress(&self, stage: TransferStage, item_id: &str, total: u64) -> ProgressAggregator {
        ProgressAggregator::new(stage, item_id, total, self.config.progress_interval)
            .with_callback(self.progress_callback.clone())
    }

    fn buffer_path(&self, position: usize, item_id: &str) -> PathBuf {
        self.config
            .work_dir
            .join(format!("{position:04}-{}.part", sanitize_file_stem(item_id)))
    }
}

/// Replaces everything outside `[A-Za-z0-9._-]` with `_` and caps the length.
fn sanitize_file_stem(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(96)
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "item".to_string()
    } else {
        cleaned
    }
}
