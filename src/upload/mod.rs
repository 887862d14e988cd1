//! Resumable, chunked upload of an assembled object.
//!
//! The sink protocol is a sequential append against a server-held cursor:
//! initiate a session, then send chunks in offset order until the sink
//! answers with the remote id. Chunks are never sent concurrently.
//!
//! # Failure handling
//!
//! Each sink call is classified with [`classify_sink_error`]:
//! - transient failures (network, timeout, 5xx) are retried per chunk with
//!   exponential backoff until the [`RetryPolicy`] budget is spent
//! - quota signals stop the upload at once with [`UploadError::QuotaExhausted`]
//! - anything else is permanent and fails the upload without retry
//!
//! Post steps in [`post`] run only after a successful upload and never fail it.

mod error;
mod http;
pub mod post;

pub use error::{SinkError, UploadError, classify_sink_error};
pub use http::{HttpResumableSink, SinkSettings};
pub use post::{PlaylistInsert, PostStep, PostStepError, ThumbnailSet, run_post_steps};

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::download::AssemblyBuffer;
use crate::enrich::EnrichedMetadata;
use crate::progress::ProgressAggregator;
use crate::retry::{FailureType, RetryDecision, RetryPolicy};

/// Default chunk size (5 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Handle for one open upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Session URI chunks are sent to.
    pub uri: String,
}

/// Sink reply to one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// More bytes expected; `committed` is the next offset the sink wants.
    Progress {
        /// Bytes persisted by the sink so far.
        committed: u64,
    },
    /// The object is complete.
    Complete {
        /// Identifier of the created remote object.
        remote_id: String,
    },
}

/// A resumable-session upload target.
#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Opens a session for an object of `total_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on transport, status, or protocol failures.
    async fn initiate_session(
        &self,
        metadata: &EnrichedMetadata,
        total_size: u64,
    ) -> Result<UploadSession, SinkError>;

    /// Sends `chunk` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] on transport, status, or protocol failures.
    async fn send_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
        total_size: u64,
    ) -> Result<ChunkAck, SinkError>;
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Identifier returned by the sink.
    pub remote_id: String,
    /// Chunk sends that were acknowledged.
    pub chunks_sent: usize,
    /// Retries performed across initiation and chunks.
    pub retried: usize,
}

/// Drives one upload through an [`UploadSink`].
#[derive(Debug, Clone)]
pub struct ResumableUploader {
    chunk_size: usize,
    retry_policy: RetryPolicy,
}

impl ResumableUploader {
    /// Creates an uploader sending `chunk_size`-byte chunks.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::InvalidChunkSize`] when `chunk_size` is zero.
    pub fn new(chunk_size: usize, retry_policy: RetryPolicy) -> Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            chunk_size,
            retry_policy,
        })
    }

    /// Uploads the whole buffer with `metadata`.
    ///
    /// When the sink commits fewer bytes than were sent, the next chunk starts
    /// at the committed offset and the missing bytes are re-read from the
    /// buffer.
    ///
    /// # Errors
    ///
    /// See [`UploadError`]. Quota signals are returned without retry.
    #[instrument(skip_all, fields(sink = sink.name(), total = buffer.len()))]
    pub async fn upload(
        &self,
        sink: &dyn UploadSink,
        buffer: &AssemblyBuffer,
        metadata: &EnrichedMetadata,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        let total = buffer.len();
        let mut retried = 0;

        let session = self
            .with_retry("initiate", cancel, &mut retried, || {
                sink.initiate_session(metadata, total)
            })
            .await?;
        debug!(session = %session.uri, "upload session opened");

        let mut offset = 0u64;
        let mut chunks_sent = 0usize;
        let mut stalled = 0u32;

        loop {
            let len = usize::try_from(total - offset)
                .map_or(self.chunk_size, |rest| rest.min(self.chunk_size));
            let mut data = vec![0u8; len];
            let read = buffer.read_at(offset, &mut data).await?;
            data.truncate(read);
            let chunk = Bytes::from(data);

            let ack = self
                .with_retry("chunk", cancel, &mut retried, || {
                    sink.send_chunk(&session, offset, chunk.clone(), total)
                })
                .await?;
            chunks_sent += 1;

            match ack {
                ChunkAck::Complete { remote_id } => {
                    progress.set_transferred(total);
                    progress.finish();
                    info!(remote_id = %remote_id, chunks = chunks_sent, retried, "upload complete");
                    return Ok(UploadReceipt {
                        remote_id,
                        chunks_sent,
                        retried,
                    });
                }
                ChunkAck::Progress { committed } => {
                    if committed >= total {
                        return Err(UploadError::Rejected {
                            operation: "chunk",
                            source: SinkError::protocol(format!(
                                "sink committed {committed} of {total} bytes without returning an id"
                            )),
                        });
                    }

                    if committed <= offset {
                        stalled += 1;
                        if stalled >= self.retry_policy.max_attempts() {
                            return Err(UploadError::Exhausted {
                                operation: "chunk",
                                attempts: stalled,
                                source: SinkError::protocol(format!(
                                    "sink did not advance past offset {offset}"
                                )),
                            });
                        }
                        let delay = self.retry_policy.calculate_delay(stalled);
                        warn!(offset, committed, delay_ms = delay.as_millis(), "sink made no progress");
                        sleep_or_cancel(delay, cancel).await?;
                    } else {
                        stalled = 0;
                    }
                    if committed < offset + read as u64 {
                        debug!(offset, committed, "sink committed a partial chunk; resending tail");
                    }

                    offset = committed;
                    progress.set_transferred(committed);
                    progress.record(0);
                }
            }
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        retried: &mut usize,
        mut call: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = call() => result,
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let kind = classify_sink_error(&error);
            if kind == FailureType::RateLimited {
                warn!(operation, error = %error, "sink quota exhausted");
                let reason = match error {
                    SinkError::QuotaExceeded { reason } => reason,
                    other => other.to_string(),
                };
                return Err(UploadError::QuotaExhausted { reason });
            }

            match self.retry_policy.should_retry(kind, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "upload call failed, retrying"
                    );
                    *retried += 1;
                    sleep_or_cancel(delay, cancel).await?;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(operation, attempt, %reason, error = %error, "upload call failed");
                    return Err(if kind == FailureType::Transient {
                        UploadError::Exhausted {
                            operation,
                            attempts: attempt,
                            source: error,
                        }
                    } else {
                        UploadError::Rejected {
                            operation,
                            source: error,
                        }
                    });
                }
            }
        }
    }
}

async fn sleep_or_cancel(
    delay: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<(), UploadError> {
    tokio::select! {
        () = cancel.cancelled() => Err(UploadError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::progress::TransferStage;

    /// In-memory sink that appends bytes and can inject failures per call.
    struct MemorySink {
        received: Mutex<Vec<u8>>,
        script: Mutex<Vec<SinkError>>,
        commit_limit: Option<u64>,
    }

    impl MemorySink {
        fn new(script: Vec<SinkError>) -> Self {
            Self {
                received: Mutex::new(Vec::new()),
                script: Mutex::new(script),
                commit_limit: None,
            }
        }

        fn next_failure(&self) -> Option<SinkError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        }
    }

    #[async_trait]
    impl UploadSink for MemorySink {
        fn name(&self) -> &str {
            "memory"
        }

        async fn initiate_session(
            &self,
            _metadata: &EnrichedMetadata,
            _total_size: u64,
        ) -> Result<UploadSession, SinkError> {
            Ok(UploadSession {
                uri: "memory://session".to_string(),
            })
        }

        async fn send_chunk(
            &self,
            _session: &UploadSession,
            offset: u64,
            chunk: Bytes,
            total_size: u64,
        ) -> Result<ChunkAck, SinkError> {
            if let Some(error) = self.next_failure() {
                return Err(error);
            }
            let mut received = self.received.lock().unwrap();
            assert_eq!(received.len() as u64, offset, "chunks must arrive in order");
            let keep = self
                .commit_limit
                .map_or(chunk.len(), |limit| chunk.len().min(limit as usize));
            received.extend_from_slice(&chunk[..keep]);
            if received.len() as u64 == total_size {
                Ok(ChunkAck::Complete {
                    remote_id: "remote-1".to_string(),
                })
            } else {
                Ok(ChunkAck::Progress {
                    committed: received.len() as u64,
                })
            }
        }
    }

    fn metadata() -> EnrichedMetadata {
        EnrichedMetadata {
            title: "t".to_string(),
            description: "d".to_string(),
            category: "c".to_string(),
            tags: vec![],
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
        )
        .with_jitter(Duration::ZERO)
    }

    async fn buffer_with(dir: &TempDir, data: &[u8]) -> AssemblyBuffer {
        let buffer = AssemblyBuffer::create(dir.path().join("u.part"), data.len() as u64)
            .await
            .unwrap();
        buffer.write_at(0, data).await.unwrap();
        buffer
    }

    fn progress(total: u64) -> ProgressAggregator {
        ProgressAggregator::new(TransferStage::Upload, "item", total, Duration::from_secs(3600))
    }

    fn server_error() -> SinkError {
        SinkError::HttpStatus {
            status: 503,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_upload_sends_ordered_chunks() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..=255).collect();
        let buffer = buffer_with(&dir, &data).await;
        let sink = MemorySink::new(vec![]);
        let uploader = ResumableUploader::new(50, policy(3)).unwrap();
        let progress = progress(256);

        let receipt = uploader
            .upload(&sink, &buffer, &metadata(), &progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(receipt.remote_id, "remote-1");
        assert_eq!(receipt.chunks_sent, 6);
        assert_eq!(*sink.received.lock().unwrap(), data);
        assert_eq!(progress.transferred(), 256);
    }

    #[tokio::test]
    async fn test_transient_failures_below_budget_succeed() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer_with(&dir, b"hello world").await;
        let sink = MemorySink::new(vec![server_error(), server_error()]);
        let uploader = ResumableUploader::new(4, policy(3)).unwrap();

        let receipt = uploader
            .upload(&sink, &buffer, &metadata(), &progress(11), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(receipt.retried, 2);
    }

    #[tokio::test]
    async fn test_transient_failures_at_budget_exhaust() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer_with(&dir, b"hello world").await;
        let sink = MemorySink::new(vec![server_error(), server_error(), server_error()]);
        let uploader = ResumableUploader::new(4, policy(3)).unwrap();

        let result = uploader
            .upload(&sink, &buffer, &metadata(), &progress(11), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(UploadError::Exhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_quota_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer_with(&dir, b"hello").await;
        let sink = MemorySink::new(vec![SinkError::QuotaExceeded {
            reason: "quotaExceeded".to_string(),
        }]);
        let uploader = ResumableUploader::new(4, policy(5)).unwrap();

        let result = uploader
            .upload(&sink, &buffer, &metadata(), &progress(5), &CancellationToken::new())
            .await;
        match result {
            Err(UploadError::QuotaExhausted { reason }) => assert_eq!(reason, "quotaExceeded"),
            other => panic!("expected QuotaExhausted, got {other:?}"),
        }
        assert!(sink.script.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer_with(&dir, b"hello").await;
        let sink = MemorySink::new(vec![
            SinkError::HttpStatus {
                status: 400,
                reason: Some("invalidTitle".to_string()),
            },
            server_error(),
        ]);
        let uploader = ResumableUploader::new(4, policy(5)).unwrap();

        let result = uploader
            .upload(&sink, &buffer, &metadata(), &progress(5), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(UploadError::Rejected { .. })));
        assert_eq!(sink.script.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_commit_resends_from_cursor() {
        let dir = TempDir::new().unwrap();
        let data = b"abcdefghijklmnop";
        let buffer = buffer_with(&dir, data).await;
        let mut sink = MemorySink::new(vec![]);
        sink.commit_limit = Some(3);
        let uploader = ResumableUploader::new(8, policy(3)).unwrap();

        let receipt = uploader
            .upload(&sink, &buffer, &metadata(), &progress(16), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&*sink.received.lock().unwrap(), data);
        assert_eq!(receipt.chunks_sent, 6);
    }

    #[tokio::test]
    async fn test_cancel_before_upload() {
        let dir = TempDir::new().unwrap();
        let buffer = buffer_with(&dir, b"hello").await;
        let sink = MemorySink::new(vec![]);
        let uploader = ResumableUploader::new(4, policy(3)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = uploader
            .upload(&sink, &buffer, &metadata(), &progress(5), &cancel)
            .await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            ResumableUploader::new(0, RetryPolicy::default()),
            Err(UploadError::InvalidChunkSize(0))
        ));
    }
}
