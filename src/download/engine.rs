//! Segmented downloader: a bounded worker pool filling one assembly buffer.
//!
//! The engine seeds a shared [`SegmentQueue`] with every planned segment,
//! spawns `W` workers into a `JoinSet`, and lets each worker pull an index,
//! stream the byte range from the item's [`RangeReader`], and write every chunk
//! at its absolute offset. A failed range read puts the index back on the queue
//! after a backoff delay until the segment's attempt budget runs out.
//!
//! Termination is decided by an outstanding-segment counter, not by queue
//! length: a worker that is backing off before re-enqueueing still holds its
//! segment, so idle workers keep waiting instead of exiting early.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use mediarelay_core::download::{AssemblyBuffer, SegmentedDownloader, plan_segments};
//! use mediarelay_core::progress::{ProgressAggregator, TransferStage};
//! use mediarelay_core::retry::RetryPolicy;
//! use mediarelay_core::source::RangeReader;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(reader: Arc<dyn RangeReader>) -> Result<(), Box<dyn std::error::Error>> {
//! let total = 64 * 1024 * 1024;
//! let segments = plan_segments(total, 4 * 1024 * 1024)?;
//! let buffer = Arc::new(AssemblyBuffer::create("./downloads/item.part", total).await?);
//! let progress = Arc::new(ProgressAggregator::new(
//!     TransferStage::Download,
//!     "item",
//!     total,
//!     Duration::from_secs(1),
//! ));
//! let engine = SegmentedDownloader::new(8, RetryPolicy::with_max_attempts(5))?;
//! let report = engine
//!     .download(reader, segments, buffer, progress, &CancellationToken::new())
//!     .await?;
//! println!("{} bytes, {} retries", report.bytes, report.retried);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::buffer::AssemblyBuffer;
use super::planner::{Segment, SegmentState};
use super::DownloadError;
use crate::progress::ProgressAggregator;
use crate::retry::{FailureType, RetryDecision, RetryPolicy};
use crate::source::{RangeReader, SourceError, classify_source_error};

/// Minimum allowed worker count.
pub const MIN_WORKERS: usize = 1;

/// Maximum allowed worker count.
pub const MAX_WORKERS: usize = 64;

/// Default worker count if not specified.
pub const DEFAULT_WORKERS: usize = 4;

/// Summary of a completed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    /// Bytes written to the buffer.
    pub bytes: u64,
    /// Segments completed.
    pub segments: usize,
    /// Segment re-enqueues caused by failed reads.
    pub retried: usize,
}

/// Downloads one object as parallel byte ranges.
#[derive(Debug, Clone)]
pub struct SegmentedDownloader {
    workers: usize,
    retry_policy: RetryPolicy,
}

impl SegmentedDownloader {
    /// Creates a downloader with `workers` concurrent range readers.
    ///
    /// `retry_policy.max_attempts()` bounds the fetch attempts per segment.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidConcurrency`] if `workers` is outside
    /// `MIN_WORKERS..=MAX_WORKERS`.
    pub fn new(workers: usize, retry_policy: RetryPolicy) -> Result<Self, DownloadError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(DownloadError::InvalidConcurrency {
                value: workers,
                min: MIN_WORKERS,
                max: MAX_WORKERS,
            });
        }
        Ok(Self {
            workers,
            retry_policy,
        })
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Fetches every segment into `buffer`.
    ///
    /// Returns once all segments are written, one segment exhausts its attempt
    /// budget, the buffer fails, or `cancel` fires. On any error the buffer
    /// contents are unspecified; the caller owns its removal.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::SegmentExhausted`] when a segment runs out of attempts
    /// - [`DownloadError::Io`] / [`DownloadError::OutOfBounds`] on buffer failure
    /// - [`DownloadError::Cancelled`] when `cancel` fires first
    /// - [`DownloadError::Worker`] when a worker task panics
    #[instrument(skip_all, fields(segments = segments.len(), workers = self.workers))]
    pub async fn download(
        &self,
        reader: Arc<dyn RangeReader>,
        segments: Vec<Segment>,
        buffer: Arc<AssemblyBuffer>,
        progress: Arc<ProgressAggregator>,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        let segment_count = segments.len();
        let worker_count = self.workers.min(segment_count);
        if worker_count == 0 {
            progress.finish();
            return Ok(DownloadReport {
                bytes: 0,
                segments: 0,
                retried: 0,
            });
        }

        let ctx = Arc::new(WorkerContext {
            reader,
            buffer,
            progress,
            queue: SegmentQueue::seeded(segment_count),
            board: Mutex::new(segments),
            policy: self.retry_policy.clone(),
            abort: cancel.child_token(),
            failure: Mutex::new(None),
            retried: AtomicUsize::new(0),
        });

        info!(segments = segment_count, workers = worker_count, "starting segmented download");

        let mut tasks = JoinSet::new();
        for worker_id in 0..worker_count {
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move { ctx.run(worker_id).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "segment worker panicked");
                ctx.record_failure(DownloadError::worker(e.to_string()));
                ctx.abort.cancel();
            }
        }

        if let Some(failure) = ctx.take_failure() {
            return Err(failure);
        }
        if cancel.is_cancelled() {
            info!("segmented download cancelled");
            return Err(DownloadError::Cancelled);
        }

        let (done, bytes) = {
            let board = ctx.board.lock().unwrap_or_else(PoisonError::into_inner);
            let done: Vec<&Segment> = board
                .iter()
                .filter(|s| s.state == SegmentState::Done)
                .collect();
            (done.len(), done.iter().map(|s| s.length).sum::<u64>())
        };
        if done != segment_count {
            return Err(DownloadError::Incomplete {
                done,
                total: segment_count,
            });
        }

        ctx.buffer.sync().await?;
        ctx.progress.finish();

        let report = DownloadReport {
            bytes,
            segments: done,
            retried: ctx.retried.load(Ordering::SeqCst),
        };
        info!(
            bytes = report.bytes,
            retried = report.retried,
            "segmented download complete"
        );
        Ok(report)
    }
}

/// Work queue of segment indices with an outstanding-work counter.
///
/// `outstanding` counts segments not yet `Done` or `Failed`, including ones a
/// worker is holding for a retry. Workers exit only when it reaches zero.
#[derive(Debug)]
struct SegmentQueue {
    pending: Mutex<VecDeque<usize>>,
    outstanding: AtomicUsize,
    notify: Notify,
}

impl SegmentQueue {
    fn seeded(count: usize) -> Self {
        Self {
            pending: Mutex::new((0..count).collect()),
            outstanding: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    /// Waits for the next index; `None` once all work is settled or `abort` fires.
    async fn next(&self, abort: &CancellationToken) -> Option<usize> {
        loop {
            // Register interest before checking state so a concurrent
            // requeue/complete cannot slip between the check and the wait.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if abort.is_cancelled() {
                return None;
            }
            if let Some(index) = self.pop() {
                return Some(index);
            }
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return None;
            }

            tokio::select! {
                () = abort.cancelled() => return None,
                () = &mut notified => {}
            }
        }
    }

    fn pop(&self) -> Option<usize> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn requeue(&self, index: usize) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(index);
        self.notify.notify_waiters();
    }

    fn complete(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

enum FetchError {
    Source { error: SourceError, written: u64 },
    Buffer(DownloadError),
    Aborted { written: u64 },
}

struct WorkerContext {
    reader: Arc<dyn RangeReader>,
    buffer: Arc<AssemblyBuffer>,
    progress: Arc<ProgressAggregator>,
    queue: SegmentQueue,
    board: Mutex<Vec<Segment>>,
    policy: RetryPolicy,
    abort: CancellationToken,
    failure: Mutex<Option<DownloadError>>,
    retried: AtomicUsize,
}

impl WorkerContext {
    async fn run(&self, worker_id: usize) {
        while let Some(index) = self.queue.next(&self.abort).await {
            let (offset, length, attempt) = self.claim(index);
            debug!(worker_id, segment = index, offset, length, attempt, "fetching segment");

            match self.fetch(offset, length).await {
                Ok(()) => {
                    self.set_state(index, SegmentState::Done);
                    self.queue.complete();
                }
                Err(FetchError::Source { error, written }) => {
                    self.progress.retract(written);
                    if !self.retry_or_fail(index, attempt, error).await {
                        return;
                    }
                }
                Err(FetchError::Buffer(error)) => {
                    warn!(segment = index, error = %error, "assembly buffer write failed");
                    self.set_state(index, SegmentState::Failed);
                    self.record_failure(error);
                    self.abort.cancel();
                    self.queue.complete();
                    return;
                }
                Err(FetchError::Aborted { written }) => {
                    self.progress.retract(written);
                    return;
                }
            }
        }
    }

    /// Returns false when the worker should stop.
    async fn retry_or_fail(&self, index: usize, attempt: u32, error: SourceError) -> bool {
        // Every failed range read is retried until the segment budget runs out.
        let kind = classify_source_error(&error);
        match self.policy.should_retry(FailureType::Transient, attempt) {
            RetryDecision::Retry { delay, .. } => {
                warn!(
                    segment = index,
                    attempt,
                    kind = ?kind,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "segment read failed, re-enqueueing"
                );
                self.set_state(index, SegmentState::Pending);
                self.retried.fetch_add(1, Ordering::SeqCst);

                tokio::select! {
                    () = self.abort.cancelled() => return false,
                    () = tokio::time::sleep(delay) => {}
                }
                self.queue.requeue(index);
                true
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(segment = index, attempt, reason = %reason, error = %error, "segment exhausted");
                self.set_state(index, SegmentState::Failed);
                self.record_failure(DownloadError::segment_exhausted(index, attempt, error));
                self.abort.cancel();
                self.queue.complete();
                false
            }
        }
    }

    async fn fetch(&self, offset: u64, length: u64) -> Result<(), FetchError> {
        let opened = tokio::select! {
            biased;
            () = self.abort.cancelled() => return Err(FetchError::Aborted { written: 0 }),
            opened = self.reader.read_range(offset, length) => opened,
        };
        let mut stream = opened.map_err(|error| FetchError::Source { error, written: 0 })?;

        let end = offset + length;
        let mut position = offset;
        while position < end {
            let written = position - offset;
            let next = tokio::select! {
                biased;
                () = self.abort.cancelled() => return Err(FetchError::Aborted { written }),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Err(error)) => return Err(FetchError::Source { error, written }),
                Some(Ok(chunk)) => chunk,
            };

            // Bytes past the end of the requested range are dropped.
            let take = usize::try_from(end - position)
                .map_or(chunk.len(), |remaining| remaining.min(chunk.len()));
            if take == 0 {
                continue;
            }
            self.buffer
                .write_at(position, &chunk[..take])
                .await
                .map_err(FetchError::Buffer)?;
            position += take as u64;
            self.progress.record(take as u64);
        }

        if position < end {
            return Err(FetchError::Source {
                error: SourceError::short_read(offset, length, position - offset),
                written: position - offset,
            });
        }
        Ok(())
    }

    fn claim(&self, index: usize) -> (u64, u64, u32) {
        let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        let segment = &mut board[index];
        segment.state = SegmentState::InFlight;
        segment.attempts += 1;
        (segment.offset, segment.length, segment.attempts)
    }

    fn set_state(&self, index: usize, state: SegmentState) {
        let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        board[index].state = state;
    }

    fn record_failure(&self, error: DownloadError) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn take_failure(&self) -> Option<DownloadError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
