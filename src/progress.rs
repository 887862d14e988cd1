//! Thread-safe byte accounting with throttled progress reporting.
//!
//! A [`ProgressAggregator`] is created per stage and per item: the segment
//! workers of one download share one aggregator, the upload loop of the same
//! item gets a fresh one. Callers invoke [`ProgressAggregator::record`] from any
//! task; the running total is an atomic add, and reporting is rate-limited to
//! one emission per configured interval plus an unconditional final emission
//! from [`ProgressAggregator::finish`].
//!
//! Emissions go to `tracing` and, when installed, to a [`ProgressCallback`]
//! (the CLI drives an `indicatif` bar through it).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Default minimum spacing between two progress emissions.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Observer invoked with every emitted snapshot.
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Which byte flow an aggregator measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    /// Segment range reads into the assembly buffer.
    Download,
    /// Chunk sends to the resumable upload sink.
    Upload,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => write!(f, "download"),
            Self::Upload => write!(f, "upload"),
        }
    }
}

/// Point-in-time view of one aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Stage being measured.
    pub stage: TransferStage,
    /// Item the bytes belong to.
    pub item_id: String,
    /// Bytes accounted so far.
    pub transferred: u64,
    /// Expected total bytes.
    pub total: u64,
    /// True for the final emission.
    pub finished: bool,
}

impl ProgressSnapshot {
    /// Completion percentage in `0.0..=100.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.transferred.min(self.total) as f64 * 100.0) / self.total as f64
    }
}

/// Accumulates transferred bytes from concurrent callers.
pub struct ProgressAggregator {
    stage: TransferStage,
    item_id: String,
    total: u64,
    transferred: AtomicU64,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
    emissions: AtomicUsize,
    finished: AtomicBool,
    callback: Option<ProgressCallback>,
}

impl ProgressAggregator {
    /// Creates an aggregator for `total` bytes of `item_id` in `stage`.
    #[must_use]
    pub fn new(
        stage: TransferStage,
        item_id: impl Into<String>,
        total: u64,
        interval: Duration,
    ) -> Self {
        Self {
            stage,
            item_id: item_id.into(),
            total,
            transferred: AtomicU64::new(0),
            interval,
            last_emit: Mutex::new(None),
            emissions: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            callback: None,
        }
    }

    /// Installs an observer for emitted snapshots.
    #[must_use]
    pub fn with_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Adds `bytes` to the running total and emits if the interval has elapsed.
    ///
    /// Never waits on another emitter: if the throttle lock is contended the
    /// caller skips emission.
    pub fn record(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::AcqRel);

        let due = match self.last_emit.try_lock() {
            Ok(mut last) => {
                let now = Instant::now();
                let due = last.is_none_or(|at| now.duration_since(at) >= self.interval);
                if due {
                    *last = Some(now);
                }
                due
            }
            Err(_) => false,
        };

        if due {
            self.emit(false);
        }
    }

    /// Removes bytes previously recorded for a range that is being refetched.
    pub fn retract(&self, bytes: u64) {
        let _ = self
            .transferred
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Overwrites the running total, used when a remote reports its own cursor.
    pub fn set_transferred(&self, bytes: u64) {
        self.transferred.store(bytes, Ordering::Release);
    }

    /// Emits the final snapshot. Only the first call has an effect.
    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.emit(true);
        }
    }

    /// Bytes accounted so far.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// Expected total.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of snapshots emitted so far.
    #[must_use]
    pub fn emissions(&self) -> usize {
        self.emissions.load(Ordering::Acquire)
    }

    /// Current snapshot without emitting.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: self.stage,
            item_id: self.item_id.clone(),
            transferred: self.transferred(),
            total: self.total,
            finished: self.finished.load(Ordering::Acquire),
        }
    }

    fn emit(&self, finished: bool) {
        let mut snapshot = self.snapshot();
        snapshot.finished = finished;
        self.emissions.fetch_add(1, Ordering::AcqRel);

        if finished {
            info!(
                stage = %snapshot.stage,
                item_id = %snapshot.item_id,
                transferred = snapshot.transferred,
                total = snapshot.total,
                "transfer finished"
            );
        } else {
            debug!(
                stage = %snapshot.stage,
                item_id = %snapshot.item_id,
                transferred = snapshot.transferred,
                total = snapshot.total,
                percent = format!("{:.1}", snapshot.percent()),
                "transfer progress"
            );
        }

        if let Some(callback) = &self.callback {
            callback(&snapshot);
        }
    }
}

impl fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("stage", &self.stage)
            .field("item_id", &self.item_id)
            .field("transferred", &self.transferred())
            .field("total", &self.total)
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}
