//! In-memory fakes of the source, sink and analyzer contracts shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use mediarelay_core::enrich::AnalyzerError;
use mediarelay_core::source::ByteStream;
use mediarelay_core::upload::{ChunkAck, UploadSession};
use mediarelay_core::{
    Analyzer, EnrichedMetadata, MediaObject, MediaSource, PipelineConfig, RangeReader,
    ResolvedItem, RetrySettings, SinkError, SourceError, UploadSink,
};

/// Deterministic test bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap_or(0)).collect()
}

/// Small, fast configuration rooted at `work_dir`.
pub fn fast_config(work_dir: &Path) -> PipelineConfig {
    let quick = |max_attempts| RetrySettings {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    PipelineConfig {
        segment_size: 1024,
        download_workers: 4,
        segment_retry: quick(3),
        upload_chunk_size: 1500,
        upload_retry: quick(3),
        analyzer_retry: quick(2),
        progress_interval: Duration::ZERO,
        work_dir: work_dir.to_path_buf(),
        ..PipelineConfig::default()
    }
}

/// Files left in `dir`; zero when the directory does not exist.
pub fn leftover_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |entries| entries.count())
}

/// Serves slices of an in-memory object, failing the first `fail_reads` reads.
pub struct MemoryReader {
    data: Arc<Vec<u8>>,
    fail_reads: AtomicUsize,
    read_delay: Option<Duration>,
    pub reads: AtomicUsize,
}

#[async_trait]
impl RangeReader for MemoryReader {
    async fn read_range(&self, offset: u64, length: u64) -> Result<ByteStream, SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SourceError::interrupted("injected read failure"));
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        let end = usize::try_from(offset + length)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let chunk = Bytes::copy_from_slice(&self.data[start..end]);
        Ok(futures_util::stream::iter([Ok(chunk)]).boxed())
    }
}

/// One item known to [`MemorySource`].
#[derive(Clone, Default)]
pub struct MemoryItem {
    pub data: Option<Vec<u8>>,
    pub text: Option<String>,
    pub fail_reads: usize,
    pub read_delay: Option<Duration>,
    /// Size reported by `resolve` instead of the payload length.
    pub declared_size: Option<u64>,
}

impl MemoryItem {
    pub fn media(len: usize) -> Self {
        Self {
            data: Some(payload(len)),
            ..Self::default()
        }
    }

    pub fn text_only(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn failing_reads(mut self, count: usize) -> Self {
        self.fail_reads = count;
        self
    }

    pub fn claiming_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn slow_reads(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }
}

/// Source backed by a locator map. Unknown locators resolve to `NotFound`.
#[derive(Default)]
pub struct MemorySource {
    items: HashMap<String, MemoryItem>,
    resolved: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, locator: &str, item: MemoryItem) -> Self {
        self.items.insert(locator.to_string(), item);
        self
    }

    /// Locators passed to `resolve`, in call order.
    pub fn resolved(&self) -> Vec<String> {
        self.resolved.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MediaSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn resolve(&self, locator: &str) -> Result<ResolvedItem, SourceError> {
        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.push(locator.to_string());
        }
        let item = self
            .items
            .get(locator)
            .ok_or_else(|| SourceError::not_found(locator))?;
        let media = item.data.as_ref().map(|data| MediaObject {
            total_size: item.declared_size.unwrap_or(data.len() as u64),
            file_name: None,
            reader: Arc::new(MemoryReader {
                data: Arc::new(data.clone()),
                fail_reads: AtomicUsize::new(item.fail_reads),
                read_delay: item.read_delay,
                reads: AtomicUsize::new(0),
            }) as Arc<dyn RangeReader>,
        });
        Ok(ResolvedItem {
            item_id: format!("id-{locator}"),
            raw_text: item.text.clone(),
            media,
        })
    }
}

/// A finished upload held by [`MemorySink`].
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub remote_id: String,
    pub metadata: EnrichedMetadata,
    pub bytes: Vec<u8>,
}

struct OpenSession {
    metadata: EnrichedMetadata,
    bytes: Vec<u8>,
}

/// Resumable sink storing uploads in memory.
#[derive(Default)]
pub struct MemorySink {
    /// 1-based session number whose initiation reports quota exhaustion.
    pub quota_on_session: Option<usize>,
    /// Chunk sends that fail with a timeout before any succeeds.
    pub transient_chunk_failures: AtomicUsize,
    /// Chunk sends answered with a permanent 400.
    pub reject_chunks: bool,
    sessions: AtomicUsize,
    pub chunk_calls: AtomicUsize,
    open: Mutex<HashMap<String, OpenSession>>,
    stored: Mutex<Vec<StoredUpload>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota_on_session(mut self, session: usize) -> Self {
        self.quota_on_session = Some(session);
        self
    }

    pub fn with_transient_chunk_failures(self, count: usize) -> Self {
        self.transient_chunk_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn rejecting_chunks(mut self) -> Self {
        self.reject_chunks = true;
        self
    }

    pub fn stored(&self) -> Vec<StoredUpload> {
        self.stored.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initiate_session(
        &self,
        metadata: &EnrichedMetadata,
        _total_size: u64,
    ) -> Result<UploadSession, SinkError> {
        let number = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.quota_on_session == Some(number) {
            return Err(SinkError::QuotaExceeded {
                reason: "quotaExceeded".to_string(),
            });
        }
        let uri = format!("mem://session/{number}");
        if let Ok(mut open) = self.open.lock() {
            open.insert(
                uri.clone(),
                OpenSession {
                    metadata: metadata.clone(),
                    bytes: Vec::new(),
                },
            );
        }
        Ok(UploadSession { uri })
    }

    async fn send_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
        total_size: u64,
    ) -> Result<ChunkAck, SinkError> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_chunk_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Timeout {
                url: session.uri.clone(),
            });
        }
        if self.reject_chunks {
            return Err(SinkError::HttpStatus {
                status: 400,
                reason: Some("invalidRequest".to_string()),
            });
        }

        let mut open = self
            .open
            .lock()
            .map_err(|_| SinkError::protocol("sink state poisoned"))?;
        let Some(state) = open.get_mut(&session.uri) else {
            return Err(SinkError::protocol("unknown session"));
        };
        state
            .bytes
            .truncate(usize::try_from(offset).unwrap_or(usize::MAX));
        state.bytes.extend_from_slice(&chunk);

        if state.bytes.len() as u64 >= total_size {
            let Some(done) = open.remove(&session.uri) else {
                return Err(SinkError::protocol("unknown session"));
            };
            let remote_id = format!("remote-{}", session.uri.rsplit('/').next().unwrap_or("?"));
            if let Ok(mut stored) = self.stored.lock() {
                stored.push(StoredUpload {
                    remote_id: remote_id.clone(),
                    metadata: done.metadata,
                    bytes: done.bytes,
                });
            }
            return Ok(ChunkAck::Complete { remote_id });
        }
        Ok(ChunkAck::Progress {
            committed: state.bytes.len() as u64,
        })
    }
}

/// Analyzer replaying scripted results; abstains with 503 once the script runs out.
pub struct ScriptedAnalyzer {
    name: String,
    replies: Mutex<VecDeque<Result<String, AnalyzerError>>>,
    pub calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn new(name: &str, replies: Vec<Result<String, AnalyzerError>>) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always replies with `json`.
    pub fn always(name: &str, json: &str) -> Self {
        Self::new(name, (0..16).map(|_| Ok(json.to_string())).collect())
    }

    pub fn unavailable(name: &str) -> Self {
        Self::new(name, Vec::new())
    }
}

pub fn unavailable_error(analyzer: &str) -> AnalyzerError {
    AnalyzerError::HttpStatus {
        analyzer: analyzer.to_string(),
        status: 503,
        retry_after: None,
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self, _prompt: &str) -> Result<String, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .unwrap_or_else(|| Err(unavailable_error(&self.name)))
    }
}
