//! Batch-level behaviour of the pipeline against in-memory fakes.
//!
//! Covers ordering, quota abort, bounded retries on both transfer sides,
//! no-media skips, cancellation, item deadlines, and buffer cleanup.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mediarelay_core::upload::PostStepError;
use mediarelay_core::{
    AnalyzerStage, BatchReport, EnrichedMetadata, EnrichmentChain, ErrorKind, Outcome, Pipeline,
    PipelineConfig, PostStep, ProgressSnapshot, RetryPolicy, Script, Stage, TransferStage,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

mod support;
use support::{
    MemoryItem, MemorySink, MemorySource, ScriptedAnalyzer, fast_config, leftover_files, payload,
};

fn locators(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

fn pipeline(
    config: PipelineConfig,
    source: &Arc<MemorySource>,
    sink: &Arc<MemorySink>,
) -> Pipeline {
    let chain = EnrichmentChain::local_only(config.enrichment_rules());
    Pipeline::new(
        Arc::new(config),
        Arc::clone(source) as Arc<dyn mediarelay_core::MediaSource>,
        chain,
        Arc::clone(sink) as Arc<dyn mediarelay_core::UploadSink>,
    )
    .expect("valid pipeline config")
}

async fn run(pipeline: &Pipeline, names: &[&str]) -> BatchReport {
    pipeline
        .run_batch(&locators(names), &CancellationToken::new())
        .await
}

fn failed_kind(outcome: &Outcome) -> Option<ErrorKind> {
    match outcome {
        Outcome::Failed { kind, .. } => Some(*kind),
        _ => None,
    }
}

#[tokio::test]
async fn test_batch_uploads_exact_bytes_in_input_order() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_item("c", MemoryItem::media(5000).with_text("Organic chemistry lesson"))
            .with_item("a", MemoryItem::media(1))
            .with_item("b", MemoryItem::media(4096)),
    );
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["c", "a", "b"]).await;

    assert!(!report.aborted_early);
    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| r.is_success()));
    assert_eq!(
        report.results.iter().map(|r| r.item_id.as_str()).collect::<Vec<_>>(),
        ["id-c", "id-a", "id-b"]
    );
    assert_eq!(source.resolved(), ["c", "a", "b"]);

    let stored = sink.stored();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0].bytes, payload(5000));
    assert_eq!(stored[1].bytes, payload(1));
    assert_eq!(stored[2].bytes, payload(4096));
    assert_eq!(stored[0].metadata.category, "Chemistry");
    assert_eq!(leftover_files(dir.path()), 0);
}

#[tokio::test]
async fn test_quota_on_second_of_five_skips_the_rest() {
    let dir = TempDir::new().expect("tempdir");
    let mut source = MemorySource::new();
    for name in ["i1", "i2", "i3", "i4", "i5"] {
        source = source.with_item(name, MemoryItem::media(2000));
    }
    let source = Arc::new(source);
    let sink = Arc::new(MemorySink::new().with_quota_on_session(2));
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["i1", "i2", "i3", "i4", "i5"]).await;

    assert!(report.aborted_early);
    assert!(report.results[0].is_success());
    assert!(matches!(
        &report.results[1].outcome,
        Outcome::QuotaExhausted { reason } if reason == "quotaExceeded"
    ));
    for result in &report.results[2..] {
        assert_eq!(
            result.outcome,
            Outcome::Skipped {
                reason: "quota".to_string()
            }
        );
    }
    // Items after the quota signal are never resolved or uploaded.
    assert_eq!(source.resolved(), ["i1", "i2"]);
    assert_eq!(sink.sessions(), 2);
    assert_eq!(sink.stored().len(), 1);
    assert_eq!(leftover_files(dir.path()), 0);
}

#[tokio::test]
async fn test_item_without_media_is_skipped() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_item("text", MemoryItem::text_only("just a message"))
            .with_item("video", MemoryItem::media(10)),
    );
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["text", "video"]).await;

    assert_eq!(
        report.results[0].outcome,
        Outcome::Skipped {
            reason: "no media".to_string()
        }
    );
    assert_eq!(report.results[0].item_id, "id-text");
    assert!(report.results[1].is_success());
    assert_eq!(sink.sessions(), 1);
}

#[tokio::test]
async fn test_zero_size_media_fails_with_invalid_size() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(MemorySource::new().with_item("empty", MemoryItem::media(0)));
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["empty"]).await;

    assert_eq!(failed_kind(&report.results[0].outcome), Some(ErrorKind::InvalidSize));
    assert_eq!(sink.sessions(), 0);
}

#[tokio::test]
async fn test_unknown_locator_fails_and_batch_continues() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(MemorySource::new().with_item("ok", MemoryItem::media(300)));
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["missing", "ok"]).await;

    assert_eq!(
        failed_kind(&report.results[0].outcome),
        Some(ErrorKind::SourceUnavailable)
    );
    assert_eq!(report.results[0].item_id, "missing");
    assert!(report.results[1].is_success());
    assert!(!report.aborted_early);
}

#[tokio::test]
async fn test_segment_failures_below_budget_still_succeed() {
    let dir = TempDir::new().expect("tempdir");
    // One segment, budget of three attempts, two injected failures.
    let source = Arc::new(
        MemorySource::new().with_item("flaky", MemoryItem::media(800).failing_reads(2)),
    );
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["flaky"]).await;

    assert!(report.results[0].is_success());
    assert_eq!(sink.stored()[0].bytes, payload(800));
}

#[tokio::test]
async fn test_segment_failures_at_budget_fail_item_and_clean_up() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_item("broken", MemoryItem::media(800).failing_reads(3))
            .with_item("next", MemoryItem::media(800)),
    );
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["broken", "next"]).await;

    assert_eq!(
        failed_kind(&report.results[0].outcome),
        Some(ErrorKind::SegmentExhausted { index: 0 })
    );
    assert!(report.results[1].is_success());
    assert_eq!(sink.sessions(), 1);
    assert_eq!(leftover_files(dir.path()), 0);
}

#[tokio::test]
async fn test_upload_failures_below_budget_still_succeed() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(MemorySource::new().with_item("v", MemoryItem::media(4000)));
    let sink = Arc::new(MemorySink::new().with_transient_chunk_failures(2));
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["v"]).await;

    assert!(report.results[0].is_success());
    assert_eq!(sink.stored()[0].bytes, payload(4000));
}

#[tokio::test]
async fn test_upload_failures_at_budget_fail_as_transient() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_item("v1", MemoryItem::media(4000))
            .with_item("v2", MemoryItem::media(100)),
    );
    let sink = Arc::new(MemorySink::new().with_transient_chunk_failures(3));
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["v1", "v2"]).await;

    assert_eq!(
        failed_kind(&report.results[0].outcome),
        Some(ErrorKind::UploadTransient)
    );
    assert!(report.results[1].is_success());
    assert!(!report.aborted_early);
    assert_eq!(leftover_files(dir.path()), 0);
}

#[tokio::test]
async fn test_rejected_upload_is_permanent_failure() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(MemorySource::new().with_item("v", MemoryItem::media(100)));
    let sink = Arc::new(MemorySink::new().rejecting_chunks());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);

    let report = run(&pipeline, &["v"]).await;

    assert_eq!(
        failed_kind(&report.results[0].outcome),
        Some(ErrorKind::UploadPermanent)
    );
    assert_eq!(sink.chunk_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsizable_buffer_fails_as_io_and_leaves_no_file() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(
        MemorySource::new().with_item("huge", MemoryItem::media(16).claiming_size(1 << 63)),
    );
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        segment_size: 1 << 63,
        ..fast_config(dir.path())
    };
    let pipeline = pipeline(config, &source, &sink);

    let report = run(&pipeline, &["huge"]).await;

    assert_eq!(failed_kind(&report.results[0].outcome), Some(ErrorKind::Io));
    assert_eq!(sink.sessions(), 0);
    assert_eq!(leftover_files(dir.path()), 0);
}

#[tokio::test]
async fn test_cancel_before_start_fails_every_item_as_cancelled() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(MemorySource::new().with_item("a", MemoryItem::media(10)));
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline.run_batch(&locators(&["a", "b"]), &cancel).await;

    assert!(
        report
            .results
            .iter()
            .all(|r| failed_kind(&r.outcome) == Some(ErrorKind::Cancelled))
    );
    assert!(source.resolved().is_empty());
}

#[tokio::test]
async fn test_cancel_during_download_stops_batch_and_cleans_up() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_item("slow", MemoryItem::media(4096).slow_reads(Duration::from_secs(5)))
            .with_item("later", MemoryItem::media(10)),
    );
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(3),
        pipeline.run_batch(&locators(&["slow", "later"]), &cancel),
    )
    .await
    .expect("cancellation should stop the batch promptly");

    assert_eq!(failed_kind(&report.results[0].outcome), Some(ErrorKind::Cancelled));
    assert_eq!(failed_kind(&report.results[1].outcome), Some(ErrorKind::Cancelled));
    assert_eq!(source.resolved(), ["slow"]);
    assert_eq!(sink.sessions(), 0);
    assert_eq!(leftover_files(dir.path()), 0);
}

#[tokio::test]
async fn test_item_timeout_fails_only_that_item() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(
        MemorySource::new()
            .with_item("stuck", MemoryItem::media(100).slow_reads(Duration::from_secs(5)))
            .with_item("quick", MemoryItem::media(100)),
    );
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        item_timeout: Some(Duration::from_millis(100)),
        ..fast_config(dir.path())
    };
    let pipeline = pipeline(config, &source, &sink);

    let report = run(&pipeline, &["stuck", "quick"]).await;

    match &report.results[0].outcome {
        Outcome::Failed { kind, message } => {
            assert_eq!(*kind, ErrorKind::Cancelled);
            assert!(message.contains("timed out"), "unexpected message: {message}");
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
    assert!(report.results[1].is_success());
    assert_eq!(leftover_files(dir.path()), 0);
}

#[tokio::test]
async fn test_forced_fallback_replaces_remote_title() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(
        MemorySource::new().with_item("v", MemoryItem::media(50).with_text("භෞතික විද්‍යාව lesson")),
    );
    let sink = Arc::new(MemorySink::new());
    let config = PipelineConfig {
        forbidden_scripts: vec![Script::Sinhala],
        ..fast_config(dir.path())
    };
    let analyzer = Arc::new(ScriptedAnalyzer::always(
        "primary",
        r#"{"title": "භෞතික විද්‍යාව පාඩම", "description": "d", "category": "Physics"}"#,
    ));
    let chain = EnrichmentChain::new(
        config.enrichment_rules(),
        Some(AnalyzerStage::new(
            Stage::Primary,
            analyzer,
            RetryPolicy::with_max_attempts(1),
        )),
        None,
    );
    let pipeline = Pipeline::new(
        Arc::new(config),
        source as Arc<dyn mediarelay_core::MediaSource>,
        chain,
        Arc::clone(&sink) as Arc<dyn mediarelay_core::UploadSink>,
    )
    .expect("pipeline");

    let report = run(&pipeline, &["v"]).await;

    assert!(report.results[0].is_success());
    let title = &sink.stored()[0].metadata.title;
    assert!(
        !title.chars().any(|c| ('\u{0D80}'..='\u{0DFF}').contains(&c)),
        "title kept forbidden script: {title}"
    );
    assert!(!title.is_empty());
}

struct RecordingStep {
    fail: bool,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl PostStep for RecordingStep {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn apply(
        &self,
        remote_id: &str,
        _metadata: &EnrichedMetadata,
    ) -> Result<(), PostStepError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(remote_id.to_string());
        }
        if self.fail {
            Err(PostStepError::HttpStatus {
                step: "recording",
                status: 500,
            })
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_failing_post_step_does_not_fail_item() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(MemorySource::new().with_item("v", MemoryItem::media(64)));
    let sink = Arc::new(MemorySink::new());
    let failing = Arc::new(RecordingStep {
        fail: true,
        seen: Mutex::new(Vec::new()),
    });
    let passing = Arc::new(RecordingStep {
        fail: false,
        seen: Mutex::new(Vec::new()),
    });
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink).with_post_steps(vec![
        Arc::clone(&failing) as Arc<dyn PostStep>,
        Arc::clone(&passing) as Arc<dyn PostStep>,
    ]);

    let report = run(&pipeline, &["v"]).await;

    assert!(report.results[0].is_success());
    assert_eq!(*failing.seen.lock().expect("lock"), ["remote-1"]);
    assert_eq!(*passing.seen.lock().expect("lock"), ["remote-1"]);
}

#[tokio::test]
async fn test_progress_callback_sees_both_stages_finish() {
    let dir = TempDir::new().expect("tempdir");
    let source = Arc::new(MemorySource::new().with_item("v", MemoryItem::media(3000)));
    let sink = Arc::new(MemorySink::new());
    let snapshots: Arc<Mutex<Vec<ProgressSnapshot>>> = Arc::default();
    let recorder = Arc::clone(&snapshots);
    let pipeline = pipeline(fast_config(dir.path()), &source, &sink).with_progress_callback(
        Arc::new(move |snapshot: &ProgressSnapshot| {
            if let Ok(mut all) = recorder.lock() {
                all.push(snapshot.clone());
            }
        }),
    );

    let report = run(&pipeline, &["v"]).await;
    assert!(report.results[0].is_success());

    let snapshots = snapshots.lock().expect("lock");
    for stage in [TransferStage::Download, TransferStage::Upload] {
        let finals: Vec<_> = snapshots
            .iter()
            .filter(|s| s.stage == stage && s.finished)
            .collect();
        assert_eq!(finals.len(), 1, "one final snapshot for {stage}");
        assert_eq!(finals[0].transferred, 3000);
        assert_eq!(finals[0].item_id, "id-v");
    }
    // Never more bytes than the total.
    assert!(snapshots.iter().all(|s| s.transferred <= s.total));
}
