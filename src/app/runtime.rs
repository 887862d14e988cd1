use std::io::{self, IsTerminal, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::ProgressDrawTarget;
use mediarelay_core::http_client::HttpTimeouts;
use mediarelay_core::upload::{PlaylistInsert, ThumbnailSet};
use mediarelay_core::{
    AnalyzerStage, BatchReport, EnrichmentChain, HttpAnalyzer, HttpResumableSink, HttpSource,
    Outcome, Pipeline, PipelineConfig, PostStep, SinkSettings,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::config_runtime::{self, AnalyzerSettings, Credentials, Endpoints};
use crate::app::{exit_handler, input_processor, progress_manager, terminal};
use crate::app_config::{self, FileConfig};
use crate::cli::Args;
use crate::ProcessExit;

pub(crate) async fn run() -> Result<ProcessExit> {
    let args = Args::parse();

    terminal::init_tracing(config_runtime::resolve_default_log_level(&args));
    debug!(?args, "CLI arguments parsed");

    let loaded = app_config::load_file_config_from(args.config.as_deref())?;
    if let (Some(path), Some(_)) = (&loaded.path, &loaded.config) {
        info!(path = %path.display(), "Loaded config file");
    }
    let file_config = loaded.config.as_ref();

    let env = |name: &str| std::env::var(name).ok();
    let config = Arc::new(config_runtime::resolve_pipeline_config(&args, file_config)?);
    let credentials = Credentials::from_lookup(env);
    let endpoints = config_runtime::resolve_endpoints(file_config, env)?;
    let timeouts = config_runtime::resolve_http_timeouts(file_config);
    debug!(?credentials, ?endpoints, "Resolved connection settings");

    let pipeline = build_pipeline(
        Arc::clone(&config),
        file_config,
        &endpoints,
        &credentials,
        timeouts,
    )?;

    let locators = input_processor::collect_locators(&args.locators, env)?;
    if locators.is_empty() {
        info!("No locators provided. Pass them as arguments, via MEDIARELAY_LOCATORS, or on stdin.");
        return Ok(ProcessExit::Success);
    }
    info!(items = locators.len(), work_dir = %config.work_dir.display(), "Mediarelay starting");

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let bars = terminal::should_use_progress_bars(
        io::stderr().is_terminal(),
        args.quiet,
        args.no_progress,
        terminal::is_dumb_terminal(),
    )
    .then(|| progress_manager::ProgressBars::new(ProgressDrawTarget::stderr()));
    let pipeline = match &bars {
        Some(bars) => pipeline.with_progress_callback(bars.callback()),
        None => pipeline,
    };

    let report = pipeline.run_batch(&locators, &cancel).await;
    if let Some(bars) = &bars {
        bars.clear();
    }

    print_report(&report, args.json)?;
    Ok(exit_handler::determine_exit_outcome(&report))
}

fn build_pipeline(
    config: Arc<PipelineConfig>,
    file_config: Option<&FileConfig>,
    endpoints: &Endpoints,
    credentials: &Credentials,
    timeouts: HttpTimeouts,
) -> Result<Pipeline> {
    let sink_token = credentials.require_sink_token()?;

    let source = HttpSource::new(&endpoints.source, credentials.source_token.clone(), timeouts)
        .context("Failed to create content source")?;
    let sink = HttpResumableSink::new(
        SinkSettings {
            endpoint: endpoints.sink.clone(),
            token: sink_token.clone(),
            privacy_status: config.privacy_status.clone(),
            category_id: config.category_id.clone(),
            quota_signatures: config.quota_signatures.clone(),
        },
        timeouts,
    )
    .context("Failed to create upload sink")?;

    let primary = config_runtime::resolve_analyzer(
        mediarelay_core::Stage::Primary,
        file_config.map(|c| &c.primary),
        credentials.primary_api_key.clone(),
    )
    .map(|settings| analyzer_stage(settings, &config))
    .transpose()?;
    let secondary = config_runtime::resolve_analyzer(
        mediarelay_core::Stage::Secondary,
        file_config.map(|c| &c.secondary),
        credentials.secondary_api_key.clone(),
    )
    .map(|settings| analyzer_stage(settings, &config))
    .transpose()?;
    if primary.is_none() && secondary.is_none() {
        info!("No analyzers configured; metadata comes from the local heuristic");
    }
    let chain = EnrichmentChain::new(config.enrichment_rules(), primary, secondary);

    let mut post_steps: Vec<Arc<dyn PostStep>> = Vec::new();
    if !config.playlists.is_empty() {
        let step = PlaylistInsert::new(
            &endpoints.sink,
            sink_token.clone(),
            config.playlists.clone(),
            timeouts,
        )
        .context("Failed to create playlist step")?;
        post_steps.push(Arc::new(step));
    }
    if let Some(image) = file_config.and_then(|c| c.thumbnail_path.clone()) {
        let step = ThumbnailSet::new(&endpoints.sink, sink_token, image, timeouts)
            .context("Failed to create thumbnail step")?;
        post_steps.push(Arc::new(step));
    }

    let pipeline = Pipeline::new(config, Arc::new(source), chain, Arc::new(sink))
        .context("Invalid pipeline configuration")?
        .with_post_steps(post_steps);
    Ok(pipeline)
}

fn analyzer_stage(settings: AnalyzerSettings, config: &PipelineConfig) -> Result<AnalyzerStage> {
    if settings.api_key.is_none() {
        warn!(stage = %settings.stage, "Analyzer has no API key; it will abstain");
    }
    let analyzer = HttpAnalyzer::new(
        settings.stage.to_string(),
        settings.dialect,
        settings.endpoint,
        settings.model,
        settings.api_key,
        config.analyzer_timeout,
    )
    .with_context(|| format!("Failed to create {} analyzer", settings.stage))?;
    Ok(AnalyzerStage::new(
        settings.stage,
        Arc::new(analyzer),
        config.analyzer_retry.policy(),
    ))
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling the batch");
            cancel.cancel();
        }
    });
}

fn print_report(report: &BatchReport, json: bool) -> Result<()> {
    let mut stdout = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, report).context("Failed to encode report")?;
        writeln!(stdout)?;
        return Ok(());
    }

    for result in &report.results {
        let line = match &result.outcome {
            Outcome::Success { remote_id } => format!("ok       {} -> {remote_id}", result.item_id),
            Outcome::Skipped { reason } => format!("skipped  {} ({reason})", result.item_id),
            Outcome::Failed { kind, message } => {
                format!("failed   {} [{kind}] {message}", result.item_id)
            }
            Outcome::QuotaExhausted { reason } => {
                format!("quota    {} ({reason})", result.item_id)
            }
        };
        writeln!(stdout, "{line}")?;
    }
    writeln!(
        stdout,
        "{} succeeded, {} skipped, {} failed{}",
        report.succeeded(),
        report.skipped(),
        report.failed(),
        if report.aborted_early {
            "; stopped early on quota"
        } else {
            ""
        }
    )?;
    Ok(())
}
