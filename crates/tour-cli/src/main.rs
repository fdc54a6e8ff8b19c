#![deny(unsafe_code)]
//! `tour-pipeline` — run the conversion worker, submit one-shot jobs, or
//! gate CI on perceptual regression.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tour_blobstore::FsBlobStore;
use tour_config::PipelineConfig;
use tour_convert::ConverterDriver;
use tour_core::{AssetId, BlobKey, ConversionJob};
use tour_provenance::{JsonlSink, Ledger};
use tour_qa::QaEngine;
use tour_queue::{SubmitOptions, TourQueue};
use tour_regression::{ci_exit_code, ci_report, BaselineStore, RegressionChecker};
use tour_render::FrameRenderer;
use tour_service::ConversionService;
use tour_worker::{Pipeline, Worker};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tour-pipeline", version, about = "Tour conversion pipeline")]
struct Args {
    /// Path to a pipeline TOML config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the conversion worker until interrupted.
    Worker,

    /// Submit a single job against a local pipeline and wait for the result.
    Submit {
        /// Asset identifier (UUID).
        #[arg(long)]
        asset_id: AssetId,
        /// Blob key of the uploaded PLY.
        #[arg(long)]
        source_key: String,
        /// Market partition key.
        #[arg(long)]
        market: String,
        /// Converter iterations.
        #[arg(long)]
        iterations: Option<u32>,
        /// Minimum QA score in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Compare a fresh conversion against the asset's quality baseline and
    /// exit non-zero on regression.
    Regress {
        /// Asset identifier (UUID).
        #[arg(long)]
        asset_id: AssetId,
        /// Local path of the source scene.
        #[arg(long)]
        source: PathBuf,
        /// Local path of the converted scene.
        #[arg(long)]
        output: PathBuf,
        /// Converter version under test.
        #[arg(long)]
        converter_version: String,
        /// Baseline bundle (JSON array); defaults to the configured bundle.
        #[arg(long)]
        baseline_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("tour=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tour=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => PipelineConfig::default(),
    }
    .overlay_env();

    let warnings = config.validate().context("validate config")?;
    for warning in &warnings {
        warn!(target: "tour.cli", "{warning}");
    }

    match args.command {
        Command::Worker => run_worker(config).await,
        Command::Submit {
            asset_id,
            source_key,
            market,
            iterations,
            threshold,
        } => {
            let mut job = ConversionJob::new(asset_id, BlobKey::new(source_key), market);
            if let Some(iterations) = iterations {
                job.iterations = iterations;
            }
            if let Some(threshold) = threshold {
                job.quality_threshold = threshold;
            }
            run_submit(config, job).await
        }
        Command::Regress {
            asset_id,
            source,
            output,
            converter_version,
            baseline_file,
        } => run_regress(config, asset_id, source, output, converter_version, baseline_file).await,
    }
}

/// Wire the full pipeline from config.
fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    std::fs::create_dir_all(&config.work_root)
        .with_context(|| format!("create work root {}", config.work_root.display()))?;

    let ledger_path = config
        .provenance_file
        .clone()
        .unwrap_or_else(|| config.work_root.join("provenance.jsonl"));
    let ledger = Ledger::new(Arc::new(
        JsonlSink::open(&ledger_path)
            .with_context(|| format!("open provenance ledger {}", ledger_path.display()))?,
    ));

    let mut converter = ConverterDriver::new();
    if let Some(version) = &config.converter_version {
        converter = converter.with_version(version.clone());
    }

    let mode = tour_render::mode_from_env();
    let qa = QaEngine::new(tour_render::build_renderer(mode), mode);

    let service = ConversionService::new(
        Arc::new(FsBlobStore::new(&config.blob_root)),
        Arc::new(converter),
        Arc::new(qa),
        ledger,
        &config.work_root,
    )
    .with_environment(config.environment.clone());

    let store = match &config.baseline_file {
        Some(path) => BaselineStore::load_bundle(path)
            .with_context(|| format!("load baselines {}", path.display()))?,
        None => BaselineStore::new(),
    };

    Ok(Pipeline::new(
        Arc::new(TourQueue::new(config.queue.clone())),
        Arc::new(service),
        Arc::new(RegressionChecker::new(store, config.regression)),
    ))
}

async fn run_worker(config: PipelineConfig) -> Result<()> {
    let pipeline = build_pipeline(&config)?;
    let worker = Worker::new(pipeline, config.worker.clone());
    worker.start();
    info!(
        target: "tour.cli",
        concurrency = config.worker.concurrency,
        environment = %config.environment,
        "worker running; press ctrl-c to stop"
    );

    wait_for_shutdown_signal().await;
    info!(target: "tour.cli", "shutdown signal received; draining");
    worker.stop().await;

    let stats = worker.stats();
    info!(
        target: "tour.cli",
        waiting = stats.waiting,
        active = stats.active,
        completed = stats.completed,
        failed = stats.failed,
        delayed = stats.delayed,
        "worker stopped"
    );
    Ok(())
}

async fn run_submit(config: PipelineConfig, job: ConversionJob) -> Result<()> {
    let pipeline = build_pipeline(&config)?;
    let queue = pipeline.queue.clone();
    let worker = Worker::new(pipeline, config.worker.clone());
    worker.start();

    let handle = queue
        .submit(job, SubmitOptions::default())
        .map_err(|rejection| anyhow::anyhow!("{rejection}"))?;
    info!(target: "tour.cli", job_id = %handle.job_id, "job submitted; waiting");

    let result = loop {
        if let Some(snapshot) = queue.get(&handle.job_id)
            && let Some(result) = snapshot.result
        {
            break result;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    worker.stop().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.ok {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_regress(
    config: PipelineConfig,
    asset_id: AssetId,
    source: PathBuf,
    output: PathBuf,
    converter_version: String,
    baseline_file: Option<PathBuf>,
) -> Result<()> {
    let mode = tour_render::mode_from_env();
    let renderer = tour_render::build_renderer(mode);
    let qa = QaEngine::new(renderer.clone(), mode);
    let report = qa
        .run(&source, &output)
        .await
        .map_err(|e| anyhow::anyhow!("QA run failed: {e}"))?;

    // True perceptual hash of the converted scene's first canonical frame.
    let current_phash = renderer
        .render(&output, &tour_core::contract::CANONICAL_CAMERA_PATH[0], 0)
        .ok()
        .map(|frame| tour_image::phash::phash(&frame));

    let bundle = baseline_file.or(config.baseline_file);
    let store = match bundle {
        Some(path) => BaselineStore::load_bundle(&path)
            .with_context(|| format!("load baselines {}", path.display()))?,
        None => BaselineStore::new(),
    };
    let checker = RegressionChecker::new(store, config.regression);
    let check = checker.check(asset_id, &report, &converter_version, current_phash.as_deref());

    print!("{}", ci_report(&check));
    std::process::exit(ci_exit_code(&check));
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
