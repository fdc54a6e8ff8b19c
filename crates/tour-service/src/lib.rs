// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end orchestration of one conversion job.
//!
//! The per-job state machine is strictly sequential: stage the source, hash
//! it, convert, hash the output, run QA, publish, clean up.  Every step wraps
//! its native failure into the pipeline taxonomy, and the returned
//! [`ConversionResult`] always carries whatever measurements completed before
//! a failure.  Provenance records are emitted around the steps, best-effort.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tour_blobstore::BlobStore;
use tour_convert::{ConvertRequest, ConverterDriver};
use tour_core::{BlobKey, ConversionJob, ConversionResult, QaReport, RunProvenance};
use tour_digest::FileDigest;
use tour_error::{ErrorKind, ErrorRecord, PipelineError};
use tour_provenance::{Ledger, ProvenanceDetails};
use tour_qa::QaEngine;
use tracing::{info, warn};

/// Orchestrates conversions: owns the blob store, converter driver, QA
/// engine, and provenance ledger (explicit dependency injection; no process
/// globals).
pub struct ConversionService {
    blobs: Arc<dyn BlobStore>,
    converter: Arc<ConverterDriver>,
    qa: Arc<QaEngine>,
    ledger: Ledger,
    work_root: PathBuf,
    environment: String,
}

/// Measurements accumulated as the steps run; whatever is present when a
/// step fails still reaches the result.
#[derive(Default)]
struct RunState {
    source: Option<FileDigest>,
    output: Option<FileDigest>,
    output_key: Option<BlobKey>,
    qa: Option<QaReport>,
}

impl ConversionService {
    /// Build a service.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        converter: Arc<ConverterDriver>,
        qa: Arc<QaEngine>,
        ledger: Ledger,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            blobs,
            converter,
            qa,
            ledger,
            work_root: work_root.into(),
            environment: "development".to_string(),
        }
    }

    /// Set the deployment environment label recorded in run provenance.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// The converter driver (resolution is recorded in every result).
    pub fn converter(&self) -> &ConverterDriver {
        &self.converter
    }

    /// Run one job end-to-end.  Never panics on expected failure paths; the
    /// outcome (including the error taxonomy) lives in the result.
    pub async fn convert(&self, job: &ConversionJob) -> ConversionResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let work_dir = self.work_root.join(job.asset_id.to_string());

        let mut state = RunState::default();
        let error = self.run_steps(job, &work_dir, &mut state).await.err();

        // Best-effort cleanup on success and failure alike.
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                target: "tour.service",
                work_dir = %work_dir.display(),
                error = %e,
                "working directory cleanup failed"
            );
        }

        let resolution = self.converter.resolution();
        let result = ConversionResult {
            ok: error.is_none(),
            source_digest: state.source.as_ref().map(|d| d.hex.clone()),
            source_size: state.source.as_ref().map(|d| d.size),
            output_key: state.output_key,
            output_digest: state.output.as_ref().map(|d| d.hex.clone()),
            output_size: state.output.as_ref().map(|d| d.size),
            converter_version: self.converter.version().to_string(),
            iterations: job.iterations,
            elapsed_ms: started.elapsed().as_millis() as u64,
            qa: state.qa,
            error: error.as_ref().map(ErrorRecord::from),
            provenance: RunProvenance {
                qa_mode: self.qa.mode(),
                binary_mode: resolution.mode,
                binary_path: resolution.path.clone(),
                environment: self.environment.clone(),
                started_at,
                completed_at: Utc::now(),
            },
        };

        match &error {
            None => info!(
                target: "tour.service",
                asset_id = %job.asset_id,
                elapsed_ms = result.elapsed_ms,
                score = result.qa.as_ref().map(|q| q.score).unwrap_or_default(),
                "conversion succeeded"
            ),
            Some(e) => warn!(
                target: "tour.service",
                asset_id = %job.asset_id,
                code = e.code,
                retryable = e.retryable(),
                "conversion failed"
            ),
        }
        result
    }

    async fn run_steps(
        &self,
        job: &ConversionJob,
        work_dir: &Path,
        state: &mut RunState,
    ) -> Result<(), PipelineError> {
        // Step 1: per-job working directory.
        tokio::fs::create_dir_all(work_dir).await.map_err(|e| {
            PipelineError::io("WORKDIR_CREATE_FAILED", "could not create working directory")
                .with_source(e)
        })?;

        // Step 2: stage the source.
        let input_path = work_dir.join("input.ply");
        self.blobs.get(&job.source_key, &input_path).await?;

        // Step 3: hash the staged source; the digest anchors the provenance
        // chain.
        let source = tour_digest::digest_file_async(&input_path).await?;
        self.ledger.emit(
            job.asset_id,
            ProvenanceDetails::IntegrityCheck {
                file_type: "source".into(),
                expected: source.hex.clone(),
                actual: Some(source.hex.clone()),
                checksum_match: true,
            },
        );
        state.source = Some(source);

        // Step 4: run the converter.
        let output_path = work_dir.join("output.sog");
        let outcome = self
            .converter
            .run(&ConvertRequest {
                input_path: input_path.clone(),
                output_path: output_path.clone(),
                iterations: job.iterations,
                verbose: false,
            })
            .await?;
        if !outcome.ok {
            return Err(PipelineError::new(
                ErrorKind::ConverterFailed,
                "CONVERT_EXIT_NONZERO",
                format!(
                    "converter exited with status {:?}",
                    outcome.exit_code
                ),
            )
            .with_context("exit_code", outcome.exit_code)
            .with_context("transient", outcome.transient)
            .with_context("stderr", outcome.stderr.trim()));
        }

        // Step 5: hash the output and record the conversion.
        let output = tour_digest::digest_file_async(&output_path).await?;
        self.ledger.emit(
            job.asset_id,
            ProvenanceDetails::IntegrityCheck {
                file_type: "output".into(),
                expected: output.hex.clone(),
                actual: Some(output.hex.clone()),
                checksum_match: true,
            },
        );
        self.ledger.emit(
            job.asset_id,
            ProvenanceDetails::Conversion {
                output_digest: output.hex.clone(),
                output_size: output.size,
                converter_version: self.converter.version().to_string(),
                iterations: job.iterations,
                elapsed_ms: outcome.elapsed.as_millis() as u64,
            },
        );
        state.output = Some(output);

        // Step 6: QA.  A report that "passes" below the job's threshold is
        // still a terminal failure: conversions are deterministic, so a
        // retry would reproduce the same score.
        let report = self.qa.run(&input_path, &output_path).await?;
        let passed = report.passed;
        let score = report.score;
        state.qa = Some(report);
        if !passed || score < job.quality_threshold {
            return Err(PipelineError::new(
                ErrorKind::QaFailed,
                "QA_BELOW_THRESHOLD",
                format!(
                    "QA score {score:.4} (passed={passed}) did not meet threshold {:.4}",
                    job.quality_threshold
                ),
            )
            .with_context("score", score)
            .with_context("threshold", job.quality_threshold));
        }
        if let Some(report) = &state.qa {
            self.ledger.emit(
                job.asset_id,
                ProvenanceDetails::QaPass {
                    score: report.score,
                    frames_rendered: report.metrics.frames_rendered,
                    frames_passed: report.metrics.frames_passed,
                    mode: report.mode,
                },
            );
        }

        // Step 7: publish the output under its deterministic key.  `put` is
        // idempotent, so a retry after a publish failure is safe.
        let output_key = job.output_key();
        self.blobs.put(&output_path, &output_key).await?;
        state.output_key = Some(output_key);

        Ok(())
    }
}
