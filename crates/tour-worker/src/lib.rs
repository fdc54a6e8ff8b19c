// SPDX-License-Identifier: MIT OR Apache-2.0
//! The conversion worker: pulls jobs from the queue, runs the conversion
//! service, feeds outcomes back into the retry policy and circuit breaker,
//! and evaluates every passing QA report against the asset's baseline.
//!
//! Up to `concurrency` jobs run in parallel; dequeues are gated by the
//! queue's rate limiter.  Shutdown is graceful: workers stop taking new
//! jobs, in-flight jobs drain within a deadline, and anything still running
//! after the deadline is aborted.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tour_queue::{BackpressureStatus, DequeuedJob, QueueStats, TourQueue};
use tour_regression::RegressionChecker;
use tour_service::ConversionService;
use tracing::{info, warn};

fn default_concurrency() -> usize {
    2
}
fn default_drain_deadline_ms() -> u64 {
    10_000
}

/// Worker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs processed in parallel by this worker instance.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long `stop` waits for in-flight jobs before aborting them.
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            drain_deadline_ms: default_drain_deadline_ms(),
        }
    }
}

/// The wired pipeline: every collaborator a worker needs, passed explicitly.
#[derive(Clone)]
pub struct Pipeline {
    /// The job queue.
    pub queue: Arc<TourQueue>,
    /// The conversion orchestrator.
    pub service: Arc<ConversionService>,
    /// Baseline comparison for passing conversions.
    pub regression: Arc<RegressionChecker>,
}

impl Pipeline {
    /// Bundle the collaborators.
    pub fn new(
        queue: Arc<TourQueue>,
        service: Arc<ConversionService>,
        regression: Arc<RegressionChecker>,
    ) -> Self {
        Self {
            queue,
            service,
            regression,
        }
    }
}

/// A running (or stoppable) worker instance.
pub struct Worker {
    pipeline: Pipeline,
    cfg: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker over the pipeline.  Call [`Worker::start`] to spawn
    /// the processing loops.
    pub fn new(pipeline: Pipeline, cfg: WorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pipeline,
            cfg,
            shutdown_tx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the processing loops.
    pub fn start(&self) {
        let mut handles = self.handles.lock().expect("worker lock poisoned");
        for slot in 0..self.cfg.concurrency.max(1) {
            let pipeline = self.pipeline.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                info!(target: "tour.worker", slot, "worker loop started");
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = pipeline.queue.limiter().acquire() => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    let job = tokio::select! {
                        job = pipeline.queue.next_job() => job,
                        _ = shutdown_rx.changed() => break,
                    };
                    process_job(&pipeline, job).await;
                }
                info!(target: "tour.worker", slot, "worker loop stopped");
            }));
        }
    }

    /// Stop accepting new jobs and drain in-flight ones within the
    /// configured deadline; whatever is still running afterwards is aborted.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("worker lock poisoned");
            guard.drain(..).collect()
        };
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.cfg.drain_deadline_ms);
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!(target: "tour.worker", "drain deadline exceeded; aborting worker task");
                handle.abort();
            }
        }
    }

    /// Queue counts by state.
    pub fn stats(&self) -> QueueStats {
        self.pipeline.queue.stats()
    }

    /// Backpressure gate snapshot.
    pub fn backpressure(&self) -> BackpressureStatus {
        self.pipeline.queue.backpressure_status()
    }
}

/// Run one leased job through the service and route the outcome back into
/// the queue (which feeds the circuit breaker).
async fn process_job(pipeline: &Pipeline, job: DequeuedJob) {
    let queue = &pipeline.queue;
    queue.update_progress(&job.job_id, 10);

    let result = pipeline.service.convert(&job.job).await;

    if result.ok {
        queue.update_progress(&job.job_id, 100);
        if let Some(report) = &result.qa {
            let check = pipeline.regression.check(
                job.job.asset_id,
                report,
                &result.converter_version,
                None,
            );
            if check.regression_detected {
                warn!(
                    target: "tour.worker",
                    asset_id = %job.job.asset_id,
                    severity = ?check.severity,
                    recommendation = %check.recommendation,
                    "quality regression detected against baseline"
                );
            }
        }
        queue.complete_ok(&job.job_id, result);
        return;
    }

    let retryable = result.error.as_ref().is_some_and(|e| e.retryable);
    if retryable {
        let message = result
            .error
            .as_ref()
            .map(|e| format!("[{}] {}", e.code, e.message))
            .unwrap_or_else(|| "conversion failed".to_string());
        queue.fail_retryable(&job.job_id, &message);
    } else {
        queue.complete_failed(&job.job_id, result);
    }
}
