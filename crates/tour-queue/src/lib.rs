// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable job queue for tour conversions.
//!
//! Submissions are deduplicated on their job id, gated by backpressure (a
//! bounded pending count plus the [`CircuitBreaker`]), scheduled by priority
//! with FIFO ordering inside a priority level, retried with exponential
//! backoff up to a configured attempt budget, and finally retained in
//! bounded completed/failed windows (the failed window doubles as the
//! dead-letter queue).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod breaker;
pub mod ratelimit;

pub use breaker::{BreakerState, CircuitBreaker};
pub use ratelimit::RateLimiter;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tour_core::{AssetId, ConversionJob, ConversionResult};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_max_pending_jobs() -> usize {
    100
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_completed_retention() -> usize {
    100
}
fn default_failed_retention() -> usize {
    500
}
fn default_rate_max_jobs() -> u32 {
    10
}
fn default_rate_window_ms() -> u64 {
    60_000
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_reset_ms() -> u64 {
    60_000
}

/// Queue tuning.  These are operational parameters, not core algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Reject submissions once `waiting + active` reaches this bound.
    #[serde(default = "default_max_pending_jobs")]
    pub max_pending_jobs: usize,
    /// Attempts before a job dead-letters.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base retry delay; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Completed jobs kept for inspection.
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,
    /// Failed jobs kept in the dead-letter window.
    #[serde(default = "default_failed_retention")]
    pub failed_retention: usize,
    /// Token-bucket capacity per rate window.
    #[serde(default = "default_rate_max_jobs")]
    pub rate_max_jobs: u32,
    /// Token-bucket refill window in milliseconds.
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Milliseconds after the last failure before the circuit half-opens.
    #[serde(default = "default_breaker_reset_ms")]
    pub circuit_breaker_reset_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_jobs: default_max_pending_jobs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            completed_retention: default_completed_retention(),
            failed_retention: default_failed_retention(),
            rate_max_jobs: default_rate_max_jobs(),
            rate_window_ms: default_rate_window_ms(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_reset_ms: default_breaker_reset_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Submission types
// ---------------------------------------------------------------------------

/// Priority levels for queued jobs.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    /// Lowest priority.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Elevated priority.
    High,
    /// Highest priority, processed before all others.
    Critical,
}

/// Options accompanying one submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Scheduling priority.
    pub priority: QueuePriority,
    /// Delay before the job becomes runnable.
    pub delay: Option<Duration>,
    /// Explicit job id; defaults to `"tour-" + asset_id` for idempotent
    /// submission.
    pub job_id: Option<String>,
    /// Skip the backpressure gates (operator tooling only).
    pub bypass_backpressure: bool,
}

/// Handle returned for an accepted (or deduplicated) submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// The queue job id.
    pub job_id: String,
    /// The asset the job converts.
    pub asset_id: AssetId,
}

/// Why a submission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// `waiting + active` reached the configured bound.
    QueueFull,
    /// The circuit breaker is open.
    CircuitOpen,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QueueFull => "queue_full",
            Self::CircuitOpen => "circuit_open",
        };
        f.write_str(s)
    }
}

/// A submission rejected before enqueue.  The caller retries with its own
/// policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureRejection {
    /// Machine-readable reason.
    pub reason: RejectReason,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for BackpressureRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submission rejected ({}): {}", self.reason, self.message)
    }
}

impl std::error::Error for BackpressureRejection {}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Runnable, waiting for a worker slot.
    Waiting,
    /// Being processed by a worker.
    Active,
    /// Scheduled for a later attempt (retry backoff or submit delay).
    Delayed,
    /// Finished successfully; retained for inspection.
    Completed,
    /// Terminal failure; retained in the dead-letter window.
    Failed,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    job_id: String,
    job: ConversionJob,
    priority: QueuePriority,
    state: JobState,
    attempts: u32,
    progress: u8,
    seq: u64,
    ready_at: Option<Instant>,
    last_error: Option<String>,
    result: Option<ConversionResult>,
}

/// Read-only snapshot of one queue entry.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// The queue job id.
    pub job_id: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Attempts consumed so far.
    pub attempts: u32,
    /// Worker progress, 0–100.
    pub progress: u8,
    /// Last recorded error message, if any.
    pub last_error: Option<String>,
    /// Terminal result, once the job completed or failed.
    pub result: Option<ConversionResult>,
}

/// A job leased to a worker.
#[derive(Debug, Clone)]
pub struct DequeuedJob {
    /// The queue job id.
    pub job_id: String,
    /// The job descriptor.
    pub job: ConversionJob,
    /// Which attempt this lease is (1-based).
    pub attempt: u32,
}

/// Counts by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Runnable jobs.
    pub waiting: usize,
    /// Jobs currently leased to workers.
    pub active: usize,
    /// Retained successful jobs.
    pub completed: usize,
    /// Retained dead-lettered jobs.
    pub failed: usize,
    /// Jobs waiting on a retry or submit delay.
    pub delayed: usize,
}

/// Snapshot of the backpressure gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureStatus {
    /// Breaker state.
    pub state: BreakerState,
    /// `waiting + active`.
    pub queue_depth: usize,
    /// The configured pending bound.
    pub max_pending_jobs: usize,
    /// `queue_depth / max_pending_jobs`, clamped to 0–100.
    pub utilization_percent: u8,
    /// Whether a submission right now would be admitted.
    pub accepting: bool,
    /// Why submissions are being rejected, when they are.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<RejectReason>,
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: BTreeMap<String, QueueEntry>,
    completed_order: VecDeque<String>,
    failed_order: VecDeque<String>,
    next_seq: u64,
}

/// The conversion job queue.
pub struct TourQueue {
    cfg: QueueConfig,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TourQueue {
    /// Create a queue with the given configuration.
    pub fn new(cfg: QueueConfig) -> Self {
        let breaker = CircuitBreaker::new(
            cfg.circuit_breaker_threshold,
            Duration::from_millis(cfg.circuit_breaker_reset_ms),
        );
        let limiter = RateLimiter::new(
            cfg.rate_max_jobs,
            Duration::from_millis(cfg.rate_window_ms),
        );
        Self {
            cfg,
            breaker,
            limiter,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    /// The queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    /// The circuit breaker fed by job completions.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The throughput rate limiter workers gate dequeues on.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    // -- submission ------------------------------------------------------

    /// Submit a job.
    ///
    /// Idempotent on the job id: re-submitting while the previous submission
    /// is still enqueued or running returns the existing handle without
    /// enqueueing a second job.  Rejected with [`BackpressureRejection`]
    /// when the pending bound is reached or the circuit is open.
    pub fn submit(
        &self,
        job: ConversionJob,
        opts: SubmitOptions,
    ) -> Result<JobHandle, BackpressureRejection> {
        let job_id = opts.job_id.unwrap_or_else(|| job.default_job_id());

        let mut inner = self.inner.lock().expect("queue lock poisoned");

        if let Some(existing) = inner.entries.get(&job_id)
            && matches!(
                existing.state,
                JobState::Waiting | JobState::Active | JobState::Delayed
            )
        {
            debug!(target: "tour.queue", %job_id, "duplicate submission deduplicated");
            return Ok(JobHandle {
                job_id,
                asset_id: existing.job.asset_id,
            });
        }

        if !opts.bypass_backpressure {
            let depth = Self::pending_depth(&inner);
            if depth >= self.cfg.max_pending_jobs {
                return Err(BackpressureRejection {
                    reason: RejectReason::QueueFull,
                    message: format!(
                        "queue is at capacity ({depth}/{} pending jobs)",
                        self.cfg.max_pending_jobs
                    ),
                });
            }
            if !self.breaker.try_admit() {
                return Err(BackpressureRejection {
                    reason: RejectReason::CircuitOpen,
                    message: "circuit breaker is open after repeated conversion failures".into(),
                });
            }
        }

        let asset_id = job.asset_id;
        let (state, ready_at) = match opts.delay {
            Some(delay) => (JobState::Delayed, Some(Instant::now() + delay)),
            None => (JobState::Waiting, None),
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            job_id.clone(),
            QueueEntry {
                job_id: job_id.clone(),
                job,
                priority: opts.priority,
                state,
                attempts: 0,
                progress: 0,
                seq,
                ready_at,
                last_error: None,
                result: None,
            },
        );
        drop(inner);

        info!(target: "tour.queue", %job_id, asset_id = %asset_id, "job enqueued");
        self.notify.notify_one();
        Ok(JobHandle { job_id, asset_id })
    }

    // -- worker side -----------------------------------------------------

    /// Lease the next runnable job, if any.  Highest priority first, FIFO
    /// within a priority level; due delayed jobs are promoted first.
    pub fn try_dequeue(&self) -> Option<DequeuedJob> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Self::promote_due(&mut inner);

        let job_id = inner
            .entries
            .values()
            .filter(|e| e.state == JobState::Waiting)
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|e| e.job_id.clone())?;

        let entry = inner.entries.get_mut(&job_id)?;
        entry.state = JobState::Active;
        entry.attempts += 1;
        entry.progress = 0;
        Some(DequeuedJob {
            job_id: entry.job_id.clone(),
            job: entry.job.clone(),
            attempt: entry.attempts,
        })
    }

    /// Wait for and lease the next runnable job.
    pub async fn next_job(&self) -> DequeuedJob {
        loop {
            if let Some(job) = self.try_dequeue() {
                return job;
            }
            // Wake on submission, or tick to promote due delayed jobs.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Record worker progress (0–100) against an active job.
    pub fn update_progress(&self, job_id: &str, progress: u8) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if let Some(entry) = inner.entries.get_mut(job_id) {
            entry.progress = progress.min(100);
        }
    }

    /// Complete a job whose conversion succeeded.  Records a breaker
    /// success.
    pub fn complete_ok(&self, job_id: &str, result: ConversionResult) {
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        let inner = &mut *guard;
        if let Some(entry) = inner.entries.get_mut(job_id) {
            entry.state = JobState::Completed;
            entry.progress = 100;
            entry.result = Some(result);
            let id = entry.job_id.clone();
            inner.completed_order.push_back(id);
            Self::trim_retention(
                &mut inner.completed_order,
                &mut inner.entries,
                self.cfg.completed_retention,
            );
        }
        drop(guard);
        self.breaker.record_success();
    }

    /// Complete a job with a terminal, non-retryable failure.  The job moves
    /// straight to the dead-letter window and the breaker records a failure.
    pub fn complete_failed(&self, job_id: &str, result: ConversionResult) {
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        let inner = &mut *guard;
        if let Some(entry) = inner.entries.get_mut(job_id) {
            entry.state = JobState::Failed;
            entry.last_error = result.error.as_ref().map(|e| e.message.clone());
            entry.result = Some(result);
            let id = entry.job_id.clone();
            inner.failed_order.push_back(id);
            Self::trim_retention(
                &mut inner.failed_order,
                &mut inner.entries,
                self.cfg.failed_retention,
            );
        }
        drop(guard);
        self.breaker.record_failure();
    }

    /// Record a retryable failure: re-schedules with exponential backoff, or
    /// dead-letters once the attempt budget is exhausted.  Either way the
    /// breaker records a failure.
    pub fn fail_retryable(&self, job_id: &str, error: &str) {
        let mut guard = self.inner.lock().expect("queue lock poisoned");
        let inner = &mut *guard;
        if let Some(entry) = inner.entries.get_mut(job_id) {
            entry.last_error = Some(error.to_string());
            if entry.attempts >= self.cfg.max_attempts {
                warn!(
                    target: "tour.queue",
                    %job_id,
                    attempts = entry.attempts,
                    "attempt budget exhausted; dead-lettering"
                );
                entry.state = JobState::Failed;
                let id = entry.job_id.clone();
                inner.failed_order.push_back(id);
                Self::trim_retention(
                    &mut inner.failed_order,
                    &mut inner.entries,
                    self.cfg.failed_retention,
                );
            } else {
                let backoff = Duration::from_millis(
                    self.cfg.base_delay_ms.saturating_mul(1 << (entry.attempts - 1)),
                );
                debug!(
                    target: "tour.queue",
                    %job_id,
                    attempt = entry.attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "scheduling retry"
                );
                entry.state = JobState::Delayed;
                entry.ready_at = Some(Instant::now() + backoff);
            }
        }
        drop(guard);
        self.breaker.record_failure();
    }

    // -- observation -----------------------------------------------------

    /// Counts by state.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut stats = QueueStats {
            waiting: 0,
            active: 0,
            completed: 0,
            failed: 0,
            delayed: 0,
        };
        for entry in inner.entries.values() {
            match entry.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Delayed => stats.delayed += 1,
            }
        }
        stats
    }

    /// Snapshot of the backpressure gate.
    pub fn backpressure_status(&self) -> BackpressureStatus {
        let depth = {
            let inner = self.inner.lock().expect("queue lock poisoned");
            Self::pending_depth(&inner)
        };
        let state = self.breaker.state();
        let queue_full = depth >= self.cfg.max_pending_jobs;
        let breaker_admits = self.breaker.would_admit();
        let accepting = !queue_full && breaker_admits;
        let rejection_reason = if queue_full {
            Some(RejectReason::QueueFull)
        } else if !breaker_admits {
            Some(RejectReason::CircuitOpen)
        } else {
            None
        };
        BackpressureStatus {
            state,
            queue_depth: depth,
            max_pending_jobs: self.cfg.max_pending_jobs,
            utilization_percent: ((depth * 100) / self.cfg.max_pending_jobs.max(1)).min(100) as u8,
            accepting,
            rejection_reason,
        }
    }

    /// Snapshot of one entry, if still retained.
    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.entries.get(job_id).map(|e| JobSnapshot {
            job_id: e.job_id.clone(),
            state: e.state,
            attempts: e.attempts,
            progress: e.progress,
            last_error: e.last_error.clone(),
            result: e.result.clone(),
        })
    }

    // -- internals -------------------------------------------------------

    fn pending_depth(inner: &QueueInner) -> usize {
        inner
            .entries
            .values()
            .filter(|e| matches!(e.state, JobState::Waiting | JobState::Active))
            .count()
    }

    fn promote_due(inner: &mut QueueInner) {
        let now = Instant::now();
        for entry in inner.entries.values_mut() {
            if entry.state == JobState::Delayed
                && entry.ready_at.is_none_or(|at| at <= now)
            {
                entry.state = JobState::Waiting;
                entry.ready_at = None;
            }
        }
    }

    fn trim_retention(
        order: &mut VecDeque<String>,
        entries: &mut BTreeMap<String, QueueEntry>,
        retention: usize,
    ) {
        while order.len() > retention {
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tour_core::BlobKey;

    fn job(n: u128) -> ConversionJob {
        ConversionJob::new(
            AssetId(uuid::Uuid::from_u128(n)),
            BlobKey::new(format!("tours/NYC/{n}/input.ply")),
            "NYC",
        )
    }

    fn queue() -> TourQueue {
        TourQueue::new(QueueConfig::default())
    }

    fn dummy_result(ok: bool) -> ConversionResult {
        ConversionResult {
            ok,
            source_digest: None,
            source_size: None,
            output_key: None,
            output_digest: None,
            output_size: None,
            converter_version: "test".into(),
            iterations: 1,
            elapsed_ms: 0,
            qa: None,
            error: None,
            provenance: tour_core::RunProvenance {
                qa_mode: tour_core::RenderMode::Mock,
                binary_mode: tour_core::BinaryMode::Local,
                binary_path: "/bin/true".into(),
                environment: "test".into(),
                started_at: chrono::Utc::now(),
                completed_at: chrono::Utc::now(),
            },
        }
    }

    #[test]
    fn submit_and_dequeue_roundtrip() {
        let q = queue();
        let handle = q.submit(job(1), SubmitOptions::default()).unwrap();
        assert_eq!(handle.job_id, "tour-00000000-0000-0000-0000-000000000001");

        let leased = q.try_dequeue().unwrap();
        assert_eq!(leased.job_id, handle.job_id);
        assert_eq!(leased.attempt, 1);
        assert_eq!(q.stats().active, 1);
    }

    #[test]
    fn duplicate_submission_is_idempotent() {
        let q = queue();
        let first = q.submit(job(1), SubmitOptions::default()).unwrap();
        let second = q.submit(job(1), SubmitOptions::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(q.stats().waiting, 1);

        // Still deduplicated while active.
        let _leased = q.try_dequeue().unwrap();
        let third = q.submit(job(1), SubmitOptions::default()).unwrap();
        assert_eq!(first, third);
        assert_eq!(q.stats().waiting, 0);
        assert_eq!(q.stats().active, 1);
    }

    #[test]
    fn completed_job_can_be_resubmitted() {
        let q = queue();
        q.submit(job(1), SubmitOptions::default()).unwrap();
        let leased = q.try_dequeue().unwrap();
        q.complete_ok(&leased.job_id, dummy_result(true));
        assert_eq!(q.stats().completed, 1);

        q.submit(job(1), SubmitOptions::default()).unwrap();
        assert_eq!(q.stats().waiting, 1);
    }

    #[test]
    fn queue_full_rejection() {
        let mut cfg = QueueConfig::default();
        cfg.max_pending_jobs = 2;
        let q = TourQueue::new(cfg);
        q.submit(job(1), SubmitOptions::default()).unwrap();
        q.submit(job(2), SubmitOptions::default()).unwrap();

        let err = q.submit(job(3), SubmitOptions::default()).unwrap_err();
        assert_eq!(err.reason, RejectReason::QueueFull);

        let status = q.backpressure_status();
        assert_eq!(status.queue_depth, 2);
        assert_eq!(status.utilization_percent, 100);
        assert!(!status.accepting);
        assert_eq!(status.rejection_reason, Some(RejectReason::QueueFull));
    }

    #[test]
    fn bypass_skips_the_gates() {
        let mut cfg = QueueConfig::default();
        cfg.max_pending_jobs = 1;
        let q = TourQueue::new(cfg);
        q.submit(job(1), SubmitOptions::default()).unwrap();
        let opts = SubmitOptions {
            bypass_backpressure: true,
            ..Default::default()
        };
        q.submit(job(2), opts).unwrap();
        assert_eq!(q.stats().waiting, 2);
    }

    #[test]
    fn priority_order_then_fifo() {
        let q = queue();
        q.submit(job(1), SubmitOptions::default()).unwrap();
        q.submit(
            job(2),
            SubmitOptions {
                priority: QueuePriority::Critical,
                ..Default::default()
            },
        )
        .unwrap();
        q.submit(job(3), SubmitOptions::default()).unwrap();

        let order: Vec<String> = (0..3).map(|_| q.try_dequeue().unwrap().job_id).collect();
        assert!(order[0].ends_with("2"));
        assert!(order[1].ends_with("1"));
        assert!(order[2].ends_with("3"));
    }

    #[test]
    fn retryable_failure_schedules_backoff() {
        let mut cfg = QueueConfig::default();
        cfg.base_delay_ms = 10_000;
        let q = TourQueue::new(cfg);
        q.submit(job(1), SubmitOptions::default()).unwrap();
        let leased = q.try_dequeue().unwrap();
        q.fail_retryable(&leased.job_id, "blob store hiccup");

        let stats = q.stats();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.failed, 0);
        // Not yet due.
        assert!(q.try_dequeue().is_none());
        let snap = q.get(&leased.job_id).unwrap();
        assert_eq!(snap.attempts, 1);
        assert_eq!(snap.last_error.as_deref(), Some("blob store hiccup"));
    }

    #[tokio::test]
    async fn retry_becomes_due_and_attempts_increment() {
        let mut cfg = QueueConfig::default();
        cfg.base_delay_ms = 10;
        let q = TourQueue::new(cfg);
        q.submit(job(1), SubmitOptions::default()).unwrap();
        let first = q.try_dequeue().unwrap();
        q.fail_retryable(&first.job_id, "transient");

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = q.try_dequeue().unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.attempt, 2);
    }

    #[test]
    fn dead_letter_after_attempt_budget() {
        let mut cfg = QueueConfig::default();
        cfg.max_attempts = 1;
        let q = TourQueue::new(cfg);
        q.submit(job(1), SubmitOptions::default()).unwrap();
        let leased = q.try_dequeue().unwrap();
        q.fail_retryable(&leased.job_id, "still broken");

        let stats = q.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delayed, 0);
        assert_eq!(q.get(&leased.job_id).unwrap().state, JobState::Failed);
    }

    #[test]
    fn non_retryable_failure_dead_letters_after_one_attempt() {
        let q = queue();
        q.submit(job(1), SubmitOptions::default()).unwrap();
        let leased = q.try_dequeue().unwrap();
        q.complete_failed(&leased.job_id, dummy_result(false));

        let snap = q.get(&leased.job_id).unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.attempts, 1);
        assert_eq!(q.breaker().consecutive_failures(), 1);
    }

    #[test]
    fn breaker_opens_and_rejects_submissions() {
        let mut cfg = QueueConfig::default();
        cfg.circuit_breaker_threshold = 3;
        let q = TourQueue::new(cfg);

        for n in 1..=3 {
            q.submit(job(n), SubmitOptions::default()).unwrap();
            let leased = q.try_dequeue().unwrap();
            q.complete_failed(&leased.job_id, dummy_result(false));
        }
        assert_eq!(q.breaker().state(), BreakerState::Open);

        let err = q.submit(job(4), SubmitOptions::default()).unwrap_err();
        assert_eq!(err.reason, RejectReason::CircuitOpen);

        let status = q.backpressure_status();
        assert_eq!(status.state, BreakerState::Open);
        assert!(!status.accepting);
        assert_eq!(status.rejection_reason, Some(RejectReason::CircuitOpen));
    }

    #[tokio::test]
    async fn breaker_half_open_trial_then_close() {
        let mut cfg = QueueConfig::default();
        cfg.circuit_breaker_threshold = 1;
        cfg.circuit_breaker_reset_ms = 20;
        let q = TourQueue::new(cfg);

        q.submit(job(1), SubmitOptions::default()).unwrap();
        let leased = q.try_dequeue().unwrap();
        q.complete_failed(&leased.job_id, dummy_result(false));
        assert_eq!(q.breaker().state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(q.breaker().state(), BreakerState::HalfOpen);

        // Trial submission admitted.
        q.submit(job(2), SubmitOptions::default()).unwrap();
        // A second submission while the trial is pending is rejected.
        let err = q.submit(job(3), SubmitOptions::default()).unwrap_err();
        assert_eq!(err.reason, RejectReason::CircuitOpen);

        let leased = q.try_dequeue().unwrap();
        q.complete_ok(&leased.job_id, dummy_result(true));
        assert_eq!(q.breaker().state(), BreakerState::Closed);
        q.submit(job(3), SubmitOptions::default()).unwrap();
    }

    #[test]
    fn completed_retention_window_trims() {
        let mut cfg = QueueConfig::default();
        cfg.completed_retention = 2;
        let q = TourQueue::new(cfg);
        for n in 1..=4 {
            q.submit(job(n), SubmitOptions::default()).unwrap();
            let leased = q.try_dequeue().unwrap();
            q.complete_ok(&leased.job_id, dummy_result(true));
        }
        assert_eq!(q.stats().completed, 2);
        // Oldest entries were evicted entirely.
        assert!(q.get("tour-00000000-0000-0000-0000-000000000001").is_none());
        assert!(q.get("tour-00000000-0000-0000-0000-000000000004").is_some());
    }

    #[test]
    fn delayed_submission_not_immediately_runnable() {
        let q = queue();
        q.submit(
            job(1),
            SubmitOptions {
                delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(q.stats().delayed, 1);
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn progress_is_clamped() {
        let q = queue();
        q.submit(job(1), SubmitOptions::default()).unwrap();
        let leased = q.try_dequeue().unwrap();
        q.update_progress(&leased.job_id, 150);
        assert_eq!(q.get(&leased.job_id).unwrap().progress, 100);
    }

    #[tokio::test]
    async fn next_job_wakes_on_submission() {
        let q = std::sync::Arc::new(queue());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.next_job().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.submit(job(1), SubmitOptions::default()).unwrap();
        let leased = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.attempt, 1);
    }
}
