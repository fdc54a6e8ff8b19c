// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, environment overlay, and validation for the tour
//! pipeline.
//!
//! Settings come from an optional TOML file overlaid with `TOUR_`-prefixed
//! environment variables.  [`PipelineConfig::validate`] separates hard
//! errors (out-of-range values that would misbehave at runtime) from
//! advisory [`ConfigWarning`]s.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tour_queue::QueueConfig;
use tour_regression::RegressionLimits;
use tour_worker::WorkerConfig;

// ---------------------------------------------------------------------------
// Errors & warnings
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation but deserve
/// attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The retry budget is unusually large.
    LargeAttemptBudget {
        /// Configured attempts.
        attempts: u32,
    },
    /// The worker runs more jobs than the queue admits per rate window.
    ConcurrencyExceedsRate {
        /// Worker concurrency.
        concurrency: usize,
        /// Rate-limit cap per window.
        rate_max_jobs: u32,
    },
    /// The work root is a relative path; conversions depend on the launch
    /// directory.
    RelativeWorkRoot {
        /// The configured path.
        path: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeAttemptBudget { attempts } => {
                write!(f, "max_attempts={attempts} is unusually large for deterministic conversions")
            }
            ConfigWarning::ConcurrencyExceedsRate {
                concurrency,
                rate_max_jobs,
            } => write!(
                f,
                "worker concurrency ({concurrency}) exceeds the rate-limit cap ({rate_max_jobs}/window)"
            ),
            ConfigWarning::RelativeWorkRoot { path } => {
                write!(f, "work_root '{path}' is relative to the launch directory")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn default_work_root() -> PathBuf {
    PathBuf::from(".tour-pipeline/work")
}

fn default_blob_root() -> PathBuf {
    PathBuf::from(".tour-pipeline/blobs")
}

fn default_environment() -> String {
    "development".to_string()
}

/// Top-level runtime configuration for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Scratch directory for per-job working copies.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    /// Root of the filesystem blob store.
    #[serde(default = "default_blob_root")]
    pub blob_root: PathBuf,

    /// Deployment environment label recorded in run provenance.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Converter version string, when pinned by the deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter_version: Option<String>,

    /// Baseline bundle loaded at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_file: Option<PathBuf>,

    /// Append-only provenance ledger file.  Defaults to
    /// `<work_root>/provenance.jsonl`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance_file: Option<PathBuf>,

    /// Queue tuning.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker tuning.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Regression drift tolerances.
    #[serde(default)]
    pub regression: RegressionLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            blob_root: default_blob_root(),
            environment: default_environment(),
            converter_version: None,
            baseline_file: None,
            provenance_file: None,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            regression: RegressionLimits::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Overlay `TOUR_`-prefixed environment variables onto this config.
    ///
    /// Recognised: `TOUR_WORK_ROOT`, `TOUR_BLOB_ROOT`, `TOUR_ENVIRONMENT`,
    /// `TOUR_CONVERTER_VERSION`, `TOUR_BASELINE_FILE`,
    /// `TOUR_WORKER_CONCURRENCY`, `TOUR_MAX_PENDING_JOBS`.
    pub fn overlay_env(mut self) -> Self {
        if let Ok(v) = std::env::var("TOUR_WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TOUR_BLOB_ROOT") {
            self.blob_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TOUR_ENVIRONMENT") {
            self.environment = v;
        }
        if let Ok(v) = std::env::var("TOUR_CONVERTER_VERSION") {
            self.converter_version = Some(v);
        }
        if let Ok(v) = std::env::var("TOUR_BASELINE_FILE") {
            self.baseline_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("TOUR_WORKER_CONCURRENCY")
            && let Ok(n) = v.parse()
        {
            self.worker.concurrency = n;
        }
        if let Ok(v) = std::env::var("TOUR_MAX_PENDING_JOBS")
            && let Ok(n) = v.parse()
        {
            self.queue.max_pending_jobs = n;
        }
        self
    }

    /// Semantic validation.  Returns advisory warnings on success, a
    /// [`ConfigError::ValidationError`] listing every hard problem on
    /// failure.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if self.worker.concurrency == 0 {
            reasons.push("worker.concurrency must be at least 1".to_string());
        }
        if self.queue.max_pending_jobs == 0 {
            reasons.push("queue.max_pending_jobs must be at least 1".to_string());
        }
        if self.queue.max_attempts == 0 {
            reasons.push("queue.max_attempts must be at least 1".to_string());
        }
        if self.queue.rate_max_jobs == 0 {
            reasons.push("queue.rate_max_jobs must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.regression.min_ssim_threshold) {
            reasons.push(format!(
                "regression.min_ssim_threshold must be in [0, 1], got {}",
                self.regression.min_ssim_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.regression.max_score_drop) {
            reasons.push(format!(
                "regression.max_score_drop must be in [0, 1], got {}",
                self.regression.max_score_drop
            ));
        }

        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        if self.queue.max_attempts > 10 {
            warnings.push(ConfigWarning::LargeAttemptBudget {
                attempts: self.queue.max_attempts,
            });
        }
        if self.worker.concurrency > self.queue.rate_max_jobs as usize {
            warnings.push(ConfigWarning::ConcurrencyExceedsRate {
                concurrency: self.worker.concurrency,
                rate_max_jobs: self.queue.rate_max_jobs,
            });
        }
        if self.work_root.is_relative() {
            warnings.push(ConfigWarning::RelativeWorkRoot {
                path: self.work_root.display().to_string(),
            });
        }

        Ok(warnings)
    }
}
