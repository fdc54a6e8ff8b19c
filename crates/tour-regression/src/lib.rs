// SPDX-License-Identifier: MIT OR Apache-2.0
//! Quality baselines and regression classification.
//!
//! Each converted asset can pin a [`QualityBaseline`]: the QA score and
//! perceptual hash its accepted conversion produced.  After converter or
//! parameter changes, [`RegressionChecker::check`] compares a fresh QA report
//! against that baseline across three axes — score drop, perceptual-hash
//! drift, and an absolute floor — and classifies the severity of any drift.
//! The CI entry point renders the verdict as a fixed key/value block and an
//! exit code.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;
use tour_core::{AssetId, QaReport};
use tour_image::phash::phash_distance;
use tracing::info;

// ---------------------------------------------------------------------------
// Baselines
// ---------------------------------------------------------------------------

/// The pinned quality reference for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityBaseline {
    /// The asset this baseline belongs to.
    pub asset_id: AssetId,
    /// SHA-256 of the source the baseline was recorded against.
    pub source_digest: String,
    /// SHA-256 of the accepted converted output.
    pub output_digest: String,
    /// Converter version that produced the accepted output.
    pub converter_version: String,
    /// Aggregate QA score of the accepted conversion.
    pub qa_score: f64,
    /// Perceptual hash pinned for drift detection.
    pub phash_baseline: String,
    /// Per-frame SSIM floor observed at recording time.
    pub ssim_baseline: f64,
    /// When the baseline was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Errors from baseline-bundle loading.
#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    /// The bundle file could not be read.
    #[error("failed to read baseline bundle {path}: {source}")]
    Read {
        /// Path that was requested.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The bundle file is not a valid JSON array of baselines.
    #[error("failed to parse baseline bundle {path}: {source}")]
    Parse {
        /// Path that was requested.
        path: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// In-memory baseline map, loadable from a JSON bundle.
///
/// Loaded once at startup and immutable in normal operation; a reload swaps
/// the whole map under the write lock.
#[derive(Debug, Default)]
pub struct BaselineStore {
    baselines: RwLock<BTreeMap<AssetId, QualityBaseline>>,
}

impl BaselineStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a JSON bundle (an array of baselines).
    pub fn load_bundle(path: impl AsRef<Path>) -> Result<Self, BaselineError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| BaselineError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let list: Vec<QualityBaseline> =
            serde_json::from_str(&contents).map_err(|source| BaselineError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let store = Self::new();
        store.replace_all(list);
        Ok(store)
    }

    /// Replace the entire map (used at startup and on reload).
    pub fn replace_all(&self, list: Vec<QualityBaseline>) {
        let mut map = self.baselines.write().expect("baseline lock poisoned");
        map.clear();
        for baseline in list {
            map.insert(baseline.asset_id, baseline);
        }
        info!(target: "tour.regression", count = map.len(), "baselines loaded");
    }

    /// Insert or update a single baseline.
    pub fn register(&self, baseline: QualityBaseline) {
        let mut map = self.baselines.write().expect("baseline lock poisoned");
        map.insert(baseline.asset_id, baseline);
    }

    /// Fetch the baseline for an asset, if one is pinned.
    pub fn get(&self, asset_id: AssetId) -> Option<QualityBaseline> {
        let map = self.baselines.read().expect("baseline lock poisoned");
        map.get(&asset_id).cloned()
    }

    /// Number of pinned baselines.
    pub fn len(&self) -> usize {
        self.baselines.read().expect("baseline lock poisoned").len()
    }

    /// Whether no baselines are pinned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Regression check
// ---------------------------------------------------------------------------

fn default_max_score_drop() -> f64 {
    0.05
}
fn default_max_phash_drift() -> u32 {
    5
}
fn default_min_ssim_threshold() -> f64 {
    0.85
}

/// Drift tolerances.  These are operational limits, unlike the frozen QA
/// thresholds in the contract module.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionLimits {
    /// Maximum tolerated score drop below baseline.
    #[serde(default = "default_max_score_drop")]
    pub max_score_drop: f64,
    /// Maximum tolerated perceptual-hash drift from baseline.
    #[serde(default = "default_max_phash_drift")]
    pub max_phash_drift: u32,
    /// Absolute score floor regardless of baseline.
    #[serde(default = "default_min_ssim_threshold")]
    pub min_ssim_threshold: f64,
}

impl Default for RegressionLimits {
    fn default() -> Self {
        Self {
            max_score_drop: default_max_score_drop(),
            max_phash_drift: default_max_phash_drift(),
            min_ssim_threshold: default_min_ssim_threshold(),
        }
    }
}

/// Severity ladder for detected regressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Drift within comfortable margins.
    Minor,
    /// Noticeable drift; investigate before shipping.
    Moderate,
    /// Quality floor breached or a large score collapse.
    Severe,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
        };
        f.write_str(s)
    }
}

/// Outcome of comparing a QA report against an asset's baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionCheck {
    /// The asset that was checked.
    pub asset_id: AssetId,
    /// Whether a baseline was pinned for the asset.
    pub baseline_found: bool,
    /// Aggregate score of the current report.
    pub current_score: f64,
    /// `current - baseline` score delta, when a baseline exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_delta: Option<f64>,
    /// Perceptual-hash distance from baseline, when computable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phash_distance: Option<u32>,
    /// Score dropped more than the tolerated amount.
    pub score_regression: bool,
    /// Perceptual hash drifted beyond the tolerated distance.
    pub phash_regression: bool,
    /// Score fell below the absolute floor.
    pub below_floor: bool,
    /// Converter version differs from the baseline's.
    pub converter_version_changed: bool,
    /// Any regression axis fired.
    pub regression_detected: bool,
    /// Severity, when a regression was detected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Human guidance, highest-priority cause first.
    pub recommendation: String,
}

/// Compares QA reports against pinned baselines.
pub struct RegressionChecker {
    store: BaselineStore,
    limits: RegressionLimits,
}

impl RegressionChecker {
    /// Create a checker over the given store with the given limits.
    pub fn new(store: BaselineStore, limits: RegressionLimits) -> Self {
        Self { store, limits }
    }

    /// The underlying baseline store.
    pub fn store(&self) -> &BaselineStore {
        &self.store
    }

    /// The configured limits.
    pub fn limits(&self) -> RegressionLimits {
        self.limits
    }

    /// Compare `report` against the asset's baseline.
    ///
    /// `current_phash` should be the perceptual hash of the converted
    /// asset's frame 0.  When absent, a legacy signal derived from the
    /// frame-0 SSIM keeps old baselines comparable; the recommendation calls
    /// out the weak signal.
    pub fn check(
        &self,
        asset_id: AssetId,
        report: &QaReport,
        converter_version: &str,
        current_phash: Option<&str>,
    ) -> RegressionCheck {
        let Some(baseline) = self.store.get(asset_id) else {
            return self.check_without_baseline(asset_id, report);
        };

        let score_delta = report.score - baseline.qa_score;
        let legacy_phash = legacy_phash_signal(report);
        let (phash_current, phash_is_legacy) = match current_phash {
            Some(h) => (Some(h.to_string()), false),
            None => (legacy_phash, true),
        };

        let phash_distance = phash_current.as_deref().and_then(|current| {
            if current.len() == baseline.phash_baseline.len() {
                Some(hash_distance(current, &baseline.phash_baseline))
            } else {
                None
            }
        });

        let score_regression = score_delta < -self.limits.max_score_drop;
        let phash_regression =
            phash_distance.is_some_and(|d| d > self.limits.max_phash_drift);
        let below_floor = report.score < self.limits.min_ssim_threshold;
        let regression_detected = score_regression || phash_regression || below_floor;
        let converter_version_changed = converter_version != baseline.converter_version;

        let severity = regression_detected.then(|| {
            if below_floor || score_delta < -0.15 {
                Severity::Severe
            } else if score_delta < -0.10 || phash_distance.is_some_and(|d| d > 8) {
                Severity::Moderate
            } else {
                Severity::Minor
            }
        });

        let recommendation = build_recommendation(
            converter_version_changed,
            phash_regression,
            score_regression,
            below_floor,
            phash_is_legacy,
        );

        RegressionCheck {
            asset_id,
            baseline_found: true,
            current_score: report.score,
            score_delta: Some(score_delta),
            phash_distance,
            score_regression,
            phash_regression,
            below_floor,
            converter_version_changed,
            regression_detected,
            severity,
            recommendation,
        }
    }

    fn check_without_baseline(&self, asset_id: AssetId, report: &QaReport) -> RegressionCheck {
        let below_floor = report.score < self.limits.min_ssim_threshold;
        RegressionCheck {
            asset_id,
            baseline_found: false,
            current_score: report.score,
            score_delta: None,
            phash_distance: None,
            score_regression: false,
            phash_regression: false,
            below_floor,
            converter_version_changed: false,
            regression_detected: below_floor,
            severity: below_floor.then_some(Severity::Severe),
            recommendation: if below_floor {
                "score is below the absolute floor; fix quality before registering a baseline"
                    .to_string()
            } else {
                "no baseline pinned for this asset; register one from this report".to_string()
            },
        }
    }
}

/// Legacy drift signal: the frame-0 SSIM, stringified.  Kept for
/// compatibility with baselines recorded before real perceptual hashes were
/// plumbed through.
fn legacy_phash_signal(report: &QaReport) -> Option<String> {
    report.frames.first().map(|f| format!("{:.4}", f.ssim))
}

/// Distance between two hash strings: bit-level Hamming for valid
/// equal-length hex, otherwise a character-level count for legacy signals.
fn hash_distance(a: &str, b: &str) -> u32 {
    match phash_distance(a, b) {
        Ok(d) => d,
        Err(_) => a
            .chars()
            .zip(b.chars())
            .filter(|(ca, cb)| ca != cb)
            .count() as u32,
    }
}

fn build_recommendation(
    version_changed: bool,
    phash_regression: bool,
    score_regression: bool,
    below_floor: bool,
    phash_is_legacy: bool,
) -> String {
    let mut parts = Vec::new();
    if version_changed {
        parts.push("converter version changed since the baseline; re-validate and re-pin");
    }
    if phash_regression {
        parts.push("perceptual hash drifted beyond tolerance; inspect rendered frames");
    }
    if score_regression {
        parts.push("QA score dropped beyond tolerance; compare against the baseline build");
    }
    if below_floor {
        parts.push("score is below the absolute quality floor");
    }
    if parts.is_empty() {
        parts.push("within tolerance of the pinned baseline");
    }
    let mut text = parts.join("; ");
    if phash_is_legacy {
        text.push_str(" (drift measured via the legacy frame-0 signal)");
    }
    text
}

// ---------------------------------------------------------------------------
// CI entry point
// ---------------------------------------------------------------------------

/// Render a check as the fixed-format block the CI gate prints.
pub fn ci_report(check: &RegressionCheck) -> String {
    let mut out = String::new();
    out.push_str(&format!("regression.asset_id={}\n", check.asset_id));
    out.push_str(&format!(
        "regression.baseline_found={}\n",
        check.baseline_found
    ));
    out.push_str(&format!(
        "regression.current_score={:.4}\n",
        check.current_score
    ));
    if let Some(delta) = check.score_delta {
        out.push_str(&format!("regression.score_delta={delta:.4}\n"));
    }
    if let Some(distance) = check.phash_distance {
        out.push_str(&format!("regression.phash_distance={distance}\n"));
    }
    out.push_str(&format!(
        "regression.detected={}\n",
        check.regression_detected
    ));
    if let Some(severity) = check.severity {
        out.push_str(&format!("regression.severity={severity}\n"));
    }
    out.push_str(&format!(
        "regression.recommendation={}\n",
        check.recommendation
    ));
    out
}

/// Exit code for the CI gate: 0 on pass, 1 on detected regression.
pub fn ci_exit_code(check: &RegressionCheck) -> i32 {
    if check.regression_detected { 1 } else { 0 }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
