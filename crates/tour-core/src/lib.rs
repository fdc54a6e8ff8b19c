// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core data model for the tour conversion pipeline.
//!
//! These are the types that cross component boundaries: the job descriptor a
//! submitter hands to the queue, the result the conversion service returns,
//! the QA report embedded in that result, and the camera pose the renderers
//! consume.  The frozen wire contract (canonical pose list, QA thresholds,
//! SOG header) lives in [`contract`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod contract;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque 128-bit identifier for an uploaded source asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(pub Uuid);

impl AssetId {
    /// Generate a fresh random asset identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for AssetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Opaque, globally addressable blob key.  Immutable once written.
///
/// Keys follow `tours/<market>/<assetId>/<name>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobKey(pub String);

impl BlobKey {
    /// Wrap an arbitrary key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The deterministic key under which a job's converted output is
    /// published.
    pub fn for_output(market: &str, asset_id: AssetId) -> Self {
        Self(format!("tours/{market}/{asset_id}/output.sog"))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Job descriptor
// ---------------------------------------------------------------------------

fn default_iterations() -> u32 {
    30_000
}

fn default_quality_threshold() -> f64 {
    0.85
}

/// Input record describing one conversion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    /// The asset being converted.
    pub asset_id: AssetId,
    /// Blob key of the uploaded PLY point cloud.
    pub source_key: BlobKey,
    /// Partition key (e.g. `"NYC"`).
    pub market: String,
    /// Optimisation iterations passed to the converter.  Must be ≥ 1.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Minimum aggregate QA score for the conversion to succeed, in [0, 1].
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
}

impl ConversionJob {
    /// Create a job with default iterations and quality threshold.
    pub fn new(asset_id: AssetId, source_key: BlobKey, market: impl Into<String>) -> Self {
        Self {
            asset_id,
            source_key,
            market: market.into(),
            iterations: default_iterations(),
            quality_threshold: default_quality_threshold(),
        }
    }

    /// The deterministic queue job id used for deduplicated submission.
    pub fn default_job_id(&self) -> String {
        format!("tour-{}", self.asset_id)
    }

    /// The key the converted output will be published under.
    pub fn output_key(&self) -> BlobKey {
        BlobKey::for_output(&self.market, self.asset_id)
    }
}

// ---------------------------------------------------------------------------
// Camera pose
// ---------------------------------------------------------------------------

/// A camera pose on the canonical QA path.
///
/// Fields are IEEE-754 doubles; the canonical list in
/// [`contract::CANONICAL_CAMERA_PATH`] must be bit-identical across
/// implementations so stored baselines stay portable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    /// World-space x.
    pub x: f64,
    /// World-space y (up).
    pub y: f64,
    /// World-space z.
    pub z: f64,
    /// Pitch in radians; negative looks down.
    pub pitch: f64,
    /// Yaw in radians.
    pub yaw: f64,
}

// ---------------------------------------------------------------------------
// Render mode
// ---------------------------------------------------------------------------

/// Which renderer implementation produced the QA frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Deterministic CPU mock; no GPU required.
    Mock,
    /// Real GPU rasteriser.
    Real,
}

impl RenderMode {
    /// Stable string form (`"mock"` / `"real"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Real => "real",
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the converter binary was resolved at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryMode {
    /// A locally installed executable was found.
    Local,
    /// Falling back to the package runner (`npx`).
    PackageRunner,
}

impl BinaryMode {
    /// Stable string form (`"local"` / `"package_runner"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::PackageRunner => "package_runner",
        }
    }
}

impl fmt::Display for BinaryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// QA report
// ---------------------------------------------------------------------------

/// Per-frame QA measurement at one canonical pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    /// Index into the canonical camera path.
    pub index: usize,
    /// The pose the frame was rendered at.
    pub pose: CameraPose,
    /// Structural similarity between source and converted frame.
    pub ssim: f64,
    /// Perceptual-hash Hamming distance between the two frames.
    pub phash_distance: u32,
    /// Whether this frame met both per-frame thresholds.
    pub passed: bool,
}

/// Aggregate metrics over all rendered frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaMetrics {
    /// Mean SSIM across frames.
    pub avg_ssim: f64,
    /// Minimum SSIM across frames.
    pub min_ssim: f64,
    /// Maximum SSIM across frames.
    pub max_ssim: f64,
    /// Mean perceptual-hash distance across frames.
    pub avg_phash_distance: f64,
    /// Number of frames rendered.
    pub frames_rendered: usize,
    /// Number of frames that passed both thresholds.
    pub frames_passed: usize,
    /// Wall-clock render + analysis time in milliseconds.
    pub render_elapsed_ms: u64,
}

/// The QA engine's verdict on one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    /// Aggregate pass/fail against the frozen thresholds.
    pub passed: bool,
    /// Aggregate score: mean SSIM across frames.
    pub score: f64,
    /// One entry per canonical pose, in path order.
    pub frames: Vec<FrameResult>,
    /// Aggregate metrics.
    pub metrics: QaMetrics,
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
    /// Which renderer implementation was used.
    pub mode: RenderMode,
    /// Free-form renderer identification string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderer_info: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversion result
// ---------------------------------------------------------------------------

/// Provenance of one conversion run: how it was rendered and converted, and
/// when.  Embedded verbatim in every [`ConversionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProvenance {
    /// Renderer mode used for QA.
    pub qa_mode: RenderMode,
    /// How the converter binary was resolved.
    pub binary_mode: BinaryMode,
    /// Resolved converter invocation path.
    pub binary_path: String,
    /// Deployment environment label (e.g. `"development"`).
    pub environment: String,
    /// When the job started.
    pub started_at: DateTime<Utc>,
    /// When the job finished (successfully or not).
    pub completed_at: DateTime<Utc>,
}

/// Outcome of one conversion job.
///
/// Always populated with whatever measurements completed before a failure: a
/// post-convert QA failure still carries the source digest, output digest and
/// converter version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Whether the job succeeded end-to-end.
    pub ok: bool,
    /// SHA-256 of the byte stream the converter consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,
    /// Size in bytes of the staged source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_size: Option<u64>,
    /// Blob key the output was published under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<BlobKey>,
    /// SHA-256 of the byte stream uploaded to `output_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<String>,
    /// Size in bytes of the converted output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
    /// Version string of the converter that ran.
    pub converter_version: String,
    /// Iterations the converter was invoked with.
    pub iterations: u32,
    /// Wall-clock duration of the whole job in milliseconds.
    pub elapsed_ms: u64,
    /// The QA report, when QA ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<QaReport>,
    /// The terminal error, when the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<tour_error::ErrorRecord>,
    /// Run provenance.
    pub provenance: RunProvenance,
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// Serde helper for `std::time::Duration` as integer milliseconds.
pub mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Serialise a duration as milliseconds.
    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        (val.as_millis() as u64).serialize(ser)
    }

    /// Deserialise a duration from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_asset() -> AssetId {
        "00000000-0000-4000-8000-000000000001".parse().unwrap()
    }

    #[test]
    fn output_key_shape() {
        let key = BlobKey::for_output("NYC", sample_asset());
        assert_eq!(
            key.as_str(),
            "tours/NYC/00000000-0000-4000-8000-000000000001/output.sog"
        );
    }

    #[test]
    fn default_job_id_is_tour_prefixed() {
        let job = ConversionJob::new(sample_asset(), BlobKey::new("tours/NYC/x/input.ply"), "NYC");
        assert_eq!(
            job.default_job_id(),
            "tour-00000000-0000-4000-8000-000000000001"
        );
    }

    #[test]
    fn job_defaults() {
        let job = ConversionJob::new(sample_asset(), BlobKey::new("k"), "NYC");
        assert_eq!(job.iterations, 30_000);
        assert_eq!(job.quality_threshold, 0.85);
    }

    #[test]
    fn job_serde_fills_defaults() {
        let json = r#"{
            "asset_id": "00000000-0000-4000-8000-000000000001",
            "source_key": "tours/NYC/a/input.ply",
            "market": "NYC"
        }"#;
        let job: ConversionJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.iterations, 30_000);
        assert_eq!(job.quality_threshold, 0.85);
    }

    #[test]
    fn render_mode_serialises_snake_case() {
        assert_eq!(serde_json::to_string(&RenderMode::Mock).unwrap(), r#""mock""#);
        assert_eq!(serde_json::to_string(&RenderMode::Real).unwrap(), r#""real""#);
        assert_eq!(
            serde_json::to_string(&BinaryMode::PackageRunner).unwrap(),
            r#""package_runner""#
        );
    }

    #[test]
    fn asset_id_roundtrip() {
        let id = sample_asset();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""00000000-0000-4000-8000-000000000001""#);
        let back: AssetId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn camera_pose_exact_equality() {
        let a = contract::CANONICAL_CAMERA_PATH[1];
        let b = contract::CANONICAL_CAMERA_PATH[1];
        assert_eq!(a, b);
        assert_ne!(a, contract::CANONICAL_CAMERA_PATH[2]);
    }
}
