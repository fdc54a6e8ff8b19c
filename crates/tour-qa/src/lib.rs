// SPDX-License-Identifier: MIT OR Apache-2.0
//! Perceptual QA over the canonical camera path.
//!
//! For every pose the engine renders the source and the converted scene,
//! scores the pair with SSIM and perceptual-hash distance, and aggregates
//! the per-frame verdicts into a [`QaReport`].  The engine always produces a
//! full report — even a failing one — so callers can gate on
//! `passed && score >= threshold` and still log what was measured.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tour_core::contract::{MAX_PHASH_DISTANCE, MIN_FRAMES_PASSED_RATIO, MIN_SSIM};
use tour_core::{CameraPose, FrameResult, QaMetrics, QaReport, RenderMode};
use tour_error::{ErrorKind, PipelineError, Result};
use tour_image::phash::{phash, phash_distance};
use tour_image::ssim::ssim;
use tour_image::Frame;
use tour_render::FrameRenderer;
use tracing::{debug, info};

/// QA engine bound to one renderer.
pub struct QaEngine {
    renderer: Arc<dyn FrameRenderer>,
    mode: RenderMode,
    poses: Vec<CameraPose>,
}

impl QaEngine {
    /// Create an engine over the canonical camera path.
    pub fn new(renderer: Arc<dyn FrameRenderer>, mode: RenderMode) -> Self {
        Self {
            renderer,
            mode,
            poses: tour_core::contract::CANONICAL_CAMERA_PATH.to_vec(),
        }
    }

    /// Override the pose list.  Only for tests and tooling: baselines are
    /// indexed by position on the canonical path.
    pub fn with_poses(mut self, poses: Vec<CameraPose>) -> Self {
        self.poses = poses;
        self
    }

    /// The renderer mode recorded in reports.
    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Render both scenes along the pose list and score every pair.
    pub async fn run(&self, source: &Path, converted: &Path) -> Result<QaReport> {
        let started = Instant::now();
        let mut frames = Vec::with_capacity(self.poses.len());

        for (index, pose) in self.poses.iter().enumerate() {
            let (source_frame, converted_frame) = self
                .render_pair(source, converted, pose, index)
                .await?;

            let frame_ssim = ssim(&source_frame, &converted_frame);
            let distance = phash_distance(&phash(&source_frame), &phash(&converted_frame))?;
            let passed = frame_ssim >= MIN_SSIM && distance <= MAX_PHASH_DISTANCE;

            debug!(
                target: "tour.qa",
                index,
                ssim = frame_ssim,
                phash_distance = distance,
                passed,
                "frame scored"
            );

            frames.push(FrameResult {
                index,
                pose: *pose,
                ssim: frame_ssim,
                phash_distance: distance,
                passed,
            });
        }

        let report = self.aggregate(frames, started.elapsed().as_millis() as u64);
        info!(
            target: "tour.qa",
            passed = report.passed,
            score = report.score,
            frames = report.metrics.frames_rendered,
            mode = %report.mode,
            "qa report generated"
        );
        Ok(report)
    }

    /// Render the source and converted frame for one pose in parallel on the
    /// blocking pool.
    async fn render_pair(
        &self,
        source: &Path,
        converted: &Path,
        pose: &CameraPose,
        index: usize,
    ) -> Result<(Frame, Frame)> {
        let source_task = self.spawn_render(source.to_path_buf(), *pose, index);
        let converted_task = self.spawn_render(converted.to_path_buf(), *pose, index);

        let (source_frame, converted_frame) = tokio::join!(source_task, converted_task);
        Ok((join_render(source_frame)?, join_render(converted_frame)?))
    }

    fn spawn_render(
        &self,
        scene: PathBuf,
        pose: CameraPose,
        index: usize,
    ) -> tokio::task::JoinHandle<Result<Frame>> {
        let renderer = Arc::clone(&self.renderer);
        tokio::task::spawn_blocking(move || renderer.render(&scene, &pose, index))
    }

    fn aggregate(&self, frames: Vec<FrameResult>, render_elapsed_ms: u64) -> QaReport {
        let rendered = frames.len();
        let passed_count = frames.iter().filter(|f| f.passed).count();

        let (avg_ssim, min_ssim, max_ssim, avg_distance) = if rendered == 0 {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let sum: f64 = frames.iter().map(|f| f.ssim).sum();
            let min = frames.iter().map(|f| f.ssim).fold(f64::INFINITY, f64::min);
            let max = frames
                .iter()
                .map(|f| f.ssim)
                .fold(f64::NEG_INFINITY, f64::max);
            let dist: f64 = frames.iter().map(|f| f.phash_distance as f64).sum();
            (
                sum / rendered as f64,
                min,
                max,
                dist / rendered as f64,
            )
        };

        let passed = rendered > 0
            && (passed_count as f64 / rendered as f64) >= MIN_FRAMES_PASSED_RATIO;

        QaReport {
            passed,
            score: avg_ssim,
            frames,
            metrics: QaMetrics {
                avg_ssim,
                min_ssim,
                max_ssim,
                avg_phash_distance: avg_distance,
                frames_rendered: rendered,
                frames_passed: passed_count,
                render_elapsed_ms,
            },
            generated_at: Utc::now(),
            mode: self.mode,
            renderer_info: Some(self.renderer.info()),
        }
    }
}

/// Flatten a blocking-pool join result into the pipeline error space.
fn join_render(
    joined: std::result::Result<Result<Frame>, tokio::task::JoinError>,
) -> Result<Frame> {
    joined.map_err(|e| {
        PipelineError::new(
            ErrorKind::Unexpected,
            "QA_RENDER_TASK_PANICKED",
            "render task failed to join",
        )
        .with_context("join_error", e.to_string())
    })?
}
