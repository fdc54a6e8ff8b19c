// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structural similarity (SSIM) between two frames.
//!
//! Computed globally over a fixed 64×64 grayscale downsample rather than with
//! a sliding window: QA compares renders of the same pose, where global
//! statistics are enough to catch conversion artifacts, and the fixed
//! resolution keeps scores comparable across renderer output sizes.

use crate::{Frame, grayscale_resize};

/// Comparison resolution.
const SSIM_DIM: u32 = 64;

/// Stabilising constant `(0.01 * 255)²`.
const C1: f64 = 6.5025;

/// Stabilising constant `(0.03 * 255)²`.
const C2: f64 = 58.5225;

/// Structural-similarity score between two frames, clamped to `[0, 1]`.
pub fn ssim(a: &Frame, b: &Frame) -> f64 {
    let ga = grayscale_resize(a, SSIM_DIM, SSIM_DIM);
    let gb = grayscale_resize(b, SSIM_DIM, SSIM_DIM);
    let n = ga.len() as f64;

    let mean_a: f64 = ga.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b: f64 = gb.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for (&pa, &pb) in ga.iter().zip(gb.iter()) {
        let da = pa as f64 - mean_a;
        let db = pb as f64 - mean_b;
        var_a += da * da;
        var_b += db * db;
        cov += da * db;
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    let numerator = (2.0 * mean_a * mean_b + C1) * (2.0 * cov + C2);
    let denominator = (mean_a * mean_a + mean_b * mean_b + C1) * (var_a + var_b + C2);
    (numerator / denominator).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_frames_score_one() {
        let f = Frame::solid(256, 256, [90, 140, 30]);
        let score = ssim(&f, &f);
        assert!((score - 1.0).abs() < 0.01, "score {score}");
    }

    #[test]
    fn identical_structured_frames_score_one() {
        let mut data = Vec::new();
        for y in 0..128u32 {
            for x in 0..128u32 {
                let v = ((x * 2 + y * 3) % 256) as u8;
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let f = Frame::from_rgb(128, 128, data).unwrap();
        let score = ssim(&f, &f.clone());
        assert!((score - 1.0).abs() < 0.01, "score {score}");
    }

    #[test]
    fn opposite_frames_score_low() {
        let black = Frame::solid(64, 64, [0, 0, 0]);
        let white = Frame::solid(64, 64, [255, 255, 255]);
        let score = ssim(&black, &white);
        assert!(score < 0.05, "score {score}");
    }

    #[test]
    fn mild_noise_scores_below_identical() {
        let base = Frame::solid(64, 64, [128, 128, 128]);
        let mut noisy_data = base.data().to_vec();
        for (i, v) in noisy_data.iter_mut().enumerate() {
            if i % 7 == 0 {
                *v = v.wrapping_add(40);
            }
        }
        let noisy = Frame::from_rgb(64, 64, noisy_data).unwrap();
        let score = ssim(&base, &noisy);
        assert!(score < 1.0);
        assert!(score > 0.3, "score {score}");
    }

    #[test]
    fn symmetric() {
        let a = Frame::solid(64, 64, [10, 10, 10]);
        let b = Frame::solid(64, 64, [200, 200, 200]);
        let ab = ssim(&a, &b);
        let ba = ssim(&b, &a);
        assert!((ab - ba).abs() < 1e-12);
    }
}
