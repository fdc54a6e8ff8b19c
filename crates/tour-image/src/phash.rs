// SPDX-License-Identifier: MIT OR Apache-2.0
//! 64-bit perceptual hash over a grayscale-downsampled frame.
//!
//! The hash samples at 32×32 and reduces to 64 bits.  Near-uniform images
//! get a dedicated branch: the median rule degenerates on them (every bit
//! becomes an arbitrary coin flip around a flat median), so instead the mean
//! intensity byte is repeated across the hash, which keeps solid frames of
//! different brightness distinguishable.

use crate::{Frame, grayscale_resize};
use tour_error::{PipelineError, Result};

/// Square sample dimension for hashing.
const SAMPLE_DIM: u32 = 32;

/// Reduced dimension: the hash has `REDUCED_DIM`² = 64 bits.
const REDUCED_DIM: usize = 8;

/// Intensity range (out of 255) below which an image counts as uniform.
const UNIFORM_RANGE: u8 = 10;

/// Compute the perceptual hash of a frame as 16 lowercase hex characters.
pub fn phash(frame: &Frame) -> String {
    let gray = grayscale_resize(frame, SAMPLE_DIM, SAMPLE_DIM);

    let min = *gray.iter().min().expect("non-empty sample");
    let max = *gray.iter().max().expect("non-empty sample");

    if max - min < UNIFORM_RANGE {
        // Uniformity branch: encode the mean intensity, repeated to 64 bits.
        let sum: u64 = gray.iter().map(|&v| v as u64).sum();
        let mean = (sum / gray.len() as u64) as u8;
        let bits = u64::from_le_bytes([mean; 8]);
        return format!("{bits:016x}");
    }

    // Reduce 32×32 to 8×8 block means, then threshold on the block median.
    let cell = SAMPLE_DIM as usize / REDUCED_DIM;
    let mut blocks = [0f64; REDUCED_DIM * REDUCED_DIM];
    for (i, block) in blocks.iter_mut().enumerate() {
        let bx = (i % REDUCED_DIM) * cell;
        let by = (i / REDUCED_DIM) * cell;
        let mut sum = 0.0;
        for y in by..by + cell {
            for x in bx..bx + cell {
                sum += gray[y * SAMPLE_DIM as usize + x] as f64;
            }
        }
        *block = sum / (cell * cell) as f64;
    }

    let mut sorted = blocks;
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("block means are finite"));
    let median = sorted[blocks.len() / 2];

    let mut bits: u64 = 0;
    for (i, &block) in blocks.iter().enumerate() {
        if block >= median {
            bits |= 1 << i;
        }
    }
    format!("{bits:016x}")
}

/// Hamming distance between two perceptual hashes.
///
/// Fails with a `Validation` error if the hashes differ in length or are not
/// valid hex.
pub fn phash_distance(a: &str, b: &str) -> Result<u32> {
    if a.len() != b.len() {
        return Err(PipelineError::validation(
            "PHASH_LENGTH_MISMATCH",
            format!("hash lengths differ: {} vs {}", a.len(), b.len()),
        ));
    }

    let mut distance = 0u32;
    for (ca, cb) in a.chars().zip(b.chars()) {
        let na = ca.to_digit(16).ok_or_else(|| {
            PipelineError::validation("PHASH_INVALID_HEX", format!("invalid hex digit {ca:?}"))
        })?;
        let nb = cb.to_digit(16).ok_or_else(|| {
            PipelineError::validation("PHASH_INVALID_HEX", format!("invalid hex digit {cb:?}"))
        })?;
        distance += (na ^ nb).count_ones();
    }
    Ok(distance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_16_lowercase_hex() {
        let f = Frame::solid(256, 256, [128, 128, 128]);
        let h = phash(&f);
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn self_distance_is_zero() {
        let f = Frame::solid(64, 64, [40, 90, 200]);
        let h = phash(&f);
        assert_eq!(phash_distance(&h, &h).unwrap(), 0);
    }

    #[test]
    fn solid_frames_of_different_brightness_are_distinguishable() {
        let dark = phash(&Frame::solid(256, 256, [20, 20, 20]));
        let bright = phash(&Frame::solid(256, 256, [220, 220, 220]));
        assert_ne!(dark, bright);
        assert!(phash_distance(&dark, &bright).unwrap() > 0);
    }

    #[test]
    fn uniformity_branch_encodes_mean() {
        let f = Frame::solid(32, 32, [100, 100, 100]);
        // 0x64 repeated across the hash.
        assert_eq!(phash(&f), "6464646464646464");
    }

    #[test]
    fn structured_image_uses_median_branch() {
        // Half dark, half bright: exactly half the bits should be set.
        let mut data = Vec::new();
        for y in 0..32u32 {
            for _x in 0..32u32 {
                let v = if y < 16 { 0u8 } else { 255u8 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let f = Frame::from_rgb(32, 32, data).unwrap();
        let h = phash(&f);
        let bits = u64::from_str_radix(&h, 16).unwrap();
        assert_eq!(bits.count_ones(), 32);
    }

    #[test]
    fn distance_bounds() {
        assert_eq!(
            phash_distance("0000000000000000", "ffffffffffffffff").unwrap(),
            64
        );
        assert_eq!(
            phash_distance("0000000000000000", "0000000000000001").unwrap(),
            1
        );
    }

    #[test]
    fn length_mismatch_is_validation() {
        let err = phash_distance("abc", "abcd").unwrap_err();
        assert_eq!(err.kind, tour_error::ErrorKind::Validation);
        assert_eq!(err.code, "PHASH_LENGTH_MISMATCH");
        assert!(!err.retryable());
    }

    #[test]
    fn non_hex_is_validation() {
        let err = phash_distance("zzzz", "0000").unwrap_err();
        assert_eq!(err.code, "PHASH_INVALID_HEX");
    }
}
