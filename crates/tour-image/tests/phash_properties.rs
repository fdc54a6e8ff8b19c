// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for the perceptual-hash and SSIM invariants.

use proptest::prelude::*;
use tour_image::phash::{phash, phash_distance};
use tour_image::ssim::ssim;
use tour_image::Frame;

/// Build a deterministic structured frame from a seed.
fn seeded_frame(seed: u64, dim: u32) -> Frame {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    let mut data = Vec::with_capacity((dim * dim * 3) as usize);
    for _ in 0..dim * dim {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let v = (state >> 32) as u8;
        data.extend_from_slice(&[v, v.rotate_left(3), v.wrapping_add(97)]);
    }
    Frame::from_rgb(dim, dim, data).unwrap()
}

proptest! {
    #[test]
    fn phash_is_stable_hex(seed in any::<u64>()) {
        let frame = seeded_frame(seed, 64);
        let h1 = phash(&frame);
        let h2 = phash(&frame);
        prop_assert_eq!(&h1, &h2);
        prop_assert_eq!(h1.len(), 16);
        prop_assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn phash_self_distance_zero(seed in any::<u64>()) {
        let h = phash(&seeded_frame(seed, 64));
        prop_assert_eq!(phash_distance(&h, &h).unwrap(), 0);
    }

    #[test]
    fn phash_distance_symmetric(a in any::<u64>(), b in any::<u64>()) {
        let ha = phash(&seeded_frame(a, 64));
        let hb = phash(&seeded_frame(b, 64));
        prop_assert_eq!(
            phash_distance(&ha, &hb).unwrap(),
            phash_distance(&hb, &ha).unwrap()
        );
    }

    #[test]
    fn ssim_self_is_one(seed in any::<u64>()) {
        let frame = seeded_frame(seed, 64);
        let score = ssim(&frame, &frame);
        prop_assert!((score - 1.0).abs() < 0.01, "score {}", score);
    }

    #[test]
    fn ssim_in_unit_interval(a in any::<u64>(), b in any::<u64>()) {
        let score = ssim(&seeded_frame(a, 64), &seeded_frame(b, 64));
        prop_assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn solid_brightness_levels_distinguishable(a in 0u8..100, b in 150u8..250) {
        let ha = phash(&Frame::solid(32, 32, [a, a, a]));
        let hb = phash(&Frame::solid(32, 32, [b, b, b]));
        prop_assert_ne!(ha, hb);
    }
}
