// SPDX-License-Identifier: MIT OR Apache-2.0
//! Frozen wire contract: canonical camera path, QA thresholds, SOG header.
//!
//! Everything in this module is part of the external contract, not
//! configuration.  Stored quality baselines reference the canonical pose list
//! by index, so reordering or editing the list invalidates every baseline in
//! the field.  There is deliberately no mutation surface here.

use crate::CameraPose;

/// Minimum per-frame structural similarity for a frame to pass QA.
pub const MIN_SSIM: f64 = 0.85;

/// Maximum per-frame perceptual-hash Hamming distance for a frame to pass QA.
pub const MAX_PHASH_DISTANCE: u32 = 10;

/// Minimum fraction of passing frames for the aggregate report to pass.
pub const MIN_FRAMES_PASSED_RATIO: f64 = 0.80;

/// The canonical camera path: 8 poses on a horizontal ring (radius 5, eye
/// height 1.6, each facing the centre) followed by 2 elevated poses looking
/// down.  Baselines index frames by position in this list.
pub const CANONICAL_CAMERA_PATH: [CameraPose; 10] = [
    CameraPose { x: 5.0, y: 1.6, z: 0.0, pitch: 0.0, yaw: 3.141592653589793 },
    CameraPose { x: 3.5355339059327378, y: 1.6, z: 3.5355339059327378, pitch: 0.0, yaw: 3.9269908169872414 },
    CameraPose { x: 0.0, y: 1.6, z: 5.0, pitch: 0.0, yaw: 4.71238898038469 },
    CameraPose { x: -3.5355339059327378, y: 1.6, z: 3.5355339059327378, pitch: 0.0, yaw: 5.497787143782138 },
    CameraPose { x: -5.0, y: 1.6, z: 0.0, pitch: 0.0, yaw: 0.0 },
    CameraPose { x: -3.5355339059327378, y: 1.6, z: -3.5355339059327378, pitch: 0.0, yaw: 0.7853981633974483 },
    CameraPose { x: 0.0, y: 1.6, z: -5.0, pitch: 0.0, yaw: 1.5707963267948966 },
    CameraPose { x: 3.5355339059327378, y: 1.6, z: -3.5355339059327378, pitch: 0.0, yaw: 2.356194490192345 },
    CameraPose { x: 3.5355339059327378, y: 4.0, z: 3.5355339059327378, pitch: -0.5, yaw: 3.9269908169872414 },
    CameraPose { x: -3.5355339059327378, y: 4.0, z: -3.5355339059327378, pitch: -0.5, yaw: 0.7853981633974483 },
];

/// Magic bytes opening every SOG container: `"SOG\0"`.
pub const SOG_MAGIC: [u8; 4] = *b"SOG\0";

/// Current SOG container version.
pub const SOG_VERSION: u32 = 1;

/// Total length of the fixed SOG header in bytes.
pub const SOG_HEADER_LEN: usize = 16;

/// Build the 16-byte SOG header for the given gaussian count.
///
/// Layout: magic, little-endian version, little-endian gaussian count, and a
/// reserved word of zeroes.
pub fn sog_header(gaussian_count: u32) -> [u8; SOG_HEADER_LEN] {
    let mut header = [0u8; SOG_HEADER_LEN];
    header[0..4].copy_from_slice(&SOG_MAGIC);
    header[4..8].copy_from_slice(&SOG_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&gaussian_count.to_le_bytes());
    header
}

/// Returns `true` if `bytes` begins with the SOG magic.
pub fn has_sog_magic(bytes: &[u8]) -> bool {
    bytes.len() >= SOG_MAGIC.len() && bytes[..SOG_MAGIC.len()] == SOG_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_has_ten_poses() {
        assert_eq!(CANONICAL_CAMERA_PATH.len(), 10);
    }

    #[test]
    fn ring_poses_sit_at_eye_height() {
        for pose in &CANONICAL_CAMERA_PATH[..8] {
            assert_eq!(pose.y, 1.6);
            assert_eq!(pose.pitch, 0.0);
        }
    }

    #[test]
    fn elevated_poses_look_down() {
        for pose in &CANONICAL_CAMERA_PATH[8..] {
            assert_eq!(pose.y, 4.0);
            assert_eq!(pose.pitch, -0.5);
        }
    }

    #[test]
    fn ring_radius_is_five() {
        for pose in &CANONICAL_CAMERA_PATH[..8] {
            let r = (pose.x * pose.x + pose.z * pose.z).sqrt();
            assert!((r - 5.0).abs() < 1e-9, "radius {r}");
        }
    }

    #[test]
    fn sog_header_layout() {
        let header = sog_header(64);
        assert_eq!(&header[0..4], b"SOG\0");
        assert_eq!(&header[0..8], &[0x53, 0x4F, 0x47, 0x00, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(u32::from_le_bytes(header[8..12].try_into().unwrap()), 64);
        assert_eq!(&header[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn magic_detection() {
        assert!(has_sog_magic(&sog_header(1)));
        assert!(has_sog_magic(b"SOG\0garbage"));
        assert!(!has_sog_magic(b"SOG"));
        assert!(!has_sog_magic(b"RIFFxxxxWEBP"));
        assert!(!has_sog_magic(&[]));
    }
}
