// SPDX-License-Identifier: MIT OR Apache-2.0
//! RIFF/WebP container validation and the lossless-only policy.
//!
//! Tour imagery is stored exclusively as lossless WebP; a lossy asset
//! sneaking into the store would silently cap every downstream QA score.
//! [`validate`] inspects the container without decoding pixel data;
//! [`enforce_lossless`] turns the policy into a typed error;
//! [`convert_to_lossless`] transcodes offending buffers at maximum effort.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use tour_error::{PipelineError, Result};

/// Compression scheme found in a WebP container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// VP8L chunk.
    Lossless,
    /// VP8 chunk.
    Lossy,
    /// No recognisable image chunk found.
    Unknown,
}

/// Result of container inspection.  Never fails; malformed input is reported
/// through the `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebpInfo {
    /// The container parsed cleanly and holds a recognised image chunk.
    pub is_valid: bool,
    /// The buffer is a RIFF/WEBP container at all.
    pub is_webp: bool,
    /// Which compression scheme the image chunk uses.
    pub compression: Compression,
    /// Shorthand for `compression == Lossless`.
    pub is_lossless: bool,
    /// Decoded pixel width, when the chunk header carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Decoded pixel height, when the chunk header carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Parse problem, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebpInfo {
    fn not_webp() -> Self {
        Self {
            is_valid: false,
            is_webp: false,
            compression: Compression::Unknown,
            is_lossless: false,
            width: None,
            height: None,
            error: None,
        }
    }

    fn corrupt(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            is_webp: true,
            compression: Compression::Unknown,
            is_lossless: false,
            width: None,
            height: None,
            error: Some(message.into()),
        }
    }
}

/// Inspect a buffer as a RIFF/WEBP container.
///
/// Walks the chunk list (4-byte tag, little-endian 4-byte size, data, pad
/// byte on odd sizes) until the first `VP8L` or `VP8 ` chunk.
pub fn validate(buf: &[u8]) -> WebpInfo {
    if buf.len() < 12 || &buf[0..4] != b"RIFF" || &buf[8..12] != b"WEBP" {
        return WebpInfo::not_webp();
    }

    let mut offset = 12usize;
    while offset + 8 <= buf.len() {
        let tag = &buf[offset..offset + 4];
        let size = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().expect("4 bytes"))
            as usize;
        let data_start = offset + 8;
        let data_end = match data_start.checked_add(size) {
            Some(end) if end <= buf.len() => end,
            _ => {
                return WebpInfo::corrupt(format!(
                    "chunk {} overruns buffer (size {size})",
                    String::from_utf8_lossy(tag)
                ));
            }
        };
        let data = &buf[data_start..data_end];

        match tag {
            b"VP8L" => {
                let (width, height) = vp8l_dimensions(data);
                return WebpInfo {
                    is_valid: true,
                    is_webp: true,
                    compression: Compression::Lossless,
                    is_lossless: true,
                    width,
                    height,
                    error: None,
                };
            }
            b"VP8 " => {
                let (width, height) = vp8_dimensions(data);
                return WebpInfo {
                    is_valid: true,
                    is_webp: true,
                    compression: Compression::Lossy,
                    is_lossless: false,
                    width,
                    height,
                    error: None,
                };
            }
            _ => {
                // Skip unknown chunks (VP8X, ICCP, EXIF, ...), honouring the
                // 2-byte alignment pad.
                offset = data_end + (size & 1);
            }
        }
    }

    WebpInfo::corrupt("no VP8L or VP8 chunk found")
}

/// Width/height from a VP8L stream header: a 0x2F signature byte followed by
/// two 14-bit dimensions, each stored minus one.
fn vp8l_dimensions(data: &[u8]) -> (Option<u32>, Option<u32>) {
    if data.len() < 5 || data[0] != 0x2F {
        return (None, None);
    }
    let bits = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let width = (bits & 0x3FFF) + 1;
    let height = ((bits >> 14) & 0x3FFF) + 1;
    (Some(width), Some(height))
}

/// Width/height from a VP8 key-frame header: 3-byte frame tag, 0x9D012A sync
/// code, then 14-bit dimensions.
fn vp8_dimensions(data: &[u8]) -> (Option<u32>, Option<u32>) {
    if data.len() < 10 || data[3] != 0x9D || data[4] != 0x01 || data[5] != 0x2A {
        return (None, None);
    }
    let width = u32::from(u16::from_le_bytes([data[6], data[7]])) & 0x3FFF;
    let height = u32::from(u16::from_le_bytes([data[8], data[9]])) & 0x3FFF;
    (Some(width), Some(height))
}

/// Enforce the lossless-only storage policy.
///
/// Distinct codes per failure: `WEBP_NOT_WEBP` for foreign buffers,
/// `WEBP_LOSSY` for lossy WebP, `WEBP_CORRUPT` for broken containers.
pub fn enforce_lossless(buf: &[u8]) -> Result<()> {
    let info = validate(buf);
    if !info.is_webp {
        return Err(PipelineError::validation(
            "WEBP_NOT_WEBP",
            "buffer is not a WebP image",
        ));
    }
    if !info.is_valid {
        return Err(PipelineError::validation(
            "WEBP_CORRUPT",
            format!(
                "WebP container is corrupt: {}",
                info.error.as_deref().unwrap_or("unknown parse failure")
            ),
        ));
    }
    if !info.is_lossless {
        return Err(PipelineError::validation(
            "WEBP_LOSSY",
            "tour imagery must be lossless; got a lossy (VP8) WebP",
        ));
    }
    Ok(())
}

/// Transcode any decodable raster buffer to lossless WebP.
pub fn convert_to_lossless(buf: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(buf).map_err(|e| {
        PipelineError::validation("WEBP_TRANSCODE_DECODE", "could not decode input buffer")
            .with_source(e)
    })?;
    let rgba = img.to_rgba8();
    let (width, height) = (rgba.width(), rgba.height());

    let mut out = Vec::new();
    let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut out);
    encoder
        .encode(rgba.as_raw(), width, height, image::ExtendedColorType::Rgba8)
        .map_err(|e| {
            PipelineError::validation("WEBP_TRANSCODE_ENCODE", "lossless WebP encode failed")
                .with_source(e)
        })?;
    Ok(out)
}
