// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory raster frames and the perceptual comparison math used by QA.
//!
//! A [`Frame`] is a plain RGB8 buffer: cheap to produce from the mock
//! renderer, convertible from anything the `image` crate can decode.  On top
//! of it sit the two comparison primitives the QA engine gates on:
//! [`phash`](phash::phash) and [`ssim`](ssim::ssim).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod phash;
pub mod ssim;

use tour_error::{PipelineError, Result};

/// An owned RGB8 raster image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a raw RGB8 buffer.  `data.len()` must equal `width * height * 3`.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(PipelineError::validation(
                "FRAME_BUFFER_SIZE",
                format!(
                    "RGB buffer for {width}x{height} must be {expected} bytes, got {}",
                    data.len()
                ),
            ));
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::validation(
                "FRAME_EMPTY",
                "frame dimensions must be non-zero",
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A single-colour frame.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..width as usize * height as usize {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Decode any raster format the image layer accepts.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory(bytes).map_err(|e| {
            PipelineError::validation("IMAGE_DECODE_FAILED", "could not decode raster buffer")
                .with_source(e)
        })?;
        Ok(Self::from_dynamic(&img))
    }

    /// Convert from a decoded [`image::DynamicImage`].
    pub fn from_dynamic(img: &image::DynamicImage) -> Self {
        let rgb = img.to_rgb8();
        Self {
            width: rgb.width(),
            height: rgb.height(),
            data: rgb.into_raw(),
        }
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The raw RGB8 bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Luma (Rec. 601) of the pixel at `(x, y)`.
    fn luma_at(&self, x: u32, y: u32) -> f64 {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        let r = self.data[i] as f64;
        let g = self.data[i + 1] as f64;
        let b = self.data[i + 2] as f64;
        0.299 * r + 0.587 * g + 0.114 * b
    }
}

/// Downsample a frame to `tw`×`th` grayscale with a box filter.
///
/// Each target cell averages the luma of the source rectangle it covers, so
/// the result is stable under the exact-division sizes QA uses (256 → 64,
/// 256 → 32).
pub fn grayscale_resize(frame: &Frame, tw: u32, th: u32) -> Vec<u8> {
    debug_assert!(tw > 0 && th > 0);
    let mut out = Vec::with_capacity(tw as usize * th as usize);
    for ty in 0..th {
        let y0 = (ty as u64 * frame.height as u64 / th as u64) as u32;
        let mut y1 = ((ty as u64 + 1) * frame.height as u64 / th as u64) as u32;
        if y1 <= y0 {
            y1 = y0 + 1;
        }
        for tx in 0..tw {
            let x0 = (tx as u64 * frame.width as u64 / tw as u64) as u32;
            let mut x1 = ((tx as u64 + 1) * frame.width as u64 / tw as u64) as u32;
            if x1 <= x0 {
                x1 = x0 + 1;
            }
            let mut sum = 0.0;
            for y in y0..y1.min(frame.height) {
                for x in x0..x1.min(frame.width) {
                    sum += frame.luma_at(x, y);
                }
            }
            let count = ((y1.min(frame.height) - y0) * (x1.min(frame.width) - x0)).max(1);
            out.push((sum / count as f64).round().clamp(0.0, 255.0) as u8);
        }
    }
    out
}
