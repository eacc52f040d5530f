//! Camera frames.
//!
//! A [`Frame`] is a row-major `f64` image plus the metadata the alignment code
//! needs to turn pixel offsets into physical distances: pixel size, baseline
//! (dark level) and the exposure it was taken with.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;
/// Maximum allowed frame payload in bytes (512 MB of `f64` pixels).
pub const MAX_FRAME_BYTES: usize = 512 * 1024 * 1024;

/// Check that a `width` x `height` frame of `f64` pixels stays within limits.
///
/// Returns the pixel count.
pub fn validate_frame_size(width: usize, height: usize) -> AppResult<usize> {
    let too_large = |dim: usize| dim > MAX_FRAME_DIMENSION as usize;
    if too_large(width) || too_large(height) {
        return Err(DaqError::FrameDimensionsTooLarge {
            width: u32::try_from(width).unwrap_or(u32::MAX),
            height: u32::try_from(height).unwrap_or(u32::MAX),
            max_dimension: MAX_FRAME_DIMENSION,
        });
    }

    let pixels = width.checked_mul(height).ok_or(DaqError::SizeOverflow {
        context: "frame pixel count",
    })?;
    let bytes = pixels
        .checked_mul(std::mem::size_of::<f64>())
        .ok_or(DaqError::SizeOverflow {
            context: "frame byte size",
        })?;
    if bytes > MAX_FRAME_BYTES {
        return Err(DaqError::FrameTooLarge {
            bytes,
            max_bytes: MAX_FRAME_BYTES,
        });
    }
    Ok(pixels)
}

/// Single acquired (or corrected) image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    width: usize,
    height: usize,
    data: Vec<f64>,
    /// Physical size of one pixel (x, y) in metres
    pub pixel_size: (f64, f64),
    /// Dark level of the sensor, in counts
    pub baseline: f64,
    /// Exposure time the frame was taken with, in seconds
    pub exposure_time: f64,
}

impl Frame {
    /// Wrap row-major pixel data.
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> AppResult<Self> {
        let expected = validate_frame_size(width, height)?;
        if data.len() != expected {
            return Err(DaqError::FrameSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
            pixel_size: (1e-6, 1e-6),
            baseline: 0.0,
            exposure_time: 0.0,
        })
    }

    /// Frame of constant value.
    pub fn filled(width: usize, height: usize, value: f64) -> AppResult<Self> {
        let pixels = validate_frame_size(width, height)?;
        Self::new(width, height, vec![value; pixels])
    }

    /// Set the physical pixel size in metres.
    pub fn with_pixel_size(mut self, x: f64, y: f64) -> Self {
        self.pixel_size = (x, y);
        self
    }

    /// Set the dark level.
    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }

    /// Set the exposure time in seconds.
    pub fn with_exposure(mut self, exposure_time: f64) -> Self {
        self.exposure_time = exposure_time;
        self
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major pixel values.
    pub fn pixels(&self) -> &[f64] {
        &self.data
    }

    /// Mutable row-major pixel values.
    pub fn pixels_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Pixel at column `x`, row `y`.
    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        if x < self.width && y < self.height {
            self.data.get(y * self.width + x).copied()
        } else {
            None
        }
    }

    /// Optical centre in pixel coordinates, `(width / 2, height / 2)`.
    pub fn center(&self) -> (f64, f64) {
        (self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    /// Add another frame pixel-wise (signal accumulation).
    pub fn accumulate(&mut self, other: &Frame) -> AppResult<()> {
        if other.width != self.width || other.height != self.height {
            return Err(DaqError::FrameSizeMismatch {
                expected: self.data.len(),
                actual: other.data.len(),
            });
        }
        for (acc, v) in self.data.iter_mut().zip(&other.data) {
            *acc += v;
        }
        self.baseline += other.baseline;
        self.exposure_time += other.exposure_time;
        Ok(())
    }
}
