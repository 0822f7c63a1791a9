// roi.rs — Region-of-interest mask.
//
// A row-major byte image where non-zero marks a valid pixel. Keypoints of
// the first set whose rounded position lands outside the mask, or on a zero
// pixel, are not matched.
//
// Unlike the float images the kernels sample, the mask has no stride
// padding: WGSL storage buffers cannot hold u8, so the mask is uploaded as
// packed u32 words (four pixels per word, little-endian) and indexed
// linearly as `y * width + x`.

use crate::error::{Error, Result};

/// A 2-D validity mask, one byte per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoiMask {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

impl RoiMask {
    /// A mask with every pixel valid.
    pub fn full(width: usize, height: usize) -> Self {
        RoiMask { data: vec![1; width * height], width, height }
    }

    /// Build a mask from row-major bytes.
    ///
    /// # Errors
    /// `InvalidArgument` if the mask is empty or `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "ROI must be two-dimensional and non-empty, got {width}×{height}"
            )));
        }
        if data.len() != width * height {
            return Err(Error::InvalidArgument(format!(
                "ROI data length ({}) must equal width * height ({})",
                data.len(),
                width * height
            )));
        }
        Ok(RoiMask { data, width, height })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Mask value at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        assert!(
            x < self.width && y < self.height,
            "ROI access ({x}, {y}) out of bounds for {}×{} mask",
            self.width,
            self.height
        );
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        assert!(x < self.width && y < self.height, "ROI write ({x}, {y}) out of bounds");
        self.data[y * self.width + x] = value;
    }

    /// Whether a sub-pixel keypoint position falls on a valid pixel.
    ///
    /// Positions round to the nearest pixel. Anything outside the mask is
    /// invalid. Must agree with `roi_valid` in match.wgsl.
    pub fn is_valid(&self, x: f32, y: f32) -> bool {
        let px = (x + 0.5).floor();
        let py = (y + 0.5).floor();
        if !(px >= 0.0 && py >= 0.0) {
            return false;
        }
        let (px, py) = (px as usize, py as usize);
        px < self.width && py < self.height && self.data[py * self.width + px] != 0
    }

    /// Number of valid pixels.
    pub fn count_valid(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Pack the mask four pixels per u32 word for upload, normalising every
    /// non-zero pixel to 1. The last word is zero-padded.
    pub fn packed_words(&self) -> Vec<u32> {
        self.data
            .chunks(4)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u32, |acc, (i, &v)| acc | (((v != 0) as u32) << (8 * i)))
            })
            .collect()
    }
}
