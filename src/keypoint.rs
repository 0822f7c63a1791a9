// keypoint.rs — SIFT descriptor record and match pair types.
//
// LAYOUT
// ──────
// `Keypoint` is the exact record the device kernels read: four f32 fields
// followed by 128 descriptor bytes, 144 bytes total, 4-byte aligned. The
// WGSL side declares the descriptor as `array<u32, 32>` and unpacks bytes
// little-endian, so the host can upload a `&[Keypoint]` with a plain
// `bytemuck::cast_slice`, no repacking step.
//
// Keypoints arriving as raw bytes (files, foreign detectors) are validated
// here before they reach the matcher: a byte count that is not a whole
// number of records means the caller handed us the wrong element type.

use crate::error::{Error, Result};

/// Number of bytes in one SIFT descriptor.
pub const DESCRIPTOR_LEN: usize = 128;

/// Size in bytes of one `Keypoint` record.
pub const KEYPOINT_BYTES: usize = std::mem::size_of::<Keypoint>();

/// One SIFT keypoint: position, scale, orientation and descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub angle: f32,
    pub desc: [u8; DESCRIPTOR_LEN],
}

impl Keypoint {
    pub fn new(x: f32, y: f32, scale: f32, angle: f32, desc: [u8; DESCRIPTOR_LEN]) -> Self {
        Keypoint { x, y, scale, angle, desc }
    }

    /// Squared Euclidean distance between two descriptors.
    ///
    /// Max value is 128 · 255² ≈ 8.3M, which fits in u32. The kernel
    /// accumulates in u32 too, so host and device agree bit-for-bit.
    pub fn descriptor_distance_sq(&self, other: &Keypoint) -> u32 {
        self.desc
            .iter()
            .zip(other.desc.iter())
            .map(|(&p, &q)| {
                let d = p as i32 - q as i32;
                (d * d) as u32
            })
            .sum()
    }
}

/// Index pair written by the matching kernel: `(index in A, index in B)`.
///
/// Matches `vec2<i32>` in match.wgsl. Unwritten slots hold −1.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndexPair {
    pub a: i32,
    pub b: i32,
}

impl IndexPair {
    pub const UNSET: IndexPair = IndexPair { a: -1, b: -1 };

    pub fn new(a: usize, b: usize) -> Self {
        IndexPair { a: a as i32, b: b as i32 }
    }
}

/// A matched pair carrying full copies of both keypoints, so downstream
/// consumers do not need the original sets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPair {
    /// Keypoint from the first (query) set.
    pub a: Keypoint,
    /// Its nearest neighbour in the second set.
    pub b: Keypoint,
}

/// Reinterpret a byte buffer as keypoint records without copying.
///
/// # Errors
/// `InvalidArgument` if the length is not a multiple of [`KEYPOINT_BYTES`]
/// or the buffer is not 4-byte aligned.
pub fn as_keypoints(bytes: &[u8]) -> Result<&[Keypoint]> {
    check_record_len(bytes.len())?;
    bytemuck::try_cast_slice(bytes).map_err(|e| {
        Error::InvalidArgument(format!("keypoint buffer cannot be viewed as records: {e}"))
    })
}

/// Copy a byte buffer into owned keypoint records. Alignment of the input
/// does not matter.
pub fn keypoints_from_bytes(bytes: &[u8]) -> Result<Vec<Keypoint>> {
    check_record_len(bytes.len())?;
    Ok(bytes
        .chunks_exact(KEYPOINT_BYTES)
        .map(bytemuck::pod_read_unaligned::<Keypoint>)
        .collect())
}

fn check_record_len(len: usize) -> Result<()> {
    if len % KEYPOINT_BYTES != 0 {
        return Err(Error::InvalidArgument(format!(
            "expected a flat sequence of {KEYPOINT_BYTES}-byte keypoint records, \
             got {len} bytes ({} trailing)",
            len % KEYPOINT_BYTES
        )));
    }
    Ok(())
}
