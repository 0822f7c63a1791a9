// sift-match: GPU brute-force SIFT descriptor matching
// plus least-squares affine estimation between matched sets.
//
// Pipeline:
//
//   &[Keypoint] A, &[Keypoint] B
//        │
//        ▼
//   gpu::MatchPlan::match_keypoints    (or matching::match_keypoints_cpu)
//        │  ratio test, ascending-A, ≤ min(|A|, |B|) pairs
//        ▼
//   Vec<MatchPair>
//        │
//        ▼
//   transform::estimate_affine          A → B, 2×3
//
// The CPU modules are the reference implementation; the GPU plan mirrors
// them exactly.

pub mod error;
pub mod keypoint;
pub mod roi;
pub mod matching;
pub mod transform;

pub mod gpu;

pub use error::{Error, Result};
pub use keypoint::{as_keypoints, keypoints_from_bytes, IndexPair, Keypoint, MatchPair};
pub use roi::RoiMask;
pub use transform::{estimate_affine, AffineTransform};
