// matching.rs — Brute-force nearest-neighbour matching with the ratio test.
//
// CPU reference for the `matching` kernel in shaders/match.wgsl. The GPU
// plan is validated against `brute_force` index-for-index, and both paths
// share `finalize_pairs` + `assemble` so the ordering and length rules are
// implemented exactly once.
//
// Algorithm (per keypoint a_i of set A):
//   1. Skip a_i if an ROI is given and a_i sits on an invalid pixel.
//   2. Squared L2 distance over the 128 descriptor bytes to every b_j.
//   3. Track best and second-best; strict `<` so the lowest index wins ties.
//   4. Accept if |B| == 1, or best <= ratio² · second (the distance-ratio
//      test on squared distances).
//
// The relation is one-sided: match(A, B) and match(B, A) may differ. A
// descriptor in B can be claimed by several keypoints of A.

use crate::keypoint::{IndexPair, Keypoint, MatchPair};
use crate::roi::RoiMask;

/// Default distance-ratio threshold (Lowe-style, applied squared).
pub const DEFAULT_MATCH_RATIO: f32 = 0.73;

/// Ratio-test acceptance, shared wording with match.wgsl.
#[inline]
pub fn passes_ratio_test(best: u32, second: u32, ratio_sq: f32) -> bool {
    best as f32 <= ratio_sq * second as f32
}

/// Exhaustive CPU matcher returning raw index pairs in ascending A order.
///
/// No length cap is applied here; see [`finalize_pairs`].
pub fn brute_force(
    set_a: &[Keypoint],
    set_b: &[Keypoint],
    ratio: f32,
    roi: Option<&RoiMask>,
) -> Vec<IndexPair> {
    if set_b.is_empty() {
        return Vec::new();
    }
    let ratio_sq = ratio * ratio;

    set_a
        .iter()
        .enumerate()
        .filter(|(_, a)| roi.map_or(true, |m| m.is_valid(a.x, a.y)))
        .filter_map(|(i, a)| {
            let mut best = u32::MAX;
            let mut second = u32::MAX;
            let mut best_j = 0usize;
            for (j, b) in set_b.iter().enumerate() {
                let d = a.descriptor_distance_sq(b);
                if d < best {
                    second = best;
                    best = d;
                    best_j = j;
                } else if d < second {
                    second = d;
                }
            }
            let accept = set_b.len() == 1 || passes_ratio_test(best, second, ratio_sq);
            accept.then(|| IndexPair::new(i, best_j))
        })
        .collect()
}

/// Sort pairs by A index and cap the count at min(|A|, |B|).
///
/// Device pairs arrive in atomic-counter order, so this is where the
/// ascending-A guarantee comes from. Pairs with out-of-range indices
/// (sentinels that slipped through) are dropped.
pub fn finalize_pairs(mut pairs: Vec<IndexPair>, len_a: usize, len_b: usize) -> Vec<IndexPair> {
    pairs.retain(|p| p.a >= 0 && p.b >= 0 && (p.a as usize) < len_a && (p.b as usize) < len_b);
    pairs.sort_unstable_by_key(|p| (p.a, p.b));
    pairs.dedup_by_key(|p| p.a);
    pairs.truncate(len_a.min(len_b));
    pairs
}

/// Turn index pairs into full `MatchPair`s by indexing back into the
/// caller's original sets. Coordinates are copied, never recomputed.
pub fn assemble(set_a: &[Keypoint], set_b: &[Keypoint], pairs: &[IndexPair]) -> Vec<MatchPair> {
    pairs
        .iter()
        .map(|p| MatchPair { a: set_a[p.a as usize], b: set_b[p.b as usize] })
        .collect()
}

/// CPU end-to-end match: same result contract as `MatchPlan::match_keypoints`.
pub fn match_keypoints_cpu(
    set_a: &[Keypoint],
    set_b: &[Keypoint],
    ratio: f32,
    roi: Option<&RoiMask>,
) -> Vec<MatchPair> {
    let pairs = brute_force(set_a, set_b, ratio, roi);
    let pairs = finalize_pairs(pairs, set_a.len(), set_b.len());
    assemble(set_a, set_b, &pairs)
}
