// tests/test_matching.rs — Integration tests for the CPU reference matcher.

use sift_match::keypoint::{as_keypoints, keypoints_from_bytes, Keypoint, DESCRIPTOR_LEN, KEYPOINT_BYTES};
use sift_match::matching::{brute_force, match_keypoints_cpu, DEFAULT_MATCH_RATIO};
use sift_match::{Error, RoiMask};

/// Deterministic pseudo-random keypoints (xorshift32).
fn random_keypoints(n: usize, seed: u32) -> Vec<Keypoint> {
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };
    (0..n)
        .map(|i| {
            let mut desc = [0u8; DESCRIPTOR_LEN];
            for d in desc.iter_mut() {
                *d = (next() >> 24) as u8;
            }
            Keypoint::new(i as f32, (i * 3 % 17) as f32, 1.0 + i as f32 * 0.1, 0.5, desc)
        })
        .collect()
}

/// Copy of `set` with each descriptor nudged by `noise` in a few bytes.
fn noisy_copy(set: &[Keypoint], noise: u8) -> Vec<Keypoint> {
    set.iter()
        .enumerate()
        .map(|(i, kp)| {
            let mut kp = *kp;
            for k in 0..4 {
                let idx = (i * 13 + k * 31) % DESCRIPTOR_LEN;
                kp.desc[idx] = kp.desc[idx].saturating_add(noise);
            }
            kp
        })
        .collect()
}

// ===== Concrete scenarios =====

#[test]
fn identical_descriptor_single_pair() {
    let d0 = [42u8; DESCRIPTOR_LEN];
    let a = [Keypoint::new(0.0, 0.0, 1.0, 0.0, d0)];
    let b = [Keypoint::new(1.0, 1.0, 1.0, 0.0, d0)];

    let m = match_keypoints_cpu(&a, &b, 0.8, None);
    assert_eq!(m.len(), 1);
    assert_eq!(m[0].a, a[0]);
    assert_eq!(m[0].b, b[0]);
    assert_eq!((m[0].a.x, m[0].a.y), (0.0, 0.0));
    assert_eq!((m[0].b.x, m[0].b.y), (1.0, 1.0));
}

#[test]
fn empty_b_gives_empty_result() {
    let a = random_keypoints(5, 1);
    assert!(match_keypoints_cpu(&a, &[], 0.8, None).is_empty());
}

#[test]
fn empty_a_gives_empty_result() {
    let b = random_keypoints(5, 1);
    assert!(match_keypoints_cpu(&[], &b, 0.8, None).is_empty());
}

// ===== Properties =====

#[test]
fn result_length_bounded_by_smaller_set() {
    for (na, nb, seed) in [(50, 10, 3), (10, 50, 4), (1, 1, 5), (40, 40, 6)] {
        let a = random_keypoints(na, seed);
        let mut b = noisy_copy(&a, 2);
        b.truncate(nb);
        b.extend(random_keypoints(nb.saturating_sub(b.len()), seed + 100));
        let m = match_keypoints_cpu(&a, &b, 1.0, None);
        assert!(m.len() <= na.min(nb), "{} > min({na}, {nb})", m.len());
    }
}

#[test]
fn self_match_is_identity() {
    let a = random_keypoints(64, 9);
    let m = match_keypoints_cpu(&a, &a, DEFAULT_MATCH_RATIO, None);
    assert_eq!(m.len(), a.len());
    for (pair, kp) in m.iter().zip(&a) {
        assert_eq!(pair.a, *kp);
        assert_eq!(pair.b, *kp);
    }
}

#[test]
fn results_ascend_in_a() {
    let a = random_keypoints(80, 12);
    let mut b = noisy_copy(&a, 3);
    b.reverse();
    let pairs = brute_force(&a, &b, DEFAULT_MATCH_RATIO, None);
    assert!(!pairs.is_empty());
    assert!(pairs.windows(2).all(|w| w[0].a < w[1].a));
}

#[test]
fn ratio_threshold_is_monotone() {
    let a = random_keypoints(60, 21);
    let mut b = noisy_copy(&a[..30], 40);
    b.extend(random_keypoints(30, 77));

    let mut last = 0;
    for ratio in [0.1, 0.3, 0.5, 0.7, 0.8, 0.9, 0.95, 1.0] {
        let n = brute_force(&a, &b, ratio, None).len();
        assert!(n >= last, "ratio {ratio}: {n} < {last}");
        last = n;
    }
    assert!(last > 0);
}

#[test]
fn single_candidate_always_accepted() {
    let a = random_keypoints(10, 31);
    let b = random_keypoints(1, 32);
    let pairs = brute_force(&a, &b, 0.01, None);
    assert_eq!(pairs.len(), 10);
    // Capped at min(|A|, |B|) after finalisation.
    assert_eq!(match_keypoints_cpu(&a, &b, 0.01, None).len(), 1);
}

#[test]
fn matching_is_one_sided() {
    // a0 and a1 are equally close to b0. A→B accepts both; from B's side
    // the two candidates tie and the ratio test rejects.
    let mut d = [0u8; DESCRIPTOR_LEN];
    d[0] = 100;
    let (mut d0, mut d1) = (d, d);
    d0[1] = 2;
    d1[2] = 2;
    let a = [Keypoint::new(0.0, 0.0, 1.0, 0.0, d0), Keypoint::new(1.0, 0.0, 1.0, 0.0, d1)];
    let far = Keypoint::new(5.0, 5.0, 1.0, 0.0, [255; DESCRIPTOR_LEN]);
    let b = [Keypoint::new(0.0, 0.0, 1.0, 0.0, d), far];

    let forward = brute_force(&a, &b, 0.8, None);
    let backward = brute_force(&b, &a, 0.8, None);
    assert_eq!(forward.len(), 2);
    assert!(backward.is_empty());
}

#[test]
fn roi_restricts_set_a_only() {
    let a = random_keypoints(16, 40);
    let mut roi = RoiMask::from_vec(16, 17, vec![0; 16 * 17]).unwrap();
    for kp in &a[..8] {
        roi.set(kp.x as usize, kp.y as usize, 255);
    }
    let m = match_keypoints_cpu(&a, &a, DEFAULT_MATCH_RATIO, Some(&roi));
    assert_eq!(m.len(), 8);
    assert!(m.iter().all(|p| p.a.x < 8.0));
}

// ===== Byte views =====

#[test]
fn byte_views_require_whole_records() {
    let a = random_keypoints(3, 50);
    let bytes: &[u8] = bytemuck::cast_slice(&a);
    assert_eq!(as_keypoints(bytes).unwrap(), &a[..]);
    assert_eq!(keypoints_from_bytes(bytes).unwrap(), a);

    let short = vec![0u8; KEYPOINT_BYTES - 1];
    assert!(matches!(as_keypoints(&short), Err(Error::InvalidArgument(_))));
    assert!(matches!(keypoints_from_bytes(&short), Err(Error::InvalidArgument(_))));
}
