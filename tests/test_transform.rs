// tests/test_transform.rs — Integration tests for affine estimation from matches.

use approx::assert_relative_eq;

use sift_match::keypoint::{Keypoint, MatchPair, DESCRIPTOR_LEN};
use sift_match::matching::{match_keypoints_cpu, DEFAULT_MATCH_RATIO};
use sift_match::transform::{estimate_affine, AffineTransform};
use sift_match::Error;

fn descriptor(seed: u32) -> [u8; DESCRIPTOR_LEN] {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    let mut desc = [0u8; DESCRIPTOR_LEN];
    for d in desc.iter_mut() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        *d = (state >> 24) as u8;
    }
    desc
}

/// Scene keypoints on a jittered grid, plus the same scene seen through `t`.
fn scene(t: &AffineTransform, n: usize) -> (Vec<Keypoint>, Vec<Keypoint>) {
    let a: Vec<Keypoint> = (0..n)
        .map(|i| {
            let x = 20.0 + (i % 10) as f32 * 31.0 + (i % 3) as f32;
            let y = 15.0 + (i / 10) as f32 * 27.0 + (i % 5) as f32;
            Keypoint::new(x, y, 2.0, 0.0, descriptor(i as u32 + 1))
        })
        .collect();
    let b = a
        .iter()
        .map(|kp| {
            let (x, y) = t.apply(kp.x as f64, kp.y as f64);
            Keypoint { x: x as f32, y: y as f32, ..*kp }
        })
        .collect();
    (a, b)
}

fn pair(ax: f32, ay: f32, bx: f32, by: f32) -> MatchPair {
    let d = [0u8; DESCRIPTOR_LEN];
    MatchPair {
        a: Keypoint::new(ax, ay, 1.0, 0.0, d),
        b: Keypoint::new(bx, by, 1.0, 0.0, d),
    }
}

// ===== Match, then fit =====

#[test]
fn recovers_transform_through_matcher() {
    let truth = AffineTransform::from_coefficients([0.9, -0.2, 14.0, 0.25, 1.1, -6.0]);
    let (a, mut b) = scene(&truth, 60);
    b.reverse();

    let matches = match_keypoints_cpu(&a, &b, DEFAULT_MATCH_RATIO, None);
    assert_eq!(matches.len(), 60);

    let fit = estimate_affine(&matches).unwrap();
    // Keypoint coordinates are f32, so the fit is only as exact as they are.
    for (f, t) in fit.coefficients().iter().zip(truth.coefficients().iter()) {
        assert_relative_eq!(*f, *t, epsilon = 1e-3);
    }
    assert!(fit.mean_squared_error(&matches) < 1e-6);
}

#[test]
fn pure_translation() {
    let truth = AffineTransform::from_coefficients([1.0, 0.0, -7.5, 0.0, 1.0, 3.25]);
    let (a, b) = scene(&truth, 20);
    let matches = match_keypoints_cpu(&a, &b, DEFAULT_MATCH_RATIO, None);
    let fit = estimate_affine(&matches).unwrap();
    for (f, t) in fit.coefficients().iter().zip(truth.coefficients().iter()) {
        assert_relative_eq!(*f, *t, epsilon = 1e-4);
    }
}

#[test]
fn residuals_flag_an_outlier() {
    let mut matches = vec![
        pair(0.0, 0.0, 1.0, 1.0),
        pair(10.0, 0.0, 11.0, 1.0),
        pair(0.0, 10.0, 1.0, 11.0),
        pair(10.0, 10.0, 11.0, 11.0),
    ];
    let exact = estimate_affine(&matches).unwrap();
    assert!(exact.residuals(&matches).iter().all(|r| *r < 1e-9));

    matches.push(pair(5.0, 5.0, 40.0, -30.0));
    let skewed = estimate_affine(&matches).unwrap();
    let res = skewed.residuals(&matches);
    let worst = res
        .iter()
        .enumerate()
        .max_by(|x, y| x.1.total_cmp(y.1))
        .map(|(i, _)| i)
        .unwrap();
    assert_eq!(worst, 4);
}

// ===== Singular systems =====

#[test]
fn fewer_than_three_matches_is_singular() {
    let matches = vec![pair(0.0, 0.0, 1.0, 1.0), pair(5.0, 2.0, 6.0, 3.0)];
    assert!(matches!(
        estimate_affine(&matches),
        Err(Error::SingularSystem { matches: 2 })
    ));
    assert!(matches!(estimate_affine(&[]), Err(Error::SingularSystem { matches: 0 })));
}

#[test]
fn collinear_matches_are_singular() {
    let matches: Vec<_> = (0..8)
        .map(|i| {
            let x = i as f32 * 3.0;
            pair(x, 0.5 * x + 2.0, x + 1.0, 0.5 * x)
        })
        .collect();
    assert!(matches!(
        estimate_affine(&matches),
        Err(Error::SingularSystem { matches: 8 })
    ));
}
