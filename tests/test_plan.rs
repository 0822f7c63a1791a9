// tests/test_plan.rs — Integration tests for the device matching plan.
//
// Everything that opens a device is #[ignore]d:
//   cargo test --test test_plan -- --ignored

use std::sync::Arc;
use std::thread;

use sift_match::gpu::device::{DeviceClass, DeviceRequest, GpuDevice};
use sift_match::gpu::kernels::MatchingStrategy;
use sift_match::gpu::{MatchPlan, PlanConfig};
use sift_match::keypoint::{Keypoint, DESCRIPTOR_LEN};
use sift_match::matching::match_keypoints_cpu;
use sift_match::transform::{estimate_affine, AffineTransform};
use sift_match::Error;

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
            Keypoint::new((i % 50) as f32 * 7.0 + 3.0, (i / 50) as f32 * 9.0 + 2.0, 1.0, 0.0, desc)
        })
        .collect()
}

/// `set` moved by `t`, shuffled, with light descriptor noise.
fn observed(set: &[Keypoint], t: &AffineTransform) -> Vec<Keypoint> {
    let n = set.len();
    (0..n)
        .map(|j| {
            let src = &set[(j * 7 + 3) % n];
            let (x, y) = t.apply(src.x as f64, src.y as f64);
            let mut kp = Keypoint { x: x as f32, y: y as f32, ..*src };
            kp.desc[j % DESCRIPTOR_LEN] = kp.desc[j % DESCRIPTOR_LEN].wrapping_add(2);
            kp
        })
        .collect()
}

fn shared_device() -> Arc<GpuDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(GpuDevice::new(&DeviceRequest::default()).unwrap())
}

#[test]
fn config_defaults() {
    let c = PlanConfig::default();
    assert_eq!(c.capacity, 16384);
    assert_eq!(c.match_ratio, 0.73);
    assert_eq!(c.max_workgroup_size, 128);
}

// ===== Device tests =====

#[test]
#[ignore = "requires a GPU or software adapter"]
fn strategy_follows_device_class() {
    let gpu = shared_device();
    let plan = MatchPlan::with_device(Arc::clone(&gpu), PlanConfig::default()).unwrap();
    let expected = match gpu.class {
        DeviceClass::Gpu => MatchingStrategy::Gpu,
        DeviceClass::Cpu => MatchingStrategy::Cpu,
    };
    assert_eq!(plan.strategy(), expected);
    assert!(plan.workgroup_size() <= 128);
    assert!(plan.workgroup_size() <= gpu.max_workgroup_size());
}

#[test]
#[ignore = "requires a GPU or software adapter"]
fn workgroup_ceiling_is_respected() {
    let gpu = shared_device();
    let config = PlanConfig { max_workgroup_size: 8, capacity: 64, ..Default::default() };
    let plan = MatchPlan::with_device(gpu, config).unwrap();
    assert!(plan.workgroup_size() <= 8);

    let a = random_keypoints(50, 4);
    assert_eq!(plan.match_keypoints(&a, &a).unwrap().len(), 50);
}

#[test]
#[ignore = "requires a GPU or software adapter"]
fn identical_descriptor_single_pair() {
    let plan = MatchPlan::with_device(shared_device(), PlanConfig { capacity: 4, ..Default::default() }).unwrap();
    plan.set_match_ratio(0.8).unwrap();
    let d0 = [9u8; DESCRIPTOR_LEN];
    let a = [Keypoint::new(0.0, 0.0, 1.0, 0.0, d0)];
    let b = [Keypoint::new(1.0, 1.0, 1.0, 0.0, d0)];

    let m = plan.match_keypoints(&a, &b).unwrap();
    assert_eq!(m.len(), 1);
    assert_eq!(m[0].a, a[0]);
    assert_eq!(m[0].b, b[0]);
}

#[test]
#[ignore = "requires a GPU or software adapter"]
fn five_against_empty() {
    let plan = MatchPlan::with_device(shared_device(), PlanConfig::default()).unwrap();
    let a = random_keypoints(5, 8);
    assert!(plan.match_keypoints(&a, &[]).unwrap().is_empty());
}

#[test]
#[ignore = "requires a GPU or software adapter"]
fn ratio_monotone_on_device() {
    let plan = MatchPlan::with_device(shared_device(), PlanConfig::default()).unwrap();
    let a = random_keypoints(120, 15);
    let mut b = observed(&a[..60], &AffineTransform::identity());
    b.extend(random_keypoints(60, 99));

    let mut last = 0;
    for ratio in [0.2, 0.5, 0.73, 0.9, 1.0] {
        plan.set_match_ratio(ratio).unwrap();
        let n = plan.match_keypoints(&a, &b).unwrap().len();
        let cpu = match_keypoints_cpu(&a, &b, ratio, None).len();
        assert_eq!(n, cpu, "ratio {ratio}");
        assert!(n >= last);
        last = n;
    }
}

#[test]
#[ignore = "requires a GPU or software adapter"]
fn growth_matches_presized_plan() {
    let gpu = shared_device();
    let small = MatchPlan::with_device(Arc::clone(&gpu), PlanConfig { capacity: 2, ..Default::default() }).unwrap();
    let large = MatchPlan::with_device(gpu, PlanConfig { capacity: 2048, ..Default::default() }).unwrap();

    let a = random_keypoints(1500, 33);
    let b = observed(&a, &AffineTransform::identity());
    assert_eq!(small.match_keypoints(&a, &b).unwrap(), large.match_keypoints(&a, &b).unwrap());
    assert!(small.capacity().kp_a >= 1500);
}

#[test]
#[ignore = "requires a GPU or software adapter"]
fn end_to_end_affine_recovery() {
    let plan = MatchPlan::with_device(shared_device(), PlanConfig::default()).unwrap();
    let truth = AffineTransform::from_coefficients([1.05, 0.1, -12.0, -0.08, 0.95, 20.0]);
    let a = random_keypoints(400, 61);
    let b = observed(&a, &truth);

    let matches = plan.match_keypoints(&a, &b).unwrap();
    assert_eq!(matches.len(), 400);
    let fit = estimate_affine(&matches).unwrap();
    for (f, t) in fit.coefficients().iter().zip(truth.coefficients().iter()) {
        assert!((f - t).abs() < 1e-3, "{f} vs {t}");
    }
}

#[test]
#[ignore = "requires a GPU or software adapter"]
fn concurrent_callers_serialise() {
    let plan = Arc::new(MatchPlan::with_device(shared_device(), PlanConfig::default()).unwrap());
    let a = Arc::new(random_keypoints(200, 71));
    let expected = match_keypoints_cpu(&a, &a, plan.match_ratio(), None);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let plan = Arc::clone(&plan);
            let a = Arc::clone(&a);
            thread::spawn(move || plan.match_keypoints(&a, &a).unwrap())
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), expected);
    }
}

#[test]
#[ignore = "requires a GPU or software adapter"]
fn release_then_match_fails() {
    let plan = MatchPlan::with_device(shared_device(), PlanConfig::default()).unwrap();
    plan.release();
    plan.release();
    let a = random_keypoints(3, 1);
    assert!(matches!(plan.match_keypoints(&a, &a), Err(Error::Released)));
}
