// demos/match_synthetic.rs — Match two synthetic views and fit an affine.
//
// Generates a keypoint set, observes it a second time through a known
// affine transform with descriptor noise and distractors, matches the two
// views on the selected device, and recovers the transform.
//
// USAGE
//   cargo run --example match_synthetic
//   cargo run --example match_synthetic -- 4000
//   SIFT_MATCH_DEVICE=cpu RUST_LOG=debug cargo run --example match_synthetic

use std::time::Instant;

use sift_match::gpu::device::{DevicePreference, DeviceRequest};
use sift_match::gpu::{MatchPlan, PlanConfig};
use sift_match::keypoint::{Keypoint, DESCRIPTOR_LEN};
use sift_match::matching::match_keypoints_cpu;
use sift_match::transform::{estimate_affine, AffineTransform};
use sift_match::Result;

const DEFAULT_COUNT: usize = 2000;
const WIDTH: f32 = 1280.0;
const HEIGHT: f32 = 720.0;

struct Xorshift(u32);

impl Xorshift {
    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }

    fn unit(&mut self) -> f32 {
        (self.next() >> 8) as f32 / (1u32 << 24) as f32
    }
}

fn make_view(n: usize, rng: &mut Xorshift) -> Vec<Keypoint> {
    (0..n)
        .map(|_| {
            let mut desc = [0u8; DESCRIPTOR_LEN];
            for d in desc.iter_mut() {
                *d = (rng.next() >> 24) as u8;
            }
            Keypoint::new(rng.unit() * WIDTH, rng.unit() * HEIGHT, 1.0 + rng.unit() * 4.0, rng.unit(), desc)
        })
        .collect()
}

/// Every third keypoint is dropped and replaced by a distractor.
fn observe(view: &[Keypoint], t: &AffineTransform, rng: &mut Xorshift) -> Vec<Keypoint> {
    let mut out: Vec<Keypoint> = view
        .iter()
        .enumerate()
        .map(|(i, kp)| {
            if i % 3 == 2 {
                return make_view(1, rng)[0];
            }
            let (x, y) = t.apply(kp.x as f64, kp.y as f64);
            let mut obs = Keypoint { x: x as f32, y: y as f32, ..*kp };
            for _ in 0..6 {
                let k = rng.next() as usize % DESCRIPTOR_LEN;
                obs.desc[k] = obs.desc[k].saturating_add((rng.next() % 8) as u8);
            }
            obs
        })
        .collect();
    out.reverse();
    out
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let count = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_COUNT);
    let preference: DevicePreference = std::env::var("SIFT_MATCH_DEVICE")
        .unwrap_or_default()
        .parse()?;

    let plan = MatchPlan::new(PlanConfig {
        device: DeviceRequest::with_preference(preference),
        profile: true,
        ..Default::default()
    })?;
    println!("Device: {}", plan.device());
    println!("Strategy: {:?}, workgroup {}", plan.strategy(), plan.workgroup_size());

    let truth = AffineTransform::from_coefficients([0.96, -0.17, 35.0, 0.15, 1.02, -12.0]);
    let mut rng = Xorshift(0x5eed_1234);
    let a = make_view(count, &mut rng);
    let b = observe(&a, &truth, &mut rng);

    let t0 = Instant::now();
    let matches = plan.match_keypoints(&a, &b)?;
    let plan_time = t0.elapsed();

    let t0 = Instant::now();
    let cpu = match_keypoints_cpu(&a, &b, plan.match_ratio(), None);
    let cpu_time = t0.elapsed();

    println!(
        "{} × {} keypoints: {} matches on device in {:.2?}, {} on CPU in {:.2?}{}",
        a.len(),
        b.len(),
        matches.len(),
        plan_time,
        cpu.len(),
        cpu_time,
        if matches == cpu { "" } else { "  (MISMATCH)" }
    );

    println!("Stages:");
    for e in plan.profile_events() {
        println!("  {:<20} {:>10.3?}", e.label, e.duration);
    }

    let fit = estimate_affine(&matches)?;
    println!("Truth:     {:?}", truth.m);
    println!("Estimated: {:?}", fit.m);
    println!("MSE: {:.3e} px²", fit.mean_squared_error(&matches));

    plan.release();
    Ok(())
}
