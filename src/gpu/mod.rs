// gpu/mod.rs — GPU matching layer.
//
// wgpu compute kernels for descriptor matching. The CPU matcher in
// `crate::matching` remains the authoritative reference: every kernel
// result is validated against it index-for-index.
//
// Layering, bottom up:
//
//   device   adapter selection, error scopes, readback
//   kernels  policy table, work-group sizing, pipeline build + fallback
//   buffers  the per-plan resource set: grow, reset targets, release
//   plan     `MatchPlan`, the locked public entry point
//
// The GPU handles the O(|A|·|B|) distance scan. The host does the cheap
// part that needs a total order: sorting pairs by A index, truncation and
// assembly of `MatchPair`s from the caller's own slices.

pub mod buffers;
pub mod device;
pub mod kernels;
pub mod plan;

pub use device::{DeviceClass, DevicePreference, DeviceRequest, GpuDevice};
pub use plan::{MatchPlan, PlanConfig, ProfileEvent};
