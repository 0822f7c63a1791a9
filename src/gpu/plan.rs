// gpu/plan.rs — Matching plan: device-resident keypoint matching.
//
// A `MatchPlan` owns everything one matching workload needs on the device:
// the compiled kernels, the resource set and an optional ROI mask. It is
// built once and reused for every call, the same pre-allocate-and-reuse
// shape as the tracker buffers elsewhere in the GPU layer.
//
// One call to `match_keypoints`:
//
//   lock ─► grow buffers? ─► memset ×4 ─► upload A, B ─► matching kernel
//        ─► read counter ─► read counter-many pairs ─► sort/truncate ─► assemble
//
// CONCURRENCY
// ───────────
// All mutable state is inside a `parking_lot::Mutex`; every operation that
// touches the device holds the lock for its whole duration. A plan can be
// shared between threads (`Arc<MatchPlan>`); concurrent calls serialise.
// Separate plans share nothing unless built on the same `Arc<GpuDevice>`.
//
// PROFILING
// ─────────
// With `profile: true` each stage is submitted and waited on individually
// and its wall time is recorded as a `ProfileEvent`. Without it stages are
// still submitted in order but nothing blocks until the first readback.
//
// STAGE ORDERING
// ──────────────
// `queue.write_buffer` is applied at the start of the *next* submit. Every
// stage therefore ends with its own submit, so an upload can never be
// overtaken by the memset that precedes it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::error::{Error, Result};
use crate::gpu::buffers::{BufferKind, Capacity, ResourceSet};
use crate::gpu::device::{byte_size, dispatch_count, DeviceClass, DeviceRequest, GpuDevice};
use crate::gpu::kernels::{KernelSet, MatchingStrategy};
use crate::keypoint::{keypoints_from_bytes, IndexPair, Keypoint, MatchPair};
use crate::matching::{self, DEFAULT_MATCH_RATIO};
use crate::roi::RoiMask;

/// Construction parameters for a [`MatchPlan`].
#[derive(Debug, Clone)]
pub struct PlanConfig {
    /// Initial element capacity of the keypoint and match buffers.
    pub capacity: usize,
    pub device: DeviceRequest,
    /// Distance-ratio threshold; applied squared to squared distances.
    pub match_ratio: f32,
    /// Ceiling on every kernel's work-group size.
    pub max_workgroup_size: u32,
    /// Record per-stage timings.
    pub profile: bool,
    /// Initial region of interest over set-A coordinates.
    pub roi: Option<RoiMask>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        PlanConfig {
            capacity: 16384,
            device: DeviceRequest::default(),
            match_ratio: DEFAULT_MATCH_RATIO,
            max_workgroup_size: 128,
            profile: false,
            roi: None,
        }
    }
}

/// Wall time of one plan stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEvent {
    pub label: &'static str,
    pub duration: Duration,
}

/// Uniform block of the `matching` entry point. Layout matches match.wgsl.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct MatchParams {
    match_capacity: u32,
    ratio_sq: f32,
    n_a: u32,
    n_b: u32,
    roi_enabled: u32,
    roi_width: u32,
    roi_height: u32,
    _pad: u32,
}

/// Uniform block of the memset entry points. Layout matches memset.wgsl.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct MemsetParams {
    count: u32,
    int_value: i32,
    float_value: f32,
    byte_value: u32,
}

/// Work-groups needed to cover `n` items, checked against the per-dimension
/// dispatch `limit`.
fn checked_workgroups(n: usize, workgroup_size: u32, limit: u32) -> Result<u32> {
    let groups = u32::try_from(n)
        .map(|n| dispatch_count(n, workgroup_size))
        .map_err(|_| Error::InvalidArgument(format!("{n} items exceed the 32-bit dispatch range")))?;
    if groups > limit {
        return Err(Error::InvalidArgument(format!(
            "{n} items need {groups} workgroups, device allows {limit}"
        )));
    }
    Ok(groups)
}

fn validate_ratio(ratio: f32) -> Result<f32> {
    if ratio.is_finite() && ratio > 0.0 {
        Ok(ratio)
    } else {
        Err(Error::InvalidArgument(format!("match ratio must be finite and positive, got {ratio}")))
    }
}

// ---------------------------------------------------------------------------
// Locked state
// ---------------------------------------------------------------------------

struct PlanState {
    gpu: Arc<GpuDevice>,
    kernels: KernelSet,
    buffers: ResourceSet,
    roi: Option<RoiMask>,
    match_ratio: f32,
    profile: bool,
    events: Vec<ProfileEvent>,
}

impl PlanState {
    /// Run `f`; when profiling, wait for the device and record the time.
    fn timed<T>(&mut self, label: &'static str, f: impl FnOnce(&PlanState) -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let out = f(self)?;
        if self.profile {
            self.gpu.device.poll(wgpu::Maintain::Wait);
            self.events.push(ProfileEvent { label, duration: start.elapsed() });
        }
        Ok(out)
    }

    /// Record commands with `f` and submit them as one stage.
    fn stage(
        &mut self,
        label: &'static str,
        f: impl FnOnce(&PlanState, &mut wgpu::CommandEncoder) -> Result<()>,
    ) -> Result<()> {
        self.timed(label, |s| {
            s.gpu.scoped(|| {
                let mut encoder = s
                    .gpu
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
                f(s, &mut encoder)?;
                s.gpu.queue.submit(std::iter::once(encoder.finish()));
                Ok(())
            })
        })
    }

    fn workgroups(&self, n: usize, workgroup_size: u32) -> Result<u32> {
        checked_workgroups(n, workgroup_size, self.gpu.device.limits().max_compute_workgroups_per_dimension)
    }

    fn uniform(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    // ---- encoders ---------------------------------------------------------

    fn encode_memset_keypoints(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::Buffer,
        count: usize,
    ) -> Result<()> {
        let kernel = self.kernels.memset()?;
        let groups = self.workgroups(count, kernel.workgroup_size)?;
        let params = MemsetParams { count: count as u32, int_value: 0, float_value: -1.0, byte_value: 0 };
        let params_buf = self.uniform("memset_kp_params", bytemuck::bytes_of(&params));
        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("memset_kp"),
            layout: &kernel.keypoints.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: target.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("memset_kp"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.keypoints.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups, 1, 1);
        Ok(())
    }

    fn encode_memset_ints(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::Buffer,
        count: usize,
        value: i32,
    ) -> Result<()> {
        let kernel = self.kernels.memset()?;
        let groups = self.workgroups(count, kernel.workgroup_size)?;
        let params = MemsetParams { count: count as u32, int_value: value, float_value: 0.0, byte_value: 0 };
        let params_buf = self.uniform("memset_int_params", bytemuck::bytes_of(&params));
        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("memset_int"),
            layout: &kernel.ints.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 1, resource: target.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: params_buf.as_entire_binding() },
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("memset_int"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.ints.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups, 1, 1);
        Ok(())
    }

    fn encode_matching(&self, encoder: &mut wgpu::CommandEncoder, n_a: usize, n_b: usize) -> Result<()> {
        let kernel = self.kernels.matching()?;
        let groups = self.workgroups(n_a, kernel.workgroup_size)?;
        let roi = self.buffers.roi();
        let params = MatchParams {
            match_capacity: self.buffers.capacity().matches as u32,
            ratio_sq: self.match_ratio * self.match_ratio,
            n_a: n_a as u32,
            n_b: n_b as u32,
            roi_enabled: roi.is_some() as u32,
            roi_width: roi.map_or(0, |r| r.width),
            roi_height: roi.map_or(0, |r| r.height),
            _pad: 0,
        };
        let params_buf = self.uniform("match_params", bytemuck::bytes_of(&params));
        let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matching"),
            layout: &kernel.pipeline.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.buffers.kp_a()?.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: self.buffers.kp_b()?.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: self.buffers.matches()?.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: self.buffers.counter()?.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: self.buffers.roi_binding()?.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: params_buf.as_entire_binding() },
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("matching"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups, 1, 1);
        Ok(())
    }

    // ---- stages -----------------------------------------------------------

    /// Keypoints to −1.0 / zero descriptors, pairs to −1, counter to 0.
    fn reset_buffers(&mut self) -> Result<()> {
        let cap = self.buffers.capacity();
        self.stage("memset kp_a", |s, enc| {
            s.encode_memset_keypoints(enc, s.buffers.kp_a()?, cap.kp_a)
        })?;
        self.stage("memset kp_b", |s, enc| {
            s.encode_memset_keypoints(enc, s.buffers.kp_b()?, cap.kp_b)
        })?;
        // Each pair is two i32s.
        self.stage("memset matches", |s, enc| {
            s.encode_memset_ints(enc, s.buffers.matches()?, 2 * cap.matches, -1)
        })?;
        self.stage("memset counter", |s, enc| {
            s.encode_memset_ints(enc, s.buffers.counter()?, 1, 0)
        })
    }

    /// Match under the lock. Any failure after the lock is taken leaves the
    /// buffers reset (best effort) before the error is returned.
    fn run_match(&mut self, set_a: &[Keypoint], set_b: &[Keypoint]) -> Result<Vec<MatchPair>> {
        match self.grow_reset_dispatch(set_a, set_b) {
            Ok(matches) => Ok(matches),
            Err(Error::Released) => Err(Error::Released),
            Err(err) => {
                if let Err(reset_err) = self.reset_buffers() {
                    log::warn!("buffer reset after failed match also failed: {reset_err}");
                }
                Err(err)
            }
        }
    }

    fn grow_reset_dispatch(&mut self, set_a: &[Keypoint], set_b: &[Keypoint]) -> Result<Vec<MatchPair>> {
        let gpu = Arc::clone(&self.gpu);
        self.buffers.ensure_capacity(&gpu, BufferKind::KeypointsA, set_a.len())?;
        self.buffers.ensure_capacity(&gpu, BufferKind::KeypointsB, set_b.len())?;
        // One pair per A keypoint at most.
        self.buffers.ensure_capacity(&gpu, BufferKind::Matches, set_a.len())?;

        self.reset_buffers()?;
        if set_a.is_empty() || set_b.is_empty() {
            log::debug!("match: |A|={} |B|={} -> 0 matches", set_a.len(), set_b.len());
            return Ok(Vec::new());
        }
        self.dispatch_and_collect(set_a, set_b)
    }

    fn dispatch_and_collect(&mut self, set_a: &[Keypoint], set_b: &[Keypoint]) -> Result<Vec<MatchPair>> {
        let start = Instant::now();

        self.stage("copy H->D kp_a", |s, _| {
            s.gpu.queue.write_buffer(s.buffers.kp_a()?, 0, bytemuck::cast_slice(set_a));
            Ok(())
        })?;
        self.stage("copy H->D kp_b", |s, _| {
            s.gpu.queue.write_buffer(s.buffers.kp_b()?, 0, bytemuck::cast_slice(set_b));
            Ok(())
        })?;
        self.stage("matching", |s, enc| s.encode_matching(enc, set_a.len(), set_b.len()))?;

        let counter: Vec<u32> = self.timed("copy D->H counter", |s| {
            s.gpu.read_back(s.buffers.counter()?, s.buffers.counter_readback()?, 4)
        })?;
        let reported = counter.first().copied().unwrap_or(0) as usize;
        let count = reported.min(self.buffers.capacity().matches);

        let pairs: Vec<IndexPair> = self.timed("copy D->H matches", |s| {
            s.gpu.read_back(
                s.buffers.matches()?,
                s.buffers.matches_readback()?,
                byte_size::<IndexPair>(count),
            )
        })?;

        let pairs = matching::finalize_pairs(pairs, set_a.len(), set_b.len());
        log::debug!(
            "match: |A|={} |B|={} -> {} accepted, {} returned in {:.2?}",
            set_a.len(),
            set_b.len(),
            reported,
            pairs.len(),
            start.elapsed()
        );
        Ok(matching::assemble(set_a, set_b, &pairs))
    }

    fn release(&mut self) {
        if !self.buffers.is_released() {
            log::debug!("releasing match plan resources");
        }
        self.kernels.release();
        self.buffers.release();
        self.roi = None;
    }
}

// ---------------------------------------------------------------------------
// Public plan
// ---------------------------------------------------------------------------

/// A reusable keypoint-matching plan bound to one device.
pub struct MatchPlan {
    state: Mutex<PlanState>,
    gpu: Arc<GpuDevice>,
    strategy: MatchingStrategy,
    workgroup_size: u32,
    degraded: bool,
}

impl MatchPlan {
    /// Select a device per `config.device` and build a plan on it.
    pub fn new(config: PlanConfig) -> Result<Self> {
        let gpu = Arc::new(GpuDevice::new(&config.device)?);
        Self::with_device(gpu, config)
    }

    /// Build a plan on an already-open device.
    ///
    /// # Errors
    /// `InvalidArgument` for a bad ratio or zero work-group ceiling,
    /// `KernelCompile` / `OutOfResources` from kernel and buffer setup.
    pub fn with_device(gpu: Arc<GpuDevice>, config: PlanConfig) -> Result<Self> {
        let match_ratio = validate_ratio(config.match_ratio)?;
        if config.max_workgroup_size == 0 {
            return Err(Error::InvalidArgument("max_workgroup_size must be at least 1".into()));
        }

        let strategy = MatchingStrategy::for_class(gpu.class);
        let kernels = KernelSet::build(&gpu, strategy, config.max_workgroup_size)?;
        let (workgroup_size, degraded) = {
            let k = kernels.matching()?;
            (k.workgroup_size, k.degraded)
        };

        let mut buffers = ResourceSet::allocate(&gpu, config.capacity)?;
        if let Some(roi) = &config.roi {
            buffers.set_roi(&gpu, roi)?;
        }

        log::info!(
            "match plan ready on {}: strategy {:?}, workgroup {}{}, capacity {}",
            gpu.adapter_info,
            strategy,
            workgroup_size,
            if degraded { " (degraded)" } else { "" },
            buffers.capacity().kp_a
        );

        let state = PlanState {
            gpu: Arc::clone(&gpu),
            kernels,
            buffers,
            roi: config.roi,
            match_ratio,
            profile: config.profile,
            events: Vec::new(),
        };
        Ok(MatchPlan { state: Mutex::new(state), gpu, strategy, workgroup_size, degraded })
    }

    /// Match every keypoint of `set_a` against `set_b`.
    ///
    /// Returns at most min(|A|, |B|) pairs in ascending A order. Each pair
    /// holds copies of the caller's keypoints.
    ///
    /// # Errors
    /// `Released` after [`release`](Self::release); `OutOfResources`,
    /// `Device` or `Readback` if the device fails. No partial result is
    /// ever returned.
    pub fn match_keypoints(&self, set_a: &[Keypoint], set_b: &[Keypoint]) -> Result<Vec<MatchPair>> {
        let mut state = self.state.lock();
        if state.buffers.is_released() {
            return Err(Error::Released);
        }
        state.run_match(set_a, set_b)
    }

    /// [`match_keypoints`](Self::match_keypoints) over raw keypoint records.
    ///
    /// # Errors
    /// `InvalidArgument` if either buffer is not a whole number of records.
    pub fn match_bytes(&self, set_a: &[u8], set_b: &[u8]) -> Result<Vec<MatchPair>> {
        let a = keypoints_from_bytes(set_a)?;
        let b = keypoints_from_bytes(set_b)?;
        self.match_keypoints(&a, &b)
    }

    /// Restrict set A to keypoints on non-zero pixels of `roi`.
    pub fn set_roi(&self, roi: RoiMask) -> Result<()> {
        let mut state = self.state.lock();
        let gpu = Arc::clone(&state.gpu);
        state.buffers.set_roi(&gpu, &roi)?;
        state.roi = Some(roi);
        Ok(())
    }

    pub fn unset_roi(&self) {
        let mut state = self.state.lock();
        state.buffers.clear_roi();
        state.roi = None;
    }

    pub fn roi_enabled(&self) -> bool {
        self.state.lock().roi.is_some()
    }

    pub fn roi(&self) -> Option<RoiMask> {
        self.state.lock().roi.clone()
    }

    /// Clear recorded profile events.
    pub fn reset_timer(&self) {
        self.state.lock().events.clear();
    }

    pub fn profile_events(&self) -> Vec<ProfileEvent> {
        self.state.lock().events.clone()
    }

    /// Free all device resources. Later calls to `release` do nothing;
    /// later matches return `Released`.
    pub fn release(&self) {
        self.state.lock().release();
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().buffers.is_released()
    }

    pub fn capacity(&self) -> Capacity {
        self.state.lock().buffers.capacity()
    }

    pub fn match_ratio(&self) -> f32 {
        self.state.lock().match_ratio
    }

    pub fn set_match_ratio(&self, ratio: f32) -> Result<()> {
        self.state.lock().match_ratio = validate_ratio(ratio)?;
        Ok(())
    }

    pub fn device(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    pub fn device_class(&self) -> DeviceClass {
        self.gpu.class
    }

    pub fn strategy(&self) -> MatchingStrategy {
        self.strategy
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    /// True if the matching kernel was built at its fallback work-group size.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

impl Drop for MatchPlan {
    fn drop(&mut self) {
        self.state.get_mut().release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
