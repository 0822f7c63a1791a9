// gpu/kernels.rs — Kernel policy table and compilation.
//
// Every kernel the plan needs is described once in `KERNELS`:
//
//   name          source       entries                  wg   on failure
//   matching_gpu  match.wgsl   matching                 64   retry at 16
//   matching_cpu  match.wgsl   matching                 16   fail
//   memset        memset.wgsl  memset_kp, memset_int   128   fail
//
// WORK-GROUP SIZE
// ───────────────
// The size actually compiled is min(preferred, plan ceiling, device limit)
// and is injected as the single build parameter by replacing
// `{{WORKGROUP_SIZE}}` in the WGSL source, the same templating the rest of
// the GPU code uses. A kernel whose policy allows it is rebuilt once with
// the reduced size if the first build fails; the plan then records the
// variant as degraded and logs a warning.
//
// The reduced matching build is the same kernel, entry point and bindings
// with fewer invocations per work-group. Each invocation still handles one
// A keypoint, so only the dispatch count changes and results are identical.
// That is why it counts as the reduced-capability path rather than a
// missing essential kernel: the plan still owns a working matching kernel
// and `is_degraded` reports the lower occupancy. A kernel whose rebuild also
// fails, or whose policy is `Fail`, makes construction fail.
//
// ERROR CAPTURE
// ─────────────
// Shader compilation and pipeline creation run inside `GpuDevice::scoped`.
// Out-of-memory is reported as `OutOfResources` and never retried. Any
// other captured error becomes `KernelCompile` with the kernel name and
// work-group size.

use crate::error::{Error, Result};
use crate::gpu::device::{DeviceClass, GpuDevice};

const MATCH_SHADER: &str = include_str!("../shaders/match.wgsl");
const MEMSET_SHADER: &str = include_str!("../shaders/memset.wgsl");

/// Placeholder substituted with the work-group size before compilation.
pub const WORKGROUP_PLACEHOLDER: &str = "{{WORKGROUP_SIZE}}";

/// What to do when a kernel fails to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Construction fails.
    Fail,
    /// Rebuild once with this work-group size.
    ReducedWorkgroup(u32),
}

/// One row of the kernel policy table.
#[derive(Debug, Clone, Copy)]
pub struct KernelSpec {
    pub name: &'static str,
    pub source: &'static str,
    pub entry_points: &'static [&'static str],
    pub workgroup_size: u32,
    pub fallback: Fallback,
}

pub const KERNELS: [KernelSpec; 3] = [
    KernelSpec {
        name: "matching_gpu",
        source: MATCH_SHADER,
        entry_points: &["matching"],
        workgroup_size: 64,
        fallback: Fallback::ReducedWorkgroup(16),
    },
    KernelSpec {
        name: "matching_cpu",
        source: MATCH_SHADER,
        entry_points: &["matching"],
        workgroup_size: 16,
        fallback: Fallback::Fail,
    },
    KernelSpec {
        name: "memset",
        source: MEMSET_SHADER,
        entry_points: &["memset_kp", "memset_int"],
        workgroup_size: 128,
        fallback: Fallback::Fail,
    },
];

/// Look up a row of `KERNELS` by name.
pub fn kernel_spec(name: &str) -> Option<&'static KernelSpec> {
    KERNELS.iter().find(|k| k.name == name)
}

/// Which matching kernel variant a plan runs, fixed at construction from
/// the selected device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingStrategy {
    Gpu,
    Cpu,
}

impl MatchingStrategy {
    pub fn for_class(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Gpu => MatchingStrategy::Gpu,
            DeviceClass::Cpu => MatchingStrategy::Cpu,
        }
    }

    pub fn kernel_name(self) -> &'static str {
        match self {
            MatchingStrategy::Gpu => "matching_gpu",
            MatchingStrategy::Cpu => "matching_cpu",
        }
    }
}

/// Work-group size actually compiled: min(preferred, ceiling, device limit),
/// never below 1.
pub fn effective_workgroup_size(preferred: u32, plan_max: u32, device_max: u32) -> u32 {
    preferred.min(plan_max).min(device_max).max(1)
}

/// Replace the work-group placeholder in a WGSL source.
pub fn specialize(source: &str, workgroup_size: u32) -> String {
    source.replace(WORKGROUP_PLACEHOLDER, &workgroup_size.to_string())
}

// ---------------------------------------------------------------------------
// Bind group layout helpers
// ---------------------------------------------------------------------------

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// A compute pipeline together with the layout its bind groups must match.
pub struct Pipeline {
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
}

fn build_pipeline(
    device: &wgpu::Device,
    module: &wgpu::ShaderModule,
    entry_point: &str,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> Pipeline {
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(entry_point),
        entries,
    });
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(entry_point),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry_point),
        layout: Some(&layout),
        module,
        entry_point,
        compilation_options: Default::default(),
        cache: None,
    });
    Pipeline { pipeline, bind_group_layout }
}

// ---------------------------------------------------------------------------
// Compiled kernels
// ---------------------------------------------------------------------------

/// The matching kernel, as built for this plan.
pub struct MatchingKernel {
    pub spec: &'static KernelSpec,
    pub workgroup_size: u32,
    /// True when the reduced-size fallback was taken.
    pub degraded: bool,
    pub pipeline: Pipeline,
}

/// The two reset entry points of memset.wgsl.
pub struct MemsetKernel {
    pub workgroup_size: u32,
    pub keypoints: Pipeline,
    pub ints: Pipeline,
}

/// All kernels a plan owns. Released kernels are `None`.
pub struct KernelSet {
    matching: Option<MatchingKernel>,
    memset: Option<MemsetKernel>,
}

impl KernelSet {
    /// Build the matching variant for `strategy` plus the memset family.
    ///
    /// # Errors
    /// `KernelCompile` for a required kernel with no (remaining) fallback,
    /// `OutOfResources` if the device ran out of memory.
    pub fn build(gpu: &GpuDevice, strategy: MatchingStrategy, max_workgroup_size: u32) -> Result<Self> {
        let spec = kernel_spec(strategy.kernel_name())
            .ok_or_else(|| Error::Device(format!("no kernel named {}", strategy.kernel_name())))?;
        let wg = effective_workgroup_size(spec.workgroup_size, max_workgroup_size, gpu.max_workgroup_size());
        let built = compile_with_policy(spec, wg, |wg| {
            try_compile(gpu, spec, wg, |device, module| {
                build_pipeline(
                    device,
                    module,
                    "matching",
                    &[
                        storage_entry(0, true),
                        storage_entry(1, true),
                        storage_entry(2, false),
                        storage_entry(3, false),
                        storage_entry(4, true),
                        uniform_entry(5),
                    ],
                )
            })
        })?;
        let matching = MatchingKernel {
            spec,
            workgroup_size: built.workgroup_size,
            degraded: built.degraded,
            pipeline: built.kernel,
        };

        let spec = kernel_spec("memset")
            .ok_or_else(|| Error::Device("no kernel named memset".into()))?;
        let wg = effective_workgroup_size(spec.workgroup_size, max_workgroup_size, gpu.max_workgroup_size());
        let built = compile_with_policy(spec, wg, |wg| {
            try_compile(gpu, spec, wg, |device, module| {
                (
                    build_pipeline(device, module, "memset_kp", &[storage_entry(0, false), uniform_entry(2)]),
                    build_pipeline(device, module, "memset_int", &[storage_entry(1, false), uniform_entry(2)]),
                )
            })
        })?;
        let (keypoints, ints) = built.kernel;
        let memset = MemsetKernel { workgroup_size: built.workgroup_size, keypoints, ints };

        log::debug!(
            "kernels built: {} (wg {}{}), memset (wg {})",
            matching.spec.name,
            matching.workgroup_size,
            if matching.degraded { ", degraded" } else { "" },
            memset.workgroup_size
        );

        Ok(KernelSet { matching: Some(matching), memset: Some(memset) })
    }

    pub fn matching(&self) -> Result<&MatchingKernel> {
        self.matching.as_ref().ok_or(Error::Released)
    }

    pub fn memset(&self) -> Result<&MemsetKernel> {
        self.memset.as_ref().ok_or(Error::Released)
    }

    /// Drop every pipeline. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.matching = None;
        self.memset = None;
    }
}

/// A kernel as produced by `compile_with_policy`.
#[derive(Debug)]
pub struct Built<T> {
    pub kernel: T,
    pub workgroup_size: u32,
    /// True when the first attempt failed and the fallback size was used.
    pub degraded: bool,
}

/// Build one kernel at `workgroup_size`, honouring `spec.fallback`.
///
/// `attempt` performs a single build at the given size. Out-of-memory is
/// returned as is; a `ReducedWorkgroup` fallback below `workgroup_size` is
/// tried exactly once, and its failure is final.
pub fn compile_with_policy<T>(
    spec: &KernelSpec,
    workgroup_size: u32,
    mut attempt: impl FnMut(u32) -> Result<T>,
) -> Result<Built<T>> {
    match attempt(workgroup_size) {
        Ok(kernel) => Ok(Built { kernel, workgroup_size, degraded: false }),
        Err(err) if err.is_out_of_resources() => Err(err),
        Err(err) => match spec.fallback {
            Fallback::ReducedWorkgroup(reduced) if reduced < workgroup_size => {
                log::warn!("{err}: retrying with workgroup size {reduced}");
                match attempt(reduced) {
                    Ok(kernel) => Ok(Built { kernel, workgroup_size: reduced, degraded: true }),
                    Err(err) => {
                        log::error!("{err}");
                        Err(err)
                    }
                }
            }
            _ => {
                log::error!("{err}");
                Err(err)
            }
        },
    }
}

fn try_compile<T>(
    gpu: &GpuDevice,
    spec: &'static KernelSpec,
    workgroup_size: u32,
    build: impl FnOnce(&wgpu::Device, &wgpu::ShaderModule) -> T,
) -> Result<T> {
    let source = specialize(spec.source, workgroup_size);
    let result = gpu.scoped(|| {
        let module = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(spec.name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        Ok(build(&gpu.device, &module))
    });
    result.map_err(|err| match err {
        Error::OutOfResources(_) => err,
        other => Error::KernelCompile {
            kernel: spec.name,
            workgroup_size,
            message: other.to_string(),
        },
    })
}
