// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate adapters and pick one by device-class preference
//     (GPU / CPU / auto) or by explicit index.
//   - Record the selected `DeviceClass` once. The matching plan uses it to
//     choose its kernel variant and never re-queries it per call.
//   - Expose the work-group ceiling every kernel build is clamped to.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power-preference heuristics and can
// hand back a software rasteriser (llvmpipe/lavapipe) even when a real GPU
// is present, or refuse a software adapter when that is what we want. We
// enumerate explicitly and rank by `DeviceType` instead:
//
//   Gpu   DiscreteGpu > IntegratedGpu > VirtualGpu > Other
//   Cpu   Cpu only
//   Auto  the Gpu tiers, then Cpu
//
// An explicit `adapter_index` (position in enumeration order) overrides the
// preference entirely.
//
// DEVICE LIMITS:
// We request the adapter's own limits rather than wgpu's defaults. The
// keypoint buffers grow with the input, so the larger
// `max_storage_buffer_binding_size` of real hardware matters here. A request
// may lower that one limit with `max_storage_binding`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Which kind of compute device the caller would like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    Gpu,
    Cpu,
    #[default]
    Auto,
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Gpu => write!(f, "GPU"),
            DevicePreference::Cpu => write!(f, "CPU"),
            DevicePreference::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for DevicePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(DevicePreference::Gpu),
            "cpu" => Ok(DevicePreference::Cpu),
            "auto" | "" => Ok(DevicePreference::Auto),
            other => Err(Error::InvalidArgument(format!(
                "unknown device preference '{other}' (expected gpu, cpu or auto)"
            ))),
        }
    }
}

/// Class of the device actually selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Gpu,
    Cpu,
}

impl DeviceClass {
    pub fn of(device_type: wgpu::DeviceType) -> Self {
        match device_type {
            wgpu::DeviceType::Cpu => DeviceClass::Cpu,
            _ => DeviceClass::Gpu,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Gpu => write!(f, "GPU"),
            DeviceClass::Cpu => write!(f, "CPU"),
        }
    }
}

/// How to find a device.
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub preference: DevicePreference,
    /// Index into the enumerated adapter list; overrides `preference`.
    pub adapter_index: Option<usize>,
    pub backends: wgpu::Backends,
    /// Upper bound in bytes on the storage binding size asked of the adapter.
    pub max_storage_binding: Option<u32>,
}

impl Default for DeviceRequest {
    fn default() -> Self {
        DeviceRequest {
            preference: DevicePreference::Auto,
            adapter_index: None,
            backends: wgpu::Backends::PRIMARY,
            max_storage_binding: None,
        }
    }
}

impl DeviceRequest {
    pub fn with_preference(preference: DevicePreference) -> Self {
        DeviceRequest { preference, ..Default::default() }
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl From<wgpu::AdapterInfo> for AdapterInfo {
    fn from(raw: wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: raw.name,
            vendor: raw.vendor,
            device: raw.device,
            device_type: raw.device_type,
            backend: raw.backend,
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The compute context: device, queue and what we learned about the adapter.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is declared
/// last so the `wgpu::Instance` outlives `device` and `queue`; some Vulkan
/// layers crash when the instance goes first.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub class: DeviceClass,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Select an adapter per `request` and open a device on it.
    ///
    /// # Errors
    /// `NoSuitableAdapter`, `AdapterIndexOutOfRange` or `DeviceRequest`.
    pub fn new(request: &DeviceRequest) -> Result<Self> {
        pollster::block_on(Self::init_async(request))
    }

    async fn init_async(request: &DeviceRequest) -> Result<Self> {
        let flags = if cfg!(debug_assertions) {
            // Validation layer in debug builds for shader error feedback.
            wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: request.backends,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(request.backends);
        for (i, a) in adapters.iter().enumerate() {
            let info = a.get_info();
            log::info!(
                "adapter {i}: {} ({:?}, {:?})",
                info.name, info.backend, info.device_type
            );
        }

        let available = adapters.len();
        let adapter = match request.adapter_index {
            Some(index) => adapters
                .into_iter()
                .nth(index)
                .ok_or(Error::AdapterIndexOutOfRange { index, available })?,
            None => adapters
                .into_iter()
                .filter_map(|a| {
                    adapter_rank(request.preference, a.get_info().device_type).map(|r| (r, a))
                })
                .min_by_key(|(r, _)| *r)
                .map(|(_, a)| a)
                .ok_or_else(|| Error::NoSuitableAdapter {
                    preference: request.preference.to_string(),
                })?,
        };

        let adapter_info = AdapterInfo::from(adapter.get_info());
        let class = DeviceClass::of(adapter_info.device_type);
        log::info!("selected {adapter_info} as {class} device");

        let mut limits = adapter.limits();
        if let Some(cap) = request.max_storage_binding {
            limits.max_storage_buffer_binding_size = limits.max_storage_buffer_binding_size.min(cap);
        }

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("sift-match"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        Ok(GpuDevice { device, queue, adapter_info, class, _instance: instance })
    }

    /// Largest 1-D work-group this device accepts.
    pub fn max_workgroup_size(&self) -> u32 {
        let limits = self.device.limits();
        limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x)
    }

    /// Largest single storage-buffer binding in bytes.
    pub fn max_storage_binding(&self) -> u64 {
        self.device.limits().max_storage_buffer_binding_size as u64
    }

    /// Run `f` inside out-of-memory, validation and internal error scopes.
    ///
    /// wgpu reports most failures asynchronously through the device error
    /// sink, and an uncaptured validation error panics. Everything that
    /// creates resources or submits work goes through here so failures come
    /// back as `Error` instead. The first captured error wins over `f`'s
    /// own result.
    pub fn scoped<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::Internal);

        let out = f();

        // Pop in reverse push order.
        let internal = pollster::block_on(self.device.pop_error_scope());
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());

        match oom.or(validation).or(internal) {
            Some(err) => Err(Error::from_wgpu(err)),
            None => out,
        }
    }

    /// Copy the first `bytes` of `src` into `staging` and read them back.
    ///
    /// `staging` must be `MAP_READ | COPY_DST` and at least `bytes` long.
    /// Blocks until the GPU has finished all previously submitted work.
    pub fn read_back<T: bytemuck::Pod>(
        &self,
        src: &wgpu::Buffer,
        staging: &wgpu::Buffer,
        bytes: u64,
    ) -> Result<Vec<T>> {
        if bytes == 0 {
            return Ok(Vec::new());
        }
        self.scoped(|| {
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
            encoder.copy_buffer_to_buffer(src, 0, staging, 0, bytes);
            self.queue.submit(std::iter::once(encoder.finish()));
            Ok(())
        })?;

        let slice = staging.slice(..bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::Device("readback callback dropped".into()))??;

        let data = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, T>(&mapped).to_vec()
        };
        staging.unmap();
        Ok(data)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, class: {}, max workgroup: {} }}",
            self.adapter_info,
            self.class,
            self.max_workgroup_size()
        )
    }
}

/// Rank an adapter for a preference; lower is better, None rejects it.
fn adapter_rank(preference: DevicePreference, device_type: wgpu::DeviceType) -> Option<u8> {
    let gpu_tier = match device_type {
        wgpu::DeviceType::DiscreteGpu => Some(0),
        wgpu::DeviceType::IntegratedGpu => Some(1),
        wgpu::DeviceType::VirtualGpu => Some(2),
        wgpu::DeviceType::Other => Some(3),
        wgpu::DeviceType::Cpu => None,
    };
    match preference {
        DevicePreference::Gpu => gpu_tier,
        DevicePreference::Cpu => (device_type == wgpu::DeviceType::Cpu).then_some(0),
        DevicePreference::Auto => gpu_tier.or(Some(4)),
    }
}

/// Number of work-groups needed to cover `n` items, one invocation each.
///
/// Uses ceiling division so every item is covered even when `n` is not a
/// multiple of the work-group size. The shader must guard:
/// ```wgsl
/// if gid.x >= n { return; }
/// ```
pub fn dispatch_count(n: u32, workgroup_size: u32) -> u32 {
    n.div_ceil(workgroup_size)
}

/// Bytes needed for `count` elements of `T`.
pub fn byte_size<T>(count: usize) -> u64 {
    (count * std::mem::size_of::<T>()) as u64
}
