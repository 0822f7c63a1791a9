// error.rs — crate-wide error type.
//
// Three groups, mirroring how callers should react:
//   construction-fatal  NoSuitableAdapter, AdapterIndexOutOfRange,
//                       DeviceRequest, KernelCompile
//   call-fatal          InvalidArgument, OutOfResources, Device, Readback,
//                       SingularSystem, Released
//   recoverable         never surfaces here; buffer growth and kernel
//                       fallback are logged with `log::warn!` instead.

use thiserror::Error;

/// Errors from device setup, matching and transform estimation.
#[derive(Debug, Error)]
pub enum Error {
    /// No adapter satisfies the requested device preference.
    #[error("no suitable compute adapter found for preference {preference}")]
    NoSuitableAdapter { preference: String },

    /// An explicit adapter index was out of range.
    #[error("adapter index {index} out of range ({available} adapters available)")]
    AdapterIndexOutOfRange { index: usize, available: usize },

    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    /// A required kernel failed to build.
    #[error("failed compiling kernel '{kernel}' with workgroup size {workgroup_size}: {message}")]
    KernelCompile {
        kernel: &'static str,
        workgroup_size: u32,
        message: String,
    },

    /// Input had the wrong shape or element type.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device ran out of memory while building or dispatching a kernel.
    #[error("device out of resources: {0}")]
    OutOfResources(String),

    /// Any other device runtime failure.
    #[error("device error: {0}")]
    Device(String),

    /// Mapping a readback buffer failed.
    #[error("readback failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),

    /// The affine normal equations have no unique solution.
    #[error("singular system: cannot fit an affine transform to {matches} matches")]
    SingularSystem { matches: usize },

    /// The plan's device resources were already released.
    #[error("match plan used after release")]
    Released,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Classify a wgpu error captured by an error scope.
    pub(crate) fn from_wgpu(err: wgpu::Error) -> Self {
        match err {
            wgpu::Error::OutOfMemory { .. } => Error::OutOfResources(err.to_string()),
            other => Error::Device(other.to_string()),
        }
    }

    /// True for the out-of-resources condition.
    pub fn is_out_of_resources(&self) -> bool {
        matches!(self, Error::OutOfResources(_))
    }
}
