// gpu/buffers.rs — Device resource set owned by one matching plan.
//
// Buffers:
//   kp_a, kp_b           keypoints of set A / set B        STORAGE | COPY_DST
//   matches              (i32, i32) index pairs            STORAGE | COPY_SRC
//   counter              one u32, atomic in the kernel     STORAGE | COPY_SRC
//   roi                  packed u8 mask, or a 4-byte stub  STORAGE
//   *_readback           MAP_READ staging for the two outputs
//
// GROWTH
// ──────
// Capacities only ever grow. When an input exceeds a capacity, the buffer
// is reallocated to exactly the required size: the new allocation is made
// first, so a failed allocation leaves the old buffer (and the plan)
// usable, and only then is the old one destroyed. Growth is logged at
// warn level because it costs an allocation on the hot path.
//
// RELEASE
// ───────
// Every buffer sits in an Option. `release` takes and destroys each one,
// so a second release is a no-op and any later access reports `Released`.

use crate::error::{Error, Result};
use crate::gpu::device::{byte_size, GpuDevice};
use crate::keypoint::{IndexPair, Keypoint};
use crate::roi::RoiMask;

use wgpu::util::DeviceExt;

/// Current element capacities of the three growable buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub kp_a: usize,
    pub kp_b: usize,
    pub matches: usize,
}

/// Which growable buffer an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    KeypointsA,
    KeypointsB,
    Matches,
}

impl BufferKind {
    fn label(self) -> &'static str {
        match self {
            BufferKind::KeypointsA => "kp_a",
            BufferKind::KeypointsB => "kp_b",
            BufferKind::Matches => "matches",
        }
    }
}

/// Uploaded ROI mask plus its dimensions.
pub struct RoiBuffer {
    pub buffer: wgpu::Buffer,
    pub width: u32,
    pub height: u32,
}

pub struct ResourceSet {
    kp_a: Option<wgpu::Buffer>,
    kp_b: Option<wgpu::Buffer>,
    matches: Option<wgpu::Buffer>,
    matches_readback: Option<wgpu::Buffer>,
    counter: Option<wgpu::Buffer>,
    counter_readback: Option<wgpu::Buffer>,
    roi: Option<RoiBuffer>,
    roi_stub: Option<wgpu::Buffer>,
    capacity: Capacity,
}

fn create(gpu: &GpuDevice, label: &str, size: u64, usage: wgpu::BufferUsages) -> Result<wgpu::Buffer> {
    gpu.scoped(|| {
        Ok(gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            // Zero-sized bindings are invalid.
            size: size.max(4),
            usage,
            mapped_at_creation: false,
        }))
    })
}

const KEYPOINT_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE.union(wgpu::BufferUsages::COPY_DST);
const OUTPUT_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE.union(wgpu::BufferUsages::COPY_SRC);
const READBACK_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::MAP_READ.union(wgpu::BufferUsages::COPY_DST);

impl ResourceSet {
    /// Allocate every buffer at `capacity` elements (at least 1).
    pub fn allocate(gpu: &GpuDevice, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let kp_bytes = byte_size::<Keypoint>(capacity);
        let pair_bytes = byte_size::<IndexPair>(capacity);
        log::debug!("allocating resource set: capacity {capacity}, {} bytes", 2 * kp_bytes + 2 * pair_bytes + 8);

        Ok(ResourceSet {
            kp_a: Some(create(gpu, "kp_a", kp_bytes, KEYPOINT_USAGE)?),
            kp_b: Some(create(gpu, "kp_b", kp_bytes, KEYPOINT_USAGE)?),
            matches: Some(create(gpu, "matches", pair_bytes, OUTPUT_USAGE)?),
            matches_readback: Some(create(gpu, "matches_readback", pair_bytes, READBACK_USAGE)?),
            counter: Some(create(gpu, "counter", 4, OUTPUT_USAGE)?),
            counter_readback: Some(create(gpu, "counter_readback", 4, READBACK_USAGE)?),
            roi: None,
            roi_stub: Some(create(gpu, "roi_stub", 4, wgpu::BufferUsages::STORAGE)?),
            capacity: Capacity { kp_a: capacity, kp_b: capacity, matches: capacity },
        })
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn is_released(&self) -> bool {
        self.kp_a.is_none()
    }

    /// Grow `kind` to hold at least `required` elements.
    ///
    /// Returns true if a reallocation happened. On error the old buffer and
    /// its capacity are kept.
    pub fn ensure_capacity(&mut self, gpu: &GpuDevice, kind: BufferKind, required: usize) -> Result<bool> {
        if self.is_released() {
            return Err(Error::Released);
        }
        let current = match kind {
            BufferKind::KeypointsA => self.capacity.kp_a,
            BufferKind::KeypointsB => self.capacity.kp_b,
            BufferKind::Matches => self.capacity.matches,
        };
        if required <= current {
            return Ok(false);
        }
        log::warn!(
            "growing {} buffer from {current} to {required} elements",
            kind.label()
        );

        let bytes = match kind {
            BufferKind::KeypointsA | BufferKind::KeypointsB => byte_size::<Keypoint>(required),
            BufferKind::Matches => byte_size::<IndexPair>(required),
        };
        if bytes > gpu.max_storage_binding() {
            return Err(Error::OutOfResources(format!(
                "{required} {} elements need {bytes} bytes, device binding limit is {}",
                kind.label(),
                gpu.max_storage_binding()
            )));
        }

        match kind {
            BufferKind::KeypointsA => {
                replace(&mut self.kp_a, create(gpu, "kp_a", bytes, KEYPOINT_USAGE)?);
                self.capacity.kp_a = required;
            }
            BufferKind::KeypointsB => {
                replace(&mut self.kp_b, create(gpu, "kp_b", bytes, KEYPOINT_USAGE)?);
                self.capacity.kp_b = required;
            }
            BufferKind::Matches => {
                let fresh = create(gpu, "matches", bytes, OUTPUT_USAGE)?;
                let fresh_readback = create(gpu, "matches_readback", bytes, READBACK_USAGE)?;
                replace(&mut self.matches, fresh);
                replace(&mut self.matches_readback, fresh_readback);
                self.capacity.matches = required;
            }
        }
        Ok(true)
    }

    /// Upload `roi`, replacing any previous mask.
    pub fn set_roi(&mut self, gpu: &GpuDevice, roi: &RoiMask) -> Result<()> {
        if self.is_released() {
            return Err(Error::Released);
        }
        let words = roi.packed_words();
        if words.is_empty() {
            return Err(Error::InvalidArgument("ROI mask is empty".into()));
        }
        let buffer = gpu.scoped(|| {
            Ok(gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("roi"),
                contents: bytemuck::cast_slice(&words),
                usage: wgpu::BufferUsages::STORAGE,
            }))
        })?;
        self.clear_roi();
        self.roi = Some(RoiBuffer {
            buffer,
            width: roi.width() as u32,
            height: roi.height() as u32,
        });
        Ok(())
    }

    pub fn clear_roi(&mut self) {
        if let Some(old) = self.roi.take() {
            old.buffer.destroy();
        }
    }

    pub fn roi(&self) -> Option<&RoiBuffer> {
        self.roi.as_ref()
    }

    /// The buffer to bind at the ROI slot: the mask if set, else the stub.
    pub fn roi_binding(&self) -> Result<&wgpu::Buffer> {
        match &self.roi {
            Some(r) => Ok(&r.buffer),
            None => self.roi_stub.as_ref().ok_or(Error::Released),
        }
    }

    pub fn kp_a(&self) -> Result<&wgpu::Buffer> {
        self.kp_a.as_ref().ok_or(Error::Released)
    }

    pub fn kp_b(&self) -> Result<&wgpu::Buffer> {
        self.kp_b.as_ref().ok_or(Error::Released)
    }

    pub fn matches(&self) -> Result<&wgpu::Buffer> {
        self.matches.as_ref().ok_or(Error::Released)
    }

    pub fn matches_readback(&self) -> Result<&wgpu::Buffer> {
        self.matches_readback.as_ref().ok_or(Error::Released)
    }

    pub fn counter(&self) -> Result<&wgpu::Buffer> {
        self.counter.as_ref().ok_or(Error::Released)
    }

    pub fn counter_readback(&self) -> Result<&wgpu::Buffer> {
        self.counter_readback.as_ref().ok_or(Error::Released)
    }

    /// Destroy every buffer. Safe to call repeatedly.
    pub fn release(&mut self) {
        for slot in [
            &mut self.kp_a,
            &mut self.kp_b,
            &mut self.matches,
            &mut self.matches_readback,
            &mut self.counter,
            &mut self.counter_readback,
            &mut self.roi_stub,
        ] {
            if let Some(buffer) = slot.take() {
                buffer.destroy();
            }
        }
        self.clear_roi();
    }
}

/// Swap in `fresh` and destroy whatever was there.
fn replace(slot: &mut Option<wgpu::Buffer>, fresh: wgpu::Buffer) {
    if let Some(old) = slot.replace(fresh) {
        old.destroy();
    }
}
