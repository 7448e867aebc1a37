//! Device abstraction: one in-order command stream per data base.
//!
//! Uploads, copies and kernel launches are queued and execute in submission
//! order; `sync` blocks until everything queued so far has finished. Reads
//! are synchronous and imply a `sync`.

pub mod context;
pub mod host;
pub mod kernels;
pub mod readback;
pub mod wgpu_device;

use std::marker::PhantomData;
use std::sync::Arc;

use crate::solver::error::DeviceError;
use crate::solver::options::{BackendKind, SolverConfig};

pub use host::HostDevice;
pub use kernels::{CsrBindings, FaceBindings, Kernel, LinearSystem};
pub use wgpu_device::WgpuDevice;

pub type BufferId = u64;

/// Element types that may live in a device buffer.
pub trait DeviceScalar: bytemuck::Pod + Send + Sync + 'static {}

impl DeviceScalar for f64 {}

impl DeviceScalar for u32 {}

/// Typed handle to a device allocation. The allocation itself is owned by
/// the data base's buffer ledger; handles are plain copyable references.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    id: BufferId,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DeviceBuffer<T> {}

impl<T> PartialEq for DeviceBuffer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.len == other.len
    }
}

impl<T> Eq for DeviceBuffer<T> {}

impl<T: DeviceScalar> DeviceBuffer<T> {
    pub(crate) fn from_raw(id: BufferId, len: usize) -> Self {
        Self {
            id,
            len,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }
}

/// Minimum allocation so empty arrays still bind.
pub const MIN_BUFFER_BYTES: u64 = 16;

pub fn padded_size(bytes: u64) -> u64 {
    bytes.max(MIN_BUFFER_BYTES).next_multiple_of(8)
}

pub trait ComputeDevice: Send + Sync {
    fn name(&self) -> String;

    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferId, DeviceError>;

    /// Frees the allocation. Pending work that references it is drained first.
    fn release_buffer(&self, id: BufferId);

    /// Queues a host-to-device copy. `data` is staged immediately, so the caller
    /// may reuse it once this returns.
    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn copy_buffer(
        &self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError>;

    fn launch(&self, kernel: &Kernel) -> Result<(), DeviceError>;

    /// Blocking device-to-host copy, ordered after all queued work.
    fn read_buffer(&self, id: BufferId, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError>;

    fn sync(&self) -> Result<(), DeviceError>;

    fn live_buffers(&self) -> usize;

    fn allocated_bytes(&self) -> u64;
}

/// Opens the backend named in the config.
pub fn open_device(config: &SolverConfig) -> Result<Arc<dyn ComputeDevice>, DeviceError> {
    match config.backend {
        BackendKind::Host => {
            let device = match config.memory_limit_bytes {
                Some(limit) => HostDevice::with_memory_limit(limit),
                None => HostDevice::new(),
            };
            Ok(Arc::new(device))
        }
        BackendKind::Wgpu => Ok(Arc::new(WgpuDevice::new()?)),
    }
}
