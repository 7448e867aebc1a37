use std::collections::HashMap;

use parking_lot::Mutex;

use crate::solver::error::{DeviceError, DeviceErrorKind};
use crate::solver::gpu::context::GpuContext;

/// Reuses mappable staging buffers keyed by size.
#[derive(Default)]
pub struct StagingBufferCache {
    buffers: Mutex<HashMap<u64, wgpu::Buffer>>,
}

impl StagingBufferCache {
    pub fn take_or_create(&self, device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        if let Some(buffer) = self.buffers.lock().remove(&size) {
            return buffer;
        }
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    pub fn put(&self, size: u64, buffer: wgpu::Buffer) {
        self.buffers.lock().insert(size, buffer);
    }

    pub fn clear(&self) {
        for (_, buffer) in self.buffers.lock().drain() {
            buffer.destroy();
        }
    }
}

/// Copies `size` bytes at `offset` of `buffer` to the host, waiting for all
/// previously submitted work. `size` must be a multiple of 4.
pub fn read_buffer_cached(
    context: &GpuContext,
    cache: &StagingBufferCache,
    buffer: &wgpu::Buffer,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>, DeviceError> {
    let staging_buffer = cache.take_or_create(&context.device, size);

    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
    encoder.copy_buffer_to_buffer(buffer, offset, &staging_buffer, 0, size);
    context.queue.submit(Some(encoder.finish()));

    let slice = staging_buffer.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |v| {
        let _ = tx.send(v);
    });
    context
        .device
        .poll(wgpu::PollType::wait_indefinitely())
        .map_err(|e| DeviceError::new("read_buffer", DeviceErrorKind::Transfer(e.to_string())))?;

    rx.recv()
        .map_err(|e| DeviceError::new("read_buffer", DeviceErrorKind::Transfer(e.to_string())))?
        .map_err(|e| DeviceError::new("read_buffer", DeviceErrorKind::Transfer(e.to_string())))?;

    let data = slice.get_mapped_range();
    let result = data.to_vec();
    drop(data);
    staging_buffer.unmap();

    cache.put(size, staging_buffer);
    Ok(result)
}
