use std::collections::HashMap;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::context::GpuContext;
use super::kernels::{Kernel, KernelLayout};
use super::readback::{read_buffer_cached, StagingBufferCache};
use super::{padded_size, BufferId, ComputeDevice};
use crate::solver::error::{DeviceError, DeviceErrorKind};

pub const WORKGROUP_SIZE: u32 = 64;
const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

fn shader_source(name: &str) -> Option<&'static str> {
    Some(match name {
        "fill" => include_str!("shaders/fill.wgsl"),
        "gather" => include_str!("shaders/gather.wgsl"),
        "product" => include_str!("shaders/product.wgsl"),
        "upwind_weight" => include_str!("shaders/upwind_weight.wgsl"),
        "fvm_ddt" => include_str!("shaders/fvm_ddt.wgsl"),
        "fvm_div" => include_str!("shaders/fvm_div.wgsl"),
        "fvm_laplacian" => include_str!("shaders/fvm_laplacian.wgsl"),
        "boundary_div" => include_str!("shaders/boundary_div.wgsl"),
        "boundary_laplacian" => include_str!("shaders/boundary_laplacian.wgsl"),
        "add_boundary_diag_src" => include_str!("shaders/add_boundary_diag_src.wgsl"),
        "fvc_grad_scalar" => include_str!("shaders/fvc_grad_scalar.wgsl"),
        "fvc_grad_vector" => include_str!("shaders/fvc_grad_vector.wgsl"),
        "dev2_transpose" => include_str!("shaders/dev2_transpose.wgsl"),
        "fvc_div_tensor" => include_str!("shaders/fvc_div_tensor.wgsl"),
        "fvc_div_face_scalar" => include_str!("shaders/fvc_div_face_scalar.wgsl"),
        "fvc_div_cell_vector" => include_str!("shaders/fvc_div_cell_vector.wgsl"),
        "fvc_div_flux" => include_str!("shaders/fvc_div_flux.wgsl"),
        "fvc_ddt" => include_str!("shaders/fvc_ddt.wgsl"),
        "add_cell_source" => include_str!("shaders/add_cell_source.wgsl"),
        "add_ldu_matrix" => include_str!("shaders/add_ldu_matrix.wgsl"),
        "compute_a" => include_str!("shaders/compute_a.wgsl"),
        "compute_h" => include_str!("shaders/compute_h.wgsl"),
        "face_flux" => include_str!("shaders/face_flux.wgsl"),
        "boundary_face_flux" => include_str!("shaders/boundary_face_flux.wgsl"),
        _ => return None,
    })
}

/// Splits `invocations` over a 2D grid so large meshes stay under the
/// per-dimension workgroup limit. Shaders rebuild the flat index as
/// `gid.x + gid.y * num_workgroups.x * 64`.
pub fn dispatch_dims(invocations: u32) -> (u32, u32) {
    let groups = invocations.div_ceil(WORKGROUP_SIZE).max(1);
    let x = groups.min(MAX_WORKGROUPS_PER_DIM);
    (x, groups.div_ceil(x))
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

#[derive(Default)]
struct State {
    buffers: HashMap<BufferId, GpuBuffer>,
    pipelines: HashMap<&'static str, (wgpu::ComputePipeline, wgpu::BindGroupLayout)>,
    next_id: BufferId,
    allocated: u64,
}

pub struct WgpuDevice {
    context: GpuContext,
    staging: StagingBufferCache,
    state: Mutex<State>,
}

impl WgpuDevice {
    pub fn new() -> Result<Self, DeviceError> {
        let context = pollster::block_on(GpuContext::new())?;
        Ok(Self {
            context,
            staging: StagingBufferCache::default(),
            state: Mutex::new(State::default()),
        })
    }

    /// Compiles and caches the pipeline for `layout.shader` on first use.
    fn ensure_pipeline(&self, state: &mut State, layout: &KernelLayout) -> Result<(), DeviceError> {
        if !state.pipelines.contains_key(layout.shader) {
            let source = shader_source(layout.shader).ok_or_else(|| {
                DeviceError::new(
                    "launch",
                    DeviceErrorKind::Unsupported(format!("no shader named {}", layout.shader)),
                )
            })?;
            let device = &self.context.device;
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(layout.shader),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

            let mut entries: Vec<wgpu::BindGroupLayoutEntry> = (0..layout.buffers.len() as u32)
                .map(|binding| wgpu::BindGroupLayoutEntry {
                    binding,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage {
                            read_only: binding >= layout.writable,
                        },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                })
                .collect();
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: layout.buffers.len() as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });

            let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(layout.shader),
                entries: &entries,
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(layout.shader),
                layout: Some(&device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(layout.shader),
                    bind_group_layouts: &[&bind_group_layout],
                    push_constant_ranges: &[],
                })),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
            log::debug!("compiled kernel {}", layout.shader);
            state
                .pipelines
                .insert(layout.shader, (pipeline, bind_group_layout));
        }
        Ok(())
    }

    fn lookup<'s>(state: &'s State, op: &'static str, id: BufferId) -> Result<&'s GpuBuffer, DeviceError> {
        state
            .buffers
            .get(&id)
            .ok_or_else(|| DeviceError::new(op, DeviceErrorKind::InvalidBuffer(id)))
    }

    fn check_range(state: &State, op: &'static str, id: BufferId, offset: u64, size: u64) -> Result<(), DeviceError> {
        let buffer = Self::lookup(state, op, id)?;
        if offset + size > buffer.size {
            return Err(DeviceError::new(
                op,
                DeviceErrorKind::SizeMismatch {
                    expected: buffer.size,
                    actual: offset + size,
                },
            ));
        }
        Ok(())
    }
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> String {
        format!("wgpu ({})", self.context.adapter_name)
    }

    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferId, DeviceError> {
        let padded = padded_size(size);
        let device = &self.context.device;
        if padded > device.limits().max_storage_buffer_binding_size as u64 {
            return Err(DeviceError::new(
                "create_buffer",
                DeviceErrorKind::OutOfMemory {
                    requested: padded,
                    available: device.limits().max_storage_buffer_binding_size as u64,
                },
            ));
        }

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            buffer.destroy();
            log::error!("allocation of {label} failed: {err}");
            return Err(DeviceError::new(
                "create_buffer",
                DeviceErrorKind::OutOfMemory {
                    requested: padded,
                    available: 0,
                },
            ));
        }

        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.allocated += padded;
        state.buffers.insert(id, GpuBuffer { buffer, size });
        Ok(id)
    }

    fn release_buffer(&self, id: BufferId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.buffers.remove(&id) {
            state.allocated -= padded_size(entry.size);
            entry.buffer.destroy();
        }
        if state.buffers.is_empty() {
            self.staging.clear();
        }
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let state = self.state.lock();
        Self::check_range(&state, "write_buffer", id, offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }
        self.context
            .queue
            .write_buffer(&state.buffers[&id].buffer, offset, data);
        Ok(())
    }

    fn copy_buffer(
        &self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        let state = self.state.lock();
        Self::check_range(&state, "copy_buffer", src, src_offset, size)?;
        Self::check_range(&state, "copy_buffer", dst, dst_offset, size)?;
        if size == 0 {
            return Ok(());
        }
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy") });
        encoder.copy_buffer_to_buffer(
            &state.buffers[&src].buffer,
            src_offset,
            &state.buffers[&dst].buffer,
            dst_offset,
            size,
        );
        self.context.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn launch(&self, kernel: &Kernel) -> Result<(), DeviceError> {
        let layout = kernel.layout();
        if layout.invocations == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        for &id in &layout.buffers {
            Self::lookup(&state, kernel.name(), id)?;
        }
        self.ensure_pipeline(&mut state, &layout)?;
        let state = &*state;
        let (pipeline, bind_group_layout) = &state.pipelines[layout.shader];

        let device = &self.context.device;
        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("launch params"),
            contents: bytemuck::bytes_of(&layout.params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries: Vec<wgpu::BindGroupEntry> = layout
            .buffers
            .iter()
            .enumerate()
            .map(|(binding, id)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: state.buffers[id].buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: layout.buffers.len() as u32,
            resource: params.as_entire_binding(),
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout: bind_group_layout,
            entries: &entries,
        });

        let (x, y) = dispatch_dims(layout.invocations);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(kernel.name()),
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name()),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(x, y, 1);
        }
        self.context.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_buffer(&self, id: BufferId, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock();
        Self::check_range(&state, "read_buffer", id, offset, size)?;
        if size == 0 {
            return Ok(Vec::new());
        }
        read_buffer_cached(
            &self.context,
            &self.staging,
            &state.buffers[&id].buffer,
            offset,
            size,
        )
    }

    fn sync(&self) -> Result<(), DeviceError> {
        self.context
            .device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| DeviceError::new("sync", DeviceErrorKind::Backend(e.to_string())))
    }

    fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated
    }
}
