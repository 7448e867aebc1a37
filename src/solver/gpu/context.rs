use crate::solver::error::{DeviceError, DeviceErrorKind};

/// Storage bindings needed by the widest assembly kernel.
pub const MIN_STORAGE_BUFFERS: u32 = 16;

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
}

impl GpuContext {
    pub async fn new() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| DeviceError::new("request_adapter", DeviceErrorKind::Backend(e.to_string())))?;

        // Every kernel works in double precision.
        if !adapter.features().contains(wgpu::Features::SHADER_F64) {
            return Err(DeviceError::new(
                "request_adapter",
                DeviceErrorKind::Unsupported("adapter lacks SHADER_F64".into()),
            ));
        }

        let adapter_limits = adapter.limits();
        if adapter_limits.max_storage_buffers_per_shader_stage < MIN_STORAGE_BUFFERS {
            return Err(DeviceError::new(
                "request_adapter",
                DeviceErrorKind::Unsupported(format!(
                    "adapter allows {} storage buffers per stage, need {}",
                    adapter_limits.max_storage_buffers_per_shader_stage, MIN_STORAGE_BUFFERS
                )),
            ));
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("dfmatrix"),
                required_features: wgpu::Features::SHADER_F64,
                required_limits: wgpu::Limits {
                    max_storage_buffers_per_shader_stage: MIN_STORAGE_BUFFERS,
                    // Use adapter's max buffer size to support large meshes
                    max_buffer_size: adapter_limits.max_buffer_size,
                    max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                    ..wgpu::Limits::downlevel_defaults()
                },
                memory_hints: wgpu::MemoryHints::default(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| DeviceError::new("request_device", DeviceErrorKind::Backend(e.to_string())))?;

        let adapter_name = adapter.get_info().name;
        log::info!("opened wgpu adapter {adapter_name}");
        Ok(Self {
            device,
            queue,
            adapter_name,
        })
    }
}
