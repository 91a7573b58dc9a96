use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wgpu::{
    Adapter, Backends, DeviceDescriptor, Features, Instance, InstanceDescriptor, Queue,
    RequestAdapterOptions,
};

/// The graphics API, picked once when the context is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackend {
    /// Whatever wgpu considers first class on this platform.
    #[default]
    Primary,
    Vulkan,
    Dx12,
    Metal,
}

impl GraphicsBackend {
    pub fn backends(self) -> Backends {
        match self {
            GraphicsBackend::Primary => Backends::PRIMARY,
            GraphicsBackend::Vulkan => Backends::VULKAN,
            GraphicsBackend::Dx12 => Backends::DX12,
            GraphicsBackend::Metal => Backends::METAL,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    #[error("no {0:?} adapter available")]
    NoAdapter(GraphicsBackend),
    #[error("requesting a device failed: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// Owns the device and queue the mesh pools live on. Created once at startup
/// and handed to whatever needs GPU access; dropping it tears the device down.
pub struct GpuContext {
    pub instance: Instance,
    pub adapter: Adapter,
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<Queue>,
    pub backend: GraphicsBackend,
}

impl GpuContext {
    /// Creates a headless context, no surface is configured.
    pub async fn new(backend: GraphicsBackend) -> Result<Self, ContextError> {
        let instance = Instance::new(InstanceDescriptor {
            backends: backend.backends(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&RequestAdapterOptions::default())
            .await
            .ok_or(ContextError::NoAdapter(backend))?;

        log::info!("Using adapter {:?}", adapter.get_info().name);

        let device_descriptor = DeviceDescriptor {
            label: Some("Mesh pool device"),
            required_features: Features::default(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
        };

        let (device, queue) = adapter.request_device(&device_descriptor, None).await?;

        log::info!(
            "Maximum buffer size: {}MiB",
            device.limits().max_buffer_size / (2u64.pow(20))
        );

        Ok(Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            backend,
        })
    }
}
