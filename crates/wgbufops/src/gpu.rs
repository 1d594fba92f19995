use crate::EngineConfig;
use wgpu::{Adapter, Backends, Device, Instance, InstanceDescriptor, Limits, Queue};

/// The device and queue every engine records and submits its work to.
pub struct GpuInstance {
    _instance: Instance,
    adapter: Adapter,
    device: Device,
    queue: Queue,
}

impl GpuInstance {
    /// Initializes a device on any available backend.
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_backends(Backends::all()).await
    }

    /// Initializes a device on any available backend except OpenGL.
    pub async fn without_gl() -> anyhow::Result<Self> {
        Self::with_backends(Backends::all() & (!Backends::GL)).await
    }

    /// Initializes a device on the first high-performance adapter of `backends`.
    ///
    /// The device is requested with buffers of up to 1 GiB and workgroups of up to 512
    /// threads, lowered to what the adapter supports, so that the scan kernels can use their
    /// 512-threads variant where available. Every other limit keeps its `wgpu` default.
    pub async fn with_backends(backends: Backends) -> anyhow::Result<Self> {
        let instance_desc = InstanceDescriptor {
            backends,
            ..Default::default()
        };
        let instance = wgpu::Instance::new(&instance_desc);
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("no suitable GPU adapter: {e}"))?;
        log::info!("Using GPU: {:?}", adapter.get_info());

        let required_limits = Limits {
            max_buffer_size: 1 << 30,
            max_storage_buffer_binding_size: 1 << 30,
            max_compute_invocations_per_workgroup: 512,
            max_compute_workgroup_size_x: 512,
            ..Default::default()
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("wgbufops"),
                required_features: wgpu::Features::empty(),
                required_limits: clamp_limits(required_limits, &adapter.limits()),
                memory_hints: Default::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| anyhow::anyhow!("failed to request a device: {e}"))?;

        Ok(Self {
            _instance: instance,
            adapter,
            device,
            queue,
        })
    }

    /// The `wgpu` adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// The `wgpu` device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The `wgpu` queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// The engine configuration matching this device’s limits.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::from_limits(&self.device.limits())
    }
}

// Lowers every requested limit the adapter can’t provide.
fn clamp_limits(requested: Limits, supported: &Limits) -> Limits {
    Limits {
        max_buffer_size: requested.max_buffer_size.min(supported.max_buffer_size),
        max_storage_buffer_binding_size: requested
            .max_storage_buffer_binding_size
            .min(supported.max_storage_buffer_binding_size),
        max_compute_invocations_per_workgroup: requested
            .max_compute_invocations_per_workgroup
            .min(supported.max_compute_invocations_per_workgroup),
        max_compute_workgroup_size_x: requested
            .max_compute_workgroup_size_x
            .min(supported.max_compute_workgroup_size_x),
        ..requested
    }
}
