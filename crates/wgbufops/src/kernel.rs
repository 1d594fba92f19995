use crate::tensor::GpuScalar;
use crate::DispatchBatcher;
use std::collections::HashMap;
use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, Buffer, BufferUsages, CommandEncoder,
    ComputePass, ComputePassDescriptor, ComputePipeline, Device,
};

/// Extension trait for opening labeled compute passes.
pub trait CommandEncoderExt {
    /// Begins a compute pass labeled `label`.
    fn compute_pass<'encoder>(&'encoder mut self, label: &str) -> ComputePass<'encoder>;
}

impl CommandEncoderExt for CommandEncoder {
    fn compute_pass<'encoder>(&'encoder mut self, label: &str) -> ComputePass<'encoder> {
        self.begin_compute_pass(&ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        })
    }
}

/// Uniform parameters shared by every kernel of this crate.
///
/// Must match the `DispatchParams` struct from `dispatch.wgsl`.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable,
)]
#[repr(C)]
pub struct GpuDispatchParams {
    /// Number of valid elements in the processed buffer.
    pub num_elements: u32,
    /// Number of logical groups covering `num_elements`.
    pub num_groups: u32,
    /// Index of the first group of the current dispatch window.
    pub group_offset: u32,
    /// Bit shift applied to keys before extracting a radix digit.
    pub shift: u32,
    /// First threshold of comparison predicates.
    pub threshold_lo: u32,
    /// Second threshold of comparison predicates.
    pub threshold_hi: u32,
    /// Padding to a 16-bytes multiple.
    pub padding: [u32; 2],
}

/// Builder recording a single compute dispatch.
///
/// Bind groups are created against the pipeline’s automatic layout, so every binding bound
/// here must be statically used by the kernel’s entry point.
pub struct KernelDispatch<'a, 'pass> {
    device: &'a Device,
    pass: &'a mut ComputePass<'pass>,
    pipeline: &'a ComputePipeline,
    bind_groups: Vec<(u32, BindGroup)>,
}

impl<'a, 'pass> KernelDispatch<'a, 'pass> {
    /// Starts recording a dispatch of `pipeline` into `pass`.
    pub fn new(
        device: &'a Device,
        pass: &'a mut ComputePass<'pass>,
        pipeline: &'a ComputePipeline,
    ) -> Self {
        Self {
            device,
            pass,
            pipeline,
            bind_groups: vec![],
        }
    }

    /// Binds `(buffer, binding)` pairs in the bind group `group`.
    pub fn bind_at<'b>(
        mut self,
        group: u32,
        entries: impl IntoIterator<Item = (&'b Buffer, u32)>,
    ) -> Self {
        let layout = self.pipeline.get_bind_group_layout(group);
        let entries: Vec<_> = entries
            .into_iter()
            .map(|(buffer, binding)| BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: None,
            layout: &layout,
            entries: &entries,
        });
        self.bind_groups.push((group, bind_group));
        self
    }

    /// Records the dispatch of `workgroups` workgroups along the x axis.
    pub fn dispatch(self, workgroups: u32) {
        self.pass.set_pipeline(self.pipeline);
        for (group, bind_group) in &self.bind_groups {
            self.pass.set_bind_group(*group, bind_group, &[]);
        }
        self.pass.dispatch_workgroups(workgroups, 1, 1);
    }
}

// Past this many distinct values, the cached uniforms are dropped and recreated on demand.
const MAX_CACHED_WINDOW_PARAMS: usize = 1024;

/// The uniform buffers holding the parameters of the dispatch windows recorded by an engine.
///
/// There is one buffer per distinct parameter value and it is never written after creation,
/// so windows recorded before the same submission each read their own parameters. Dispatching
/// the same buffer length again reuses the existing buffers.
#[derive(Default)]
pub(crate) struct WindowParams {
    buffers: HashMap<GpuDispatchParams, GpuScalar<GpuDispatchParams>>,
    num_elements: Option<u32>,
}

impl WindowParams {
    /// The number of uniform buffers currently cached.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Drops every cached uniform buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.num_elements = None;
    }

    /// Drops the cached uniforms if they were created for another buffer length.
    pub fn track_len(&mut self, num_elements: u32) {
        if self.num_elements != Some(num_elements) {
            self.clear();
            self.num_elements = Some(num_elements);
        }
    }

    fn get_or_init(&mut self, device: &Device, params: GpuDispatchParams) -> &Buffer {
        if self.buffers.len() >= MAX_CACHED_WINDOW_PARAMS && !self.buffers.contains_key(&params)
        {
            log::debug!("dropping {} cached window parameters", self.buffers.len());
            self.buffers.clear();
        }

        self.buffers
            .entry(params)
            .or_insert_with(|| GpuScalar::init(device, params, BufferUsages::UNIFORM))
            .buffer()
    }
}

/// Records `params.num_groups` groups of `pipeline`, split in windows by `batcher`.
///
/// Each window binds the uniform of `cache` holding `params` with the window’s `group_offset`
/// (group 0, binding 0). The remaining `bindings` are shared by every window.
pub(crate) fn dispatch_windows(
    device: &Device,
    cache: &mut WindowParams,
    pass: &mut ComputePass,
    pipeline: &ComputePipeline,
    batcher: &DispatchBatcher,
    params: GpuDispatchParams,
    bindings: &[(&Buffer, u32)],
) {
    for window in batcher.windows(params.num_groups) {
        log::trace!(
            "dispatching groups {}..{} of {}",
            window.group_offset,
            window.group_offset + window.num_groups,
            params.num_groups
        );
        let window_params = cache.get_or_init(
            device,
            GpuDispatchParams {
                group_offset: window.group_offset,
                ..params
            },
        );
        KernelDispatch::new(device, pass, pipeline)
            .bind_at(
                0,
                std::iter::once((window_params, 0)).chain(bindings.iter().copied()),
            )
            .dispatch(window.num_groups);
    }
}
