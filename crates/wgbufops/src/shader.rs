//! Composition and compilation of the kernels.

use crate::composer::ComposerExt;
use crate::{Error, Result};
use naga_oil::compose::{ComposableModuleDescriptor, Composer, ShaderDefValue};
use std::borrow::Cow;
use std::collections::HashMap;
use wgpu::{ComputePipeline, ComputePipelineDescriptor, Device, ShaderModule};

const DISPATCH_WGSL: &str = include_str!("shaders/dispatch.wgsl");

/// Composes kernel sources against the shared `wgbufops::dispatch` module.
pub(crate) struct KernelCompiler {
    composer: Composer,
}

impl KernelCompiler {
    pub fn new() -> Self {
        Self {
            composer: Composer::default(),
        }
    }

    /// Composes, validates and uploads the kernel `source`.
    pub fn compile(
        &mut self,
        device: &Device,
        file_path: &str,
        source: &str,
        shader_defs: HashMap<String, ShaderDefValue>,
    ) -> Result<CompiledShader> {
        self.composer
            .add_composable_module_once(ComposableModuleDescriptor {
                source: DISPATCH_WGSL,
                file_path: "dispatch.wgsl",
                ..Default::default()
            })
            .map_err(|source| Error::ShaderComposition {
                path: "dispatch.wgsl".to_string(),
                source,
            })?;

        let naga_module = self
            .composer
            .make_validated_module(file_path, source, shader_defs)?;
        log::debug!("compiled kernel `{file_path}`");

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(file_path),
            source: wgpu::ShaderSource::Naga(Cow::Owned(naga_module.clone())),
        });

        Ok(CompiledShader {
            path: file_path.to_string(),
            module,
            naga_module,
        })
    }
}

/// A kernel module uploaded to the device, with its naga IR kept for reflection.
pub(crate) struct CompiledShader {
    path: String,
    module: ShaderModule,
    naga_module: naga::Module,
}

impl CompiledShader {
    /// Creates the pipeline of the entry point `entry_point`, with an automatic layout.
    pub fn pipeline(&self, device: &Device, entry_point: &str) -> ComputePipeline {
        device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: None,
            module: &self.module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        })
    }

    /// The array stride of the runtime-sized array bound at `(group, binding)`.
    pub fn array_stride(&self, group: u32, binding: u32) -> Option<u32> {
        let (_, global) = self.naga_module.global_variables.iter().find(|(_, var)| {
            var.binding
                .as_ref()
                .is_some_and(|b| b.group == group && b.binding == binding)
        })?;

        match self.naga_module.types[global.ty].inner {
            naga::TypeInner::Array { stride, .. } => Some(stride),
            _ => None,
        }
    }

    /// Checks that the element array at `(group, binding)` has the stride of `T`.
    pub fn check_element_stride<T>(&self, group: u32, binding: u32) -> Result<()> {
        let host = size_of::<T>();
        match self.array_stride(group, binding) {
            Some(shader) if shader as usize == host => Ok(()),
            Some(shader) => Err(Error::StrideMismatch { host, shader }),
            None => Err(Error::ShaderValidation {
                path: self.path.clone(),
                message: format!("no element array bound at group {group}, binding {binding}"),
            }),
        }
    }
}

/// The shader definition selecting the workgroup size of a kernel.
pub(crate) fn group_threads_defs(group_threads: u32) -> HashMap<String, ShaderDefValue> {
    HashMap::from([(
        "GROUP_THREADS".to_string(),
        ShaderDefValue::UInt(group_threads),
    )])
}
