use crate::gpu::GpuInstance;
use crate::tensor::GpuVector;
use bytemuck::Pod;
use std::ffi::OsStr;
use wgpu::BufferUsages;

/// Set this environment variable to skip the GPU tests on machines without an adapter.
pub const SKIP_GPU_TESTS_VAR: &str = "WGBUFOPS_SKIP_GPU_TESTS";

/// The device used by the GPU tests.
///
/// Panics if no adapter is available, unless [`SKIP_GPU_TESTS_VAR`] is set, in which case the
/// test is skipped by returning `None`.
pub async fn test_gpu() -> Option<GpuInstance> {
    match GpuInstance::new().await {
        Ok(gpu) => Some(gpu),
        Err(e) if skip_gpu_tests() => {
            log::warn!("skipping GPU test, no device available: {e}");
            None
        }
        Err(e) => panic!("no GPU device available ({e}), set {SKIP_GPU_TESTS_VAR}=1 to skip"),
    }
}

fn skip_gpu_tests() -> bool {
    skip_requested(std::env::var_os(SKIP_GPU_TESTS_VAR).as_deref())
}

fn skip_requested(value: Option<&OsStr>) -> bool {
    value.is_some_and(|value| !value.is_empty() && value != "0")
}

/// Copies `vector` to a staging buffer and reads it back.
///
/// `vector` must have the `COPY_SRC` usage.
pub async fn read_vector<T: Pod>(gpu: &GpuInstance, vector: &GpuVector<T>) -> Vec<T> {
    let staging = GpuVector::uninit(
        gpu.device(),
        vector.len() as u32,
        BufferUsages::MAP_READ | BufferUsages::COPY_DST,
    );
    let mut encoder = gpu.device().create_command_encoder(&Default::default());
    staging.copy_from(&mut encoder, vector);
    gpu.queue().submit(Some(encoder.finish()));
    staging.read(gpu.device()).await.unwrap()
}

#[cfg(test)]
mod test {
    use super::skip_requested;
    use std::ffi::OsStr;

    #[test]
    fn gpu_tests_run_unless_skip_is_requested() {
        assert!(!skip_requested(None));
        assert!(!skip_requested(Some(OsStr::new(""))));
        assert!(!skip_requested(Some(OsStr::new("0"))));
        assert!(skip_requested(Some(OsStr::new("1"))));
        assert!(skip_requested(Some(OsStr::new("true"))));
    }
}
