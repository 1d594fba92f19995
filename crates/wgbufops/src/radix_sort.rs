//! Stable least-significant-digit radix sort.
//!
//! Each pass sorts the elements by one 4-bit digit of their key (16 buckets), from the least to
//! the most significant digit. A pass runs three steps:
//!
//! 1. **Count**: each group of 128 elements counts its elements per bucket into a bucket-major
//!    table (`table[bucket * num_groups + group]`).
//! 2. **Scan**: the exclusive scan of the table gives each `(bucket, group)` pair the number of
//!    elements in smaller buckets, plus the elements of the same bucket in previous groups.
//! 3. **Scatter**: each group sorts its elements locally by digit, then writes them at their
//!    scanned offset.
//!
//! Passes alternate between the sorted buffer and an engine-owned buffer of the same size.

use crate::element::substitute_element;
use crate::gpu::GpuInstance;
use crate::kernel::{dispatch_windows, CommandEncoderExt, GpuDispatchParams, WindowParams};
use crate::shader::KernelCompiler;
use crate::tensor::{reserve_vector, GpuVector};
use crate::{DispatchBatcher, EngineConfig, Error, GpuElement, Result, ScanEngine};
use std::collections::HashMap;
use std::marker::PhantomData;
use wgpu::{BufferUsages, CommandEncoder, ComputePipeline, Device};

const RADIX_SORT_WGSL: &str = include_str!("shaders/radix_sort.wgsl");

// NOTE: must match the values from `radix_sort.wgsl`.
const GROUP_THREADS: u32 = 128;
/// The number of key bits sorted by one pass.
pub const BITS_PER_PASS: u32 = 4;
/// The number of buckets of one pass.
pub const BUCKETS: u32 = 1 << BITS_PER_PASS;

/// The number of bits needed to represent `value`.
///
/// `bits_required(0) == 0`.
pub fn bits_required(value: u32) -> u32 {
    u32::BITS - value.leading_zeros()
}

/// The number of passes needed to sort keys no greater than `max_key`.
pub fn num_radix_passes(max_key: u32) -> u32 {
    bits_required(max_key).div_ceil(BITS_PER_PASS)
}

struct RadixSortKernels<T> {
    count_buckets: ComputePipeline,
    scatter: ComputePipeline,
    batcher: DispatchBatcher,
    phantom: PhantomData<T>,
}

impl<T: GpuElement> RadixSortKernels<T> {
    fn compile(device: &Device, config: &EngineConfig) -> Result<Self> {
        let config = config.clamped_to(&device.limits());
        let src = substitute_element::<T>(RADIX_SORT_WGSL);
        let shader =
            KernelCompiler::new().compile(device, "radix_sort.wgsl", &src, HashMap::new())?;
        shader.check_element_stride::<T>(0, 1)?;

        Ok(Self {
            count_buckets: shader.pipeline(device, "count_buckets"),
            scatter: shader.pipeline(device, "scatter"),
            batcher: DispatchBatcher::from_config(&config),
            phantom: PhantomData,
        })
    }

    fn get_or_compile<'a>(
        slot: &'a mut Option<Self>,
        device: &Device,
        config: &EngineConfig,
    ) -> Result<&'a Self> {
        let kernels = match slot.take() {
            Some(kernels) => kernels,
            None => Self::compile(device, config)?,
        };
        let kernels: &Self = slot.insert(kernels);
        Ok(kernels)
    }
}

/// Stable ascending sort of a buffer of `T` by the `u32` key of its elements.
///
/// Only the [`num_radix_passes`]`(max_key)` least significant digits of the keys are sorted:
/// every key must be at most the `max_key` given to [`RadixSortEngine::dispatch`].
pub struct RadixSortEngine<T: GpuElement> {
    config: EngineConfig,
    scan: ScanEngine,
    kernels: Option<RadixSortKernels<T>>,
    pong: Option<GpuVector<T>>,
    bucket_offsets: Option<GpuVector<u32>>,
    window_params: WindowParams,
}

impl<T: GpuElement> Default for RadixSortEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: GpuElement> RadixSortEngine<T> {
    /// An engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// An engine with the given configuration, clamped to the device limits on first use.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            scan: ScanEngine::with_config(config),
            kernels: None,
            pong: None,
            bucket_offsets: None,
            window_params: WindowParams::default(),
        }
    }

    /// Compiles the sort kernels if they haven’t been compiled yet.
    ///
    /// Fails with [`Error::StrideMismatch`] if the size of `T` doesn’t match the array stride of
    /// its WGSL type.
    pub fn ensure_ready(&mut self, device: &Device) -> Result<()> {
        self.scan.ensure_ready(device)?;
        RadixSortKernels::get_or_compile(&mut self.kernels, device, &self.config)?;
        Ok(())
    }

    /// The number of scratch buffers sized after the sorted data, including the group sums of
    /// the inner scan.
    pub fn num_allocated_buffers(&self) -> usize {
        self.pong.is_some() as usize
            + self.bucket_offsets.is_some() as usize
            + self.scan.num_allocated_levels()
    }

    /// Frees every scratch buffer owned by this engine.
    ///
    /// The compiled kernels are kept.
    pub fn release(&mut self) {
        self.pong = None;
        self.bucket_offsets = None;
        self.window_params.clear();
        self.scan.release();
    }

    /// Records the sort of `data` into `encoder`.
    ///
    /// `data` needs the `STORAGE` usage, and `COPY_DST` if the number of passes is odd.
    /// A `max_key` of zero, or a buffer of at most one element, records nothing and releases
    /// the scratch buffers.
    pub fn dispatch(
        &mut self,
        device: &Device,
        encoder: &mut CommandEncoder,
        data: &GpuVector<T>,
        max_key: u32,
    ) -> Result<()> {
        let num_passes = num_radix_passes(max_key);
        data.check_usages(BufferUsages::STORAGE)?;
        if num_passes % 2 == 1 {
            data.check_usages(BufferUsages::COPY_DST)?;
        }
        let len = u32::try_from(data.len()).map_err(|_| Error::TooManyElements { len: data.len() })?;

        let kernels = RadixSortKernels::get_or_compile(&mut self.kernels, device, &self.config)?;
        self.scan.ensure_ready(device)?;

        if len <= 1 || num_passes == 0 {
            self.release();
            return Ok(());
        }

        let num_groups = len.div_ceil(GROUP_THREADS);
        let table_len = num_groups
            .checked_mul(BUCKETS)
            .ok_or(Error::TooManyElements { len: data.len() })?;
        self.window_params.track_len(len);
        let pong = reserve_vector(
            &mut self.pong,
            device,
            len,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            "radix sort pong",
        );
        let bucket_offsets = reserve_vector(
            &mut self.bucket_offsets,
            device,
            table_len,
            BufferUsages::STORAGE,
            "radix sort bucket offsets",
        );
        log::debug!("radix sort of {len} elements in {num_passes} passes");

        for pass_id in 0..num_passes {
            let (src, dst) = if pass_id % 2 == 0 {
                (data, pong)
            } else {
                (pong, data)
            };
            let params = GpuDispatchParams {
                num_elements: len,
                num_groups,
                shift: pass_id * BITS_PER_PASS,
                ..Default::default()
            };

            {
                let mut pass = encoder.compute_pass("radix_sort_count");
                dispatch_windows(
                    device,
                    &mut self.window_params,
                    &mut pass,
                    &kernels.count_buckets,
                    &kernels.batcher,
                    params,
                    &[(src.buffer(), 1), (bucket_offsets.buffer(), 3)],
                );
            }

            self.scan.dispatch(device, encoder, bucket_offsets, None)?;

            {
                let mut pass = encoder.compute_pass("radix_sort_scatter");
                dispatch_windows(
                    device,
                    &mut self.window_params,
                    &mut pass,
                    &kernels.scatter,
                    &kernels.batcher,
                    params,
                    &[
                        (src.buffer(), 1),
                        (dst.buffer(), 2),
                        (bucket_offsets.buffer(), 3),
                    ],
                );
            }
        }

        if num_passes % 2 == 1 {
            data.copy_from(encoder, pong);
        }

        Ok(())
    }

    /// Sorts `data` and submits the work to the queue.
    pub fn sort(&mut self, gpu: &GpuInstance, data: &GpuVector<T>, max_key: u32) -> Result<()> {
        let mut encoder = gpu.device().create_command_encoder(&Default::default());
        self.dispatch(gpu.device(), &mut encoder, data, max_key)?;
        gpu.queue().submit(Some(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{bits_required, num_radix_passes, RadixSortEngine, BUCKETS, GROUP_THREADS};
    use crate::scan::ScanPlan;
    use crate::tensor::GpuVector;
    use crate::test_utils::{read_vector, test_gpu};
    use crate::{EngineConfig, Error, GpuElement};
    use proptest::prelude::*;
    use rand::Rng;
    use wgpu::BufferUsages;

    const DATA_USAGES: BufferUsages = BufferUsages::STORAGE
        .union(BufferUsages::COPY_SRC)
        .union(BufferUsages::COPY_DST);

    #[test]
    fn pass_counts() {
        assert_eq!(bits_required(0), 0);
        assert_eq!(bits_required(1), 1);
        assert_eq!(bits_required(5), 3);
        assert_eq!(bits_required(u32::MAX), 32);

        assert_eq!(num_radix_passes(0), 0);
        assert_eq!(num_radix_passes(15), 1);
        assert_eq!(num_radix_passes(16), 2);
        assert_eq!(num_radix_passes(255), 2);
        assert_eq!(num_radix_passes(256), 3);
        assert_eq!(num_radix_passes(u32::MAX), 8);
    }

    proptest! {
        #[test]
        fn passes_cover_every_key_bit(max_key in 1u32..=u32::MAX) {
            let passes = num_radix_passes(max_key);
            prop_assert!(passes * 4 >= bits_required(max_key));
            prop_assert!((passes - 1) * 4 < bits_required(max_key));
            prop_assert!(max_key as u64 >> (passes * 4) == 0);
        }
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn sort_small_example() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        // (key, payload)
        let input = [[5u32, 0], [3, 1], [3, 2], [1, 3]];
        let data = GpuVector::init(gpu.device(), input, DATA_USAGES);
        let mut sort = RadixSortEngine::new();
        sort.sort(&gpu, &data, 5).unwrap();

        assert_eq!(
            read_vector(&gpu, &data).await,
            [[1, 3], [3, 1], [3, 2], [5, 0]]
        );
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn sort_random_inputs() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let mut rng = rand::rng();
        let mut sort = RadixSortEngine::new();

        for len in [2u32, 127, 129, 10_000, 1_000_000] {
            // One, two, three and eight passes.
            for max_key in [15, 255, 1000, u32::MAX] {
                let input: Vec<[u32; 2]> = (0..len)
                    .map(|i| [rng.random_range(0..=max_key), i])
                    .collect();
                let data = GpuVector::init(gpu.device(), &input, DATA_USAGES);
                sort.sort(&gpu, &data, max_key).unwrap();

                let mut expected = input.clone();
                expected.sort_by_key(|e| e[0]);
                assert_eq!(
                    read_vector(&gpu, &data).await,
                    expected,
                    "len: {len}, max key: {max_key}"
                );
            }
        }
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn sort_plain_keys_with_small_dispatch_windows() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let mut sort = RadixSortEngine::with_config(EngineConfig {
            max_groups_per_dispatch: 5,
            max_group_threads: 128,
        });
        let input: Vec<u32> = (0..20_000u32).map(|i| (i * 7919) % 4096).collect();
        let data = GpuVector::init(gpu.device(), &input, DATA_USAGES);
        sort.sort(&gpu, &data, 4095).unwrap();

        let mut expected = input.clone();
        expected.sort();
        assert_eq!(read_vector(&gpu, &data).await, expected);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn sorting_sorted_input_is_idempotent() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let input: Vec<[u32; 4]> = (0..5000u32).map(|i| [i / 3, i, 2 * i, 3 * i]).collect();
        let data = GpuVector::init(gpu.device(), &input, DATA_USAGES);
        let mut sort = RadixSortEngine::new();
        sort.sort(&gpu, &data, 5000 / 3).unwrap();
        assert_eq!(read_vector(&gpu, &data).await, input);
        sort.sort(&gpu, &data, 5000 / 3).unwrap();
        assert_eq!(read_vector(&gpu, &data).await, input);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn zero_max_key_is_a_no_op() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let input = [[0u32, 3], [0, 1], [0, 2]];
        let data = GpuVector::init(gpu.device(), input, DATA_USAGES);
        let mut sort = RadixSortEngine::new();
        sort.sort(&gpu, &data, 0).unwrap();
        assert_eq!(read_vector(&gpu, &data).await, input);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn odd_pass_count_needs_copy_dst() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let data = GpuVector::init(
            gpu.device(),
            [3u32, 2, 1],
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );
        let mut sort = RadixSortEngine::new();
        assert!(matches!(
            sort.sort(&gpu, &data, 3),
            Err(Error::MissingUsages { .. })
        ));

        // Two passes end in `data` without any copy.
        let input = [200u32, 2, 1, 128];
        let data = GpuVector::init(
            gpu.device(),
            input,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );
        sort.sort(&gpu, &data, 255).unwrap();
        assert_eq!(read_vector(&gpu, &data).await, [1, 2, 128, 200]);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn grow_then_shrink() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let mut rng = rand::rng();
        let mut sort = RadixSortEngine::new();
        for len in [10u32, 500_000, 1000, 3] {
            let input: Vec<[u32; 2]> =
                (0..len).map(|i| [rng.random_range(0..=255), i]).collect();
            let data = GpuVector::init(gpu.device(), &input, DATA_USAGES);
            sort.sort(&gpu, &data, 255).unwrap();

            let mut expected = input.clone();
            expected.sort_by_key(|e| e[0]);
            assert_eq!(read_vector(&gpu, &data).await, expected, "len: {len}");

            // Pong buffer, bucket offsets, and the scan levels of the bucket table.
            let table_len = len.div_ceil(GROUP_THREADS) * BUCKETS;
            let scan_levels = ScanPlan::new(table_len, sort.scan.max_group_threads()).len();
            assert_eq!(sort.num_allocated_buffers(), 2 + scan_levels, "len: {len}");
            assert_eq!(sort.pong.as_ref().map(|pong| pong.len()), Some(len as u64));
        }

        sort.release();
        assert_eq!(sort.num_allocated_buffers(), 0);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn no_op_sorts_release_scratch() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let mut sort = RadixSortEngine::new();
        let input: Vec<u32> = (0..100_000u32).rev().collect();
        let data = GpuVector::init(gpu.device(), &input, DATA_USAGES);
        sort.sort(&gpu, &data, 100_000).unwrap();
        assert!(sort.num_allocated_buffers() > 0);

        // A zero key range sorts nothing.
        sort.sort(&gpu, &data, 0).unwrap();
        assert_eq!(sort.num_allocated_buffers(), 0);
        assert_eq!(sort.window_params.len(), 0);

        sort.sort(&gpu, &data, 100_000).unwrap();
        assert!(sort.num_allocated_buffers() > 0);

        // Neither does a single element.
        let single = GpuVector::init(gpu.device(), [7u32], DATA_USAGES);
        sort.sort(&gpu, &single, 100_000).unwrap();
        assert_eq!(sort.num_allocated_buffers(), 0);
        assert_eq!(read_vector(&gpu, &single).await, [7]);
        assert_eq!(read_vector(&gpu, &data).await, (0..100_000).collect::<Vec<u32>>());
    }

    #[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Triple([u32; 3]);

    // `vec3<u32>` has an array stride of 16 bytes.
    impl GpuElement for Triple {
        const WGSL_TYPE: &'static str = "vec3<u32>";
        const WGSL_KEY: &'static str = "elt.x";

        fn key(&self) -> u32 {
            self.0[0]
        }
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn reject_stride_mismatch() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let mut sort = RadixSortEngine::<Triple>::new();
        assert!(matches!(
            sort.ensure_ready(gpu.device()),
            Err(Error::StrideMismatch {
                host: 12,
                shader: 16
            })
        ));

        let data = GpuVector::init(
            gpu.device(),
            [Triple([2, 0, 0]), Triple([1, 0, 0])],
            DATA_USAGES,
        );
        assert!(matches!(
            sort.sort(&gpu, &data, 2),
            Err(Error::StrideMismatch { .. })
        ));
    }
}
