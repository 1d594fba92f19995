//! Stable stream compaction.
//!
//! Every group of 128 elements is first partitioned locally (predicate-true elements first) into
//! a temporary buffer, while counting its true elements. These counts are then scanned to give
//! each group the number of true elements of all the groups before it, and a final shuffle
//! writes every element to its global position:
//!
//! - the `r`-th true element of group `g` lands at `true_before(g) + r`.
//! - the `r`-th false element of group `g` lands at
//!   `total_true + (g × 128 − true_before(g)) + r`.

use crate::element::substitute_element;
use crate::gpu::GpuInstance;
use crate::kernel::{dispatch_windows, CommandEncoderExt, GpuDispatchParams, WindowParams};
use crate::shader::KernelCompiler;
use crate::tensor::{reserve_vector, GpuScalar, GpuVector, ScalarDest};
use crate::{DispatchBatcher, EngineConfig, Error, GpuElement, Result, ScanEngine};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use wgpu::{BufferUsages, CommandEncoder, ComputePipeline, Device};

const FILTER_WGSL: &str = include_str!("shaders/filter.wgsl");

/// The number of elements processed by one group of the filter kernels.
pub const FILTER_GROUP_ELEMENTS: u32 = 128;

/// A test selecting the elements gathered at the front of the buffer.
///
/// Comparisons apply to the `u32` key of each element (see [`GpuElement::WGSL_KEY`]). Their
/// thresholds are passed to the kernels as uniforms, so changing a threshold doesn’t compile
/// anything new.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// `key == value`
    Equal(u32),
    /// `key != value`
    NotEqual(u32),
    /// `key < value`
    Less(u32),
    /// `key <= value`
    LessEqual(u32),
    /// `key > value`
    Greater(u32),
    /// `key >= value`
    GreaterEqual(u32),
    /// `lo <= key <= hi`
    Between(u32, u32),
    /// The body of a custom WGSL function returning a `bool`.
    ///
    /// The body can read the element `elt` (of type [`GpuElement::WGSL_TYPE`]) and its key
    /// `key`, and must end with a `return` statement. Each distinct body is compiled into its
    /// own pipelines.
    Wgsl(String),
}

impl Predicate {
    /// A custom predicate from the body of a WGSL function.
    pub fn wgsl(body: impl Into<String>) -> Self {
        Self::Wgsl(body.into())
    }

    /// The WGSL body of the `predicate` function.
    pub fn wgsl_body(&self) -> &str {
        match self {
            Self::Equal(_) => "return key == params.threshold_lo;",
            Self::NotEqual(_) => "return key != params.threshold_lo;",
            Self::Less(_) => "return key < params.threshold_lo;",
            Self::LessEqual(_) => "return key <= params.threshold_lo;",
            Self::Greater(_) => "return key > params.threshold_lo;",
            Self::GreaterEqual(_) => "return key >= params.threshold_lo;",
            Self::Between(..) => {
                "return key >= params.threshold_lo && key <= params.threshold_hi;"
            }
            Self::Wgsl(body) => body,
        }
    }

    /// The `(threshold_lo, threshold_hi)` uniforms read by [`Self::wgsl_body`].
    pub fn thresholds(&self) -> [u32; 2] {
        match *self {
            Self::Equal(v)
            | Self::NotEqual(v)
            | Self::Less(v)
            | Self::LessEqual(v)
            | Self::Greater(v)
            | Self::GreaterEqual(v) => [v, 0],
            Self::Between(lo, hi) => [lo, hi],
            Self::Wgsl(_) => [0, 0],
        }
    }

    /// Evaluates this predicate on the host.
    ///
    /// Returns `None` for [`Predicate::Wgsl`].
    pub fn evaluate(&self, key: u32) -> Option<bool> {
        match *self {
            Self::Equal(v) => Some(key == v),
            Self::NotEqual(v) => Some(key != v),
            Self::Less(v) => Some(key < v),
            Self::LessEqual(v) => Some(key <= v),
            Self::Greater(v) => Some(key > v),
            Self::GreaterEqual(v) => Some(key >= v),
            Self::Between(lo, hi) => Some(key >= lo && key <= hi),
            Self::Wgsl(_) => None,
        }
    }
}

struct FilterPipelines {
    local_sort: ComputePipeline,
    global_shuffle: ComputePipeline,
}

struct FilterKernels {
    compiler: KernelCompiler,
    batcher: DispatchBatcher,
    // Keyed by predicate body.
    pipelines: HashMap<String, FilterPipelines>,
}

impl FilterKernels {
    fn new(device: &Device, config: &EngineConfig) -> Self {
        let config = config.clamped_to(&device.limits());
        Self {
            compiler: KernelCompiler::new(),
            batcher: DispatchBatcher::from_config(&config),
            pipelines: HashMap::new(),
        }
    }

    fn pipelines<T: GpuElement>(
        &mut self,
        device: &Device,
        predicate: &Predicate,
    ) -> Result<&FilterPipelines> {
        let body = predicate.wgsl_body();
        let pipelines: &FilterPipelines = match self.pipelines.entry(body.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let src =
                    substitute_element::<T>(FILTER_WGSL).replace("PREDICATE_BODY", body);
                let shader = self
                    .compiler
                    .compile(device, "filter.wgsl", &src, HashMap::new())?;
                shader.check_element_stride::<T>(0, 1)?;
                log::debug!(
                    "compiled filter kernels for `{}` with predicate `{body}`",
                    T::WGSL_TYPE
                );

                entry.insert(FilterPipelines {
                    local_sort: shader.pipeline(device, "local_sort"),
                    global_shuffle: shader.pipeline(device, "global_shuffle"),
                })
            }
        };
        Ok(pipelines)
    }
}

/// Stable partition of a buffer of `T`, moving the elements matching a [`Predicate`] to its
/// front.
///
/// The engine owns a temporary copy of the data, the per-group true counts and their scan, and
/// the total number of true elements. They are reallocated whenever the length of the filtered
/// buffer changes, and released when it becomes empty.
pub struct FilterEngine<T: GpuElement> {
    config: EngineConfig,
    scan: ScanEngine,
    kernels: Option<FilterKernels>,
    temp: Option<GpuVector<T>>,
    group_sums: Option<GpuVector<u32>>,
    global_prefix_sums: Option<GpuVector<u32>>,
    true_count: Option<GpuVector<u32>>,
    window_params: WindowParams,
    readback: Option<GpuScalar<u32>>,
}

impl<T: GpuElement> Default for FilterEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: GpuElement> FilterEngine<T> {
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
            temp: None,
            group_sums: None,
            global_prefix_sums: None,
            true_count: None,
            window_params: WindowParams::default(),
            readback: None,
        }
    }

    /// Compiles the kernels needed to filter with `predicate`, if they haven’t been compiled
    /// yet.
    ///
    /// Fails with [`Error::StrideMismatch`] if the size of `T` doesn’t match the array stride of
    /// its WGSL type.
    pub fn ensure_ready(&mut self, device: &Device, predicate: &Predicate) -> Result<()> {
        self.scan.ensure_ready(device)?;
        let config = self.config;
        self.kernels
            .get_or_insert_with(|| FilterKernels::new(device, &config))
            .pipelines::<T>(device, predicate)?;
        Ok(())
    }

    /// The number of scratch buffers sized after the filtered data, including the group sums
    /// of the inner scan.
    pub fn num_allocated_buffers(&self) -> usize {
        [&self.group_sums, &self.global_prefix_sums, &self.true_count]
            .into_iter()
            .flatten()
            .count()
            + self.temp.is_some() as usize
            + self.scan.num_allocated_levels()
    }

    /// Frees every scratch buffer owned by this engine.
    ///
    /// The compiled kernels are kept.
    pub fn release(&mut self) {
        self.release_scratch();
        self.readback = None;
    }

    fn release_scratch(&mut self) {
        self.temp = None;
        self.group_sums = None;
        self.global_prefix_sums = None;
        self.true_count = None;
        self.window_params.clear();
        self.scan.release();
    }

    /// Records the partition of `data` into `encoder`.
    ///
    /// If `count` is given, the number of elements matching `predicate` is copied there once the
    /// partition completes.
    ///
    /// `data` needs the `STORAGE` usage.
    pub fn dispatch(
        &mut self,
        device: &Device,
        encoder: &mut CommandEncoder,
        data: &GpuVector<T>,
        predicate: &Predicate,
        count: Option<ScalarDest>,
    ) -> Result<()> {
        self.record(device, encoder, data, predicate, count)?;
        Ok(())
    }

    /// Partitions `data` and submits the work to the queue.
    ///
    /// If `read_count` is set, waits for the partition to complete and returns the number of
    /// elements matching `predicate`.
    pub async fn filter(
        &mut self,
        gpu: &GpuInstance,
        data: &GpuVector<T>,
        predicate: &Predicate,
        count: Option<ScalarDest<'_>>,
        read_count: bool,
    ) -> Result<Option<u32>> {
        let device = gpu.device();
        let mut encoder = device.create_command_encoder(&Default::default());
        let recorded = self.record(device, &mut encoder, data, predicate, count)?;

        let (true, true, Some(true_count)) = (read_count, recorded, &self.true_count) else {
            gpu.queue().submit(Some(encoder.finish()));
            return Ok(read_count.then_some(0));
        };

        let readback = self.readback.get_or_insert_with(|| {
            GpuScalar::uninit(device, BufferUsages::MAP_READ | BufferUsages::COPY_DST)
        });
        ScalarDest::new(readback.as_vector(), 0).copy_from(&mut encoder, true_count.buffer());
        gpu.queue().submit(Some(encoder.finish()));

        readback.read(device).await.map(Some)
    }

    // Returns `false` if `data` is empty and nothing was dispatched.
    fn record(
        &mut self,
        device: &Device,
        encoder: &mut CommandEncoder,
        data: &GpuVector<T>,
        predicate: &Predicate,
        count: Option<ScalarDest>,
    ) -> Result<bool> {
        if let Some(count) = &count {
            count.validate()?;
        }
        data.check_usages(BufferUsages::STORAGE)?;
        let len = u32::try_from(data.len()).map_err(|_| Error::TooManyElements { len: data.len() })?;

        let config = self.config;
        let kernels = self
            .kernels
            .get_or_insert_with(|| FilterKernels::new(device, &config));
        let batcher = kernels.batcher;
        let pipelines = kernels.pipelines::<T>(device, predicate)?;
        self.scan.ensure_ready(device)?;

        if len == 0 {
            if let Some(count) = count {
                count.clear(encoder);
            }
            self.release_scratch();
            return Ok(false);
        }

        let num_groups = len.div_ceil(FILTER_GROUP_ELEMENTS);
        self.window_params.track_len(len);
        let temp = reserve_vector(
            &mut self.temp,
            device,
            len,
            BufferUsages::STORAGE,
            "filter temp",
        );
        let group_sums = reserve_vector(
            &mut self.group_sums,
            device,
            num_groups,
            BufferUsages::STORAGE,
            "filter group sums",
        );
        let global_prefix_sums = reserve_vector(
            &mut self.global_prefix_sums,
            device,
            num_groups,
            BufferUsages::STORAGE,
            "filter prefix sums",
        );
        let true_count = reserve_vector(
            &mut self.true_count,
            device,
            1,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            "filter true count",
        );

        let [threshold_lo, threshold_hi] = predicate.thresholds();
        let params = GpuDispatchParams {
            num_elements: len,
            num_groups,
            threshold_lo,
            threshold_hi,
            ..Default::default()
        };

        {
            let mut pass = encoder.compute_pass("filter_local_sort");
            dispatch_windows(
                device,
                &mut self.window_params,
                &mut pass,
                &pipelines.local_sort,
                &batcher,
                params,
                &[
                    (data.buffer(), 1),
                    (temp.buffer(), 2),
                    (group_sums.buffer(), 3),
                    (global_prefix_sums.buffer(), 4),
                ],
            );
        }

        // Every group must know its global offset before any element moves.
        self.scan.dispatch(
            device,
            encoder,
            global_prefix_sums,
            Some(ScalarDest::new(true_count, 0)),
        )?;

        {
            let mut pass = encoder.compute_pass("filter_global_shuffle");
            dispatch_windows(
                device,
                &mut self.window_params,
                &mut pass,
                &pipelines.global_shuffle,
                &batcher,
                params,
                &[
                    (temp.buffer(), 1),
                    (data.buffer(), 2),
                    (group_sums.buffer(), 3),
                    (global_prefix_sums.buffer(), 4),
                    (true_count.buffer(), 5),
                ],
            );
        }

        if let Some(count) = count {
            count.copy_from(encoder, true_count.buffer());
        }

        Ok(true)
    }
}
