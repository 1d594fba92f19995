//! Work-efficient exclusive prefix sum.
//!
//! Given an input array `[a₀, a₁, a₂, ..., aₙ₋₁]`, the exclusive prefix sum produces
//! `[0, a₀, a₀+a₁, ..., a₀+a₁+...+aₙ₋₂]`, and the total `a₀+...+aₙ₋₁`.
//!
//! The buffer is split in groups of `2 × group_threads` elements, each scanned in workgroup
//! memory. The group sums form the input of the next level of the hierarchy, until a level fits
//! in a single group. The scanned sums are then added back onto every level, deepest first.

use crate::gpu::GpuInstance;
use crate::kernel::{dispatch_windows, CommandEncoderExt, GpuDispatchParams, WindowParams};
use crate::shader::{group_threads_defs, KernelCompiler};
use crate::tensor::{GpuScalar, GpuVector, ScalarDest};
use crate::{DispatchBatcher, EngineConfig, Error, Result};
use wgpu::{BufferUsages, CommandEncoder, ComputePipeline, Device};

const SCAN_WGSL: &str = include_str!("shaders/scan.wgsl");

/// The maximum depth of the scan hierarchy.
///
/// With at least 32 threads per group, 32-bit element counts never need more than 6 levels.
pub const MAX_SCAN_LEVELS: usize = 8;

const MIN_GROUP_THREADS: u32 = 32;

/// The number of threads per group preferred for scanning `len` elements, clamped to
/// `max_group_threads`.
///
/// Always a power of two, and never less than 32 even if `max_group_threads` is lower.
pub fn group_threads_for(len: u32, max_group_threads: u32) -> u32 {
    let preferred = if len <= 65536 {
        128
    } else if len <= 262144 {
        256
    } else {
        512
    };
    clamp_group_threads(preferred, max_group_threads)
}

fn clamp_group_threads(group_threads: u32, max_group_threads: u32) -> u32 {
    let threads = group_threads
        .min(max_group_threads)
        .max(MIN_GROUP_THREADS);
    1 << (31 - threads.leading_zeros())
}

/// One level of the scan hierarchy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScanLevel {
    /// The number of elements scanned at this level.
    pub len: u32,
    /// The number of threads per group.
    pub group_threads: u32,
    /// The number of groups, i.e., the number of group sums produced by this level.
    pub num_groups: u32,
}

impl ScanLevel {
    /// The number of elements scanned by one group.
    pub fn elements_per_group(&self) -> u32 {
        self.group_threads * 2
    }

    fn params(&self) -> GpuDispatchParams {
        GpuDispatchParams {
            num_elements: self.len,
            num_groups: self.num_groups,
            ..Default::default()
        }
    }
}

/// The levels needed to scan a buffer of a given length.
///
/// Level `0` scans the input buffer. Level `i + 1` scans the group sums of level `i`. The last
/// level always has a single group: its group sum is the total of the input.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanPlan {
    levels: Vec<ScanLevel>,
}

impl ScanPlan {
    /// Plans the scan of `len` elements with groups of at most `max_group_threads` threads.
    ///
    /// An empty input yields an empty plan.
    pub fn new(len: u32, max_group_threads: u32) -> Self {
        let mut levels = vec![];
        let mut len = len;

        while len > 0 {
            let group_threads = group_threads_for(len, max_group_threads);
            let elements_per_group = group_threads * 2;
            let num_groups = len.div_ceil(elements_per_group);
            levels.push(ScanLevel {
                len,
                group_threads,
                num_groups,
            });

            if num_groups == 1 {
                break;
            }

            if num_groups <= elements_per_group {
                // The group sums fit in a single group of the same size.
                levels.push(ScanLevel {
                    len: num_groups,
                    group_threads,
                    num_groups: 1,
                });
                break;
            }

            len = num_groups;
        }

        Self { levels }
    }

    /// The levels of the hierarchy, from the input to the single-group level.
    pub fn levels(&self) -> &[ScanLevel] {
        &self.levels
    }

    /// The depth of the hierarchy.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Is this the plan of an empty input?
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

struct ScanVariant {
    group_threads: u32,
    scan_groups: ComputePipeline,
    add_group_sums: ComputePipeline,
}

struct ScanKernels {
    variants: Vec<ScanVariant>,
    max_group_threads: u32,
    batcher: DispatchBatcher,
}

impl ScanKernels {
    fn compile(device: &Device, config: &EngineConfig) -> Result<Self> {
        let config = config.clamped_to(&device.limits());
        let mut compiler = KernelCompiler::new();
        let mut variants: Vec<ScanVariant> = vec![];

        for preferred in [128, 256, 512] {
            let group_threads = clamp_group_threads(preferred, config.max_group_threads);
            if variants.iter().any(|v| v.group_threads == group_threads) {
                continue;
            }

            let shader = compiler.compile(
                device,
                "scan.wgsl",
                SCAN_WGSL,
                group_threads_defs(group_threads),
            )?;
            variants.push(ScanVariant {
                group_threads,
                scan_groups: shader.pipeline(device, "scan_groups"),
                add_group_sums: shader.pipeline(device, "add_group_sums"),
            });
        }

        Ok(Self {
            variants,
            max_group_threads: config.max_group_threads,
            batcher: DispatchBatcher::from_config(&config),
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

    fn variant(&self, group_threads: u32) -> Result<&ScanVariant> {
        self.variants
            .iter()
            .find(|v| v.group_threads == group_threads)
            .ok_or(Error::UnsupportedGroupSize { group_threads })
    }
}

/// Exclusive prefix sum of `u32` buffers.
///
/// The engine owns the group-sum buffers of every level of the hierarchy. They are reallocated
/// whenever the length of the scanned buffer changes, and the levels a shorter buffer no longer
/// needs are released.
pub struct ScanEngine {
    config: EngineConfig,
    kernels: Option<ScanKernels>,
    group_sums: [Option<GpuVector<u32>>; MAX_SCAN_LEVELS],
    window_params: WindowParams,
    readback: Option<GpuScalar<u32>>,
}

impl Default for ScanEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanEngine {
    /// An engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// An engine with the given configuration, clamped to the device limits on first use.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            kernels: None,
            group_sums: Default::default(),
            window_params: WindowParams::default(),
            readback: None,
        }
    }

    /// The configuration of this engine.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compiles the scan kernels if they haven’t been compiled yet.
    pub fn ensure_ready(&mut self, device: &Device) -> Result<()> {
        ScanKernels::get_or_compile(&mut self.kernels, device, &self.config)?;
        Ok(())
    }

    /// Is the engine ready to record dispatches without compiling anything?
    pub fn is_ready(&self) -> bool {
        self.kernels.is_some()
    }

    /// The number of levels currently holding a group-sum buffer.
    pub fn num_allocated_levels(&self) -> usize {
        self.group_sums.iter().flatten().count()
    }

    /// Frees every scratch buffer owned by this engine.
    ///
    /// The compiled kernels are kept.
    pub fn release(&mut self) {
        self.group_sums = Default::default();
        self.window_params.clear();
        self.readback = None;
    }

    /// Records the in-place exclusive scan of `data` into `encoder`.
    ///
    /// If `total` is given, the sum of all the elements of `data` is copied there once the scan
    /// completes. An empty `data` records no dispatch and writes a total of zero.
    ///
    /// `data` needs the `STORAGE` usage.
    pub fn dispatch(
        &mut self,
        device: &Device,
        encoder: &mut CommandEncoder,
        data: &GpuVector<u32>,
        total: Option<ScalarDest>,
    ) -> Result<()> {
        self.record_with_total(device, encoder, data, total)?;
        Ok(())
    }

    /// Scans `data` in place and submits the work to the queue.
    ///
    /// If `read_total` is set, waits for the scan to complete and returns the sum of all the
    /// original elements.
    pub async fn scan(
        &mut self,
        gpu: &GpuInstance,
        data: &GpuVector<u32>,
        total: Option<ScalarDest<'_>>,
        read_total: bool,
    ) -> Result<Option<u32>> {
        let device = gpu.device();
        let mut encoder = device.create_command_encoder(&Default::default());
        let last = self.record_with_total(device, &mut encoder, data, total)?;

        let (true, Some(last)) = (read_total, last) else {
            gpu.queue().submit(Some(encoder.finish()));
            return Ok(read_total.then_some(0));
        };

        let readback = self.readback.get_or_insert_with(|| {
            GpuScalar::uninit(device, BufferUsages::MAP_READ | BufferUsages::COPY_DST)
        });
        if let Some(sums) = &self.group_sums[last] {
            ScalarDest::new(readback.as_vector(), 0).copy_from(&mut encoder, sums.buffer());
        }
        gpu.queue().submit(Some(encoder.finish()));

        readback.read(device).await.map(Some)
    }

    // Records the scan, copies its total to `total`, and returns the level whose group sums
    // hold the total.
    fn record_with_total(
        &mut self,
        device: &Device,
        encoder: &mut CommandEncoder,
        data: &GpuVector<u32>,
        total: Option<ScalarDest>,
    ) -> Result<Option<usize>> {
        if let Some(total) = &total {
            total.validate()?;
        }

        let last = self.record(device, encoder, data)?;
        if let Some(total) = total {
            match last.and_then(|last| self.group_sums[last].as_ref()) {
                Some(sums) => total.copy_from(encoder, sums.buffer()),
                None => total.clear(encoder),
            }
        }

        Ok(last)
    }

    #[cfg(test)]
    pub(crate) fn max_group_threads(&self) -> u32 {
        self.kernels
            .as_ref()
            .map(|k| k.max_group_threads)
            .unwrap_or(self.config.max_group_threads)
    }

    // Records the scan and returns the level whose group sums hold the total, if any.
    fn record(
        &mut self,
        device: &Device,
        encoder: &mut CommandEncoder,
        data: &GpuVector<u32>,
    ) -> Result<Option<usize>> {
        data.check_usages(BufferUsages::STORAGE)?;
        let len = u32::try_from(data.len()).map_err(|_| Error::TooManyElements { len: data.len() })?;
        let kernels = ScanKernels::get_or_compile(&mut self.kernels, device, &self.config)?;

        let plan = ScanPlan::new(len, kernels.max_group_threads);
        log::debug!("scan plan for {len} elements: {:?}", plan.levels());
        if plan.is_empty() {
            reserve_group_sums(&mut self.group_sums, device, &plan);
            self.window_params.clear();
            return Ok(None);
        }
        if plan.len() > MAX_SCAN_LEVELS {
            return Err(Error::TooManyElements { len: data.len() });
        }

        self.window_params.track_len(len);
        reserve_group_sums(&mut self.group_sums, device, &plan);
        let group_sums: Vec<_> = self.group_sums.iter().flatten().collect();
        let levels = plan.levels();

        let mut pass = encoder.compute_pass("scan");

        for (i, level) in levels.iter().enumerate() {
            let level_data = if i == 0 { data } else { group_sums[i - 1] };
            dispatch_windows(
                device,
                &mut self.window_params,
                &mut pass,
                &kernels.variant(level.group_threads)?.scan_groups,
                &kernels.batcher,
                level.params(),
                &[(level_data.buffer(), 1), (group_sums[i].buffer(), 2)],
            );
        }

        for i in (0..levels.len() - 1).rev() {
            let level = &levels[i];
            let level_data = if i == 0 { data } else { group_sums[i - 1] };
            dispatch_windows(
                device,
                &mut self.window_params,
                &mut pass,
                &kernels.variant(level.group_threads)?.add_group_sums,
                &kernels.batcher,
                level.params(),
                &[(level_data.buffer(), 1), (group_sums[i].buffer(), 2)],
            );
        }

        Ok(Some(levels.len() - 1))
    }
}

// Resizes the group sums of every level of `plan`, and drops the deeper levels.
fn reserve_group_sums(
    group_sums: &mut [Option<GpuVector<u32>>; MAX_SCAN_LEVELS],
    device: &Device,
    plan: &ScanPlan,
) {
    for (i, slot) in group_sums.iter_mut().enumerate() {
        match plan.levels().get(i) {
            Some(level) => {
                if slot.as_ref().map(|sums| sums.len()) != Some(level.num_groups as u64) {
                    log::debug!(
                        "allocating {} group sums for scan level {i}",
                        level.num_groups
                    );
                    *slot = Some(GpuVector::uninit(
                        device,
                        level.num_groups,
                        BufferUsages::STORAGE | BufferUsages::COPY_SRC,
                    ));
                }
            }
            None => {
                if slot.take().is_some() {
                    log::debug!("released group sums of scan level {i}");
                }
            }
        }
    }
}

/// CPU reference of the exclusive scan, returning the total.
#[cfg(test)]
pub(crate) fn exclusive_scan_cpu(values: &mut [u32]) -> u32 {
    let mut sum = 0u32;
    for value in values.iter_mut() {
        let next = sum.wrapping_add(*value);
        *value = sum;
        sum = next;
    }
    sum
}
