use wgpu::Limits;

/// Parameters shared by every engine.
///
/// The defaults match the limits of most desktop GPUs. Use [`EngineConfig::from_limits`] to
/// derive a configuration from the limits of a specific device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// The maximum number of workgroups a single dispatch may launch along one dimension
    /// (default: `65535`).
    ///
    /// Larger logical workloads are split into sequential dispatch windows.
    pub max_groups_per_dispatch: u32,
    /// The largest workgroup size the scan kernels may select (default: `512`).
    ///
    /// The scan picks 128, 256 or 512 threads per group depending on the input length, rounded
    /// down to a power of two no greater than this value. Groups never have fewer than 32
    /// threads: values below 32 behave as 32.
    pub max_group_threads: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_groups_per_dispatch: 65535,
            max_group_threads: 512,
        }
    }
}

impl EngineConfig {
    /// A configuration respecting the given device limits.
    pub fn from_limits(limits: &Limits) -> Self {
        Self::default().clamped_to(limits)
    }

    /// Returns a copy of `self` with every field clamped to the given device limits.
    pub fn clamped_to(self, limits: &Limits) -> Self {
        let max_threads = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x);
        Self {
            max_groups_per_dispatch: self
                .max_groups_per_dispatch
                .min(limits.max_compute_workgroups_per_dimension)
                .max(1),
            max_group_threads: self.max_group_threads.min(max_threads),
        }
    }
}

#[cfg(test)]
mod test {
    use super::EngineConfig;
    use wgpu::Limits;

    #[test]
    fn clamp_to_default_limits() {
        let config = EngineConfig::from_limits(&Limits::default());
        assert_eq!(config.max_groups_per_dispatch, 65535);
        // The default wgpu limits only allow 256 invocations per workgroup.
        assert_eq!(config.max_group_threads, 256);
    }

    #[test]
    fn clamp_never_raises_values() {
        let limits = Limits {
            max_compute_invocations_per_workgroup: 1024,
            max_compute_workgroup_size_x: 1024,
            ..Limits::default()
        };
        let config = EngineConfig {
            max_groups_per_dispatch: 100,
            max_group_threads: 128,
        }
        .clamped_to(&limits);
        assert_eq!(config.max_groups_per_dispatch, 100);
        assert_eq!(config.max_group_threads, 128);
    }
}
