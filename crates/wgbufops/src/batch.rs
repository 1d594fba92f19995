use crate::EngineConfig;

/// A contiguous range of groups processed by a single dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DispatchWindow {
    /// Index of the first group of this window.
    pub group_offset: u32,
    /// Number of groups launched by this window.
    pub num_groups: u32,
}

/// Splits logical workloads into dispatches of at most `max_groups` workgroups.
///
/// Every kernel of this crate receives the `group_offset` of its window as a uniform and adds
/// it to its `workgroup_id` to recover the logical group index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DispatchBatcher {
    max_groups: u32,
}

impl Default for DispatchBatcher {
    fn default() -> Self {
        Self::new(EngineConfig::default().max_groups_per_dispatch)
    }
}

impl DispatchBatcher {
    /// A batcher splitting workloads in windows of at most `max_groups` groups.
    pub fn new(max_groups: u32) -> Self {
        Self {
            max_groups: max_groups.max(1),
        }
    }

    /// The batcher matching the dispatch limit of `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_groups_per_dispatch)
    }

    /// The maximum number of groups per window.
    pub fn max_groups(&self) -> u32 {
        self.max_groups
    }

    /// Number of windows needed to cover `num_groups` groups.
    pub fn num_windows(&self, num_groups: u32) -> u32 {
        num_groups.div_ceil(self.max_groups)
    }

    /// Iterates over the disjoint windows covering the groups `0..num_groups`, in order.
    pub fn windows(&self, num_groups: u32) -> impl Iterator<Item = DispatchWindow> {
        let max_groups = self.max_groups;
        (0..self.num_windows(num_groups)).map(move |i| {
            let group_offset = i * max_groups;
            DispatchWindow {
                group_offset,
                num_groups: (num_groups - group_offset).min(max_groups),
            }
        })
    }
}
