//! GPU buffer operators built on `wgpu` compute shaders.
//!
//! This crate provides three massively-parallel primitives over device-resident buffers:
//!
//! - [`ScanEngine`]: exclusive prefix sum of a `u32` buffer, computed with a group-recursive
//!   work-efficient scan.
//! - [`FilterEngine`]: stable stream compaction, gathering every element matching a
//!   [`Predicate`] at the front of the buffer.
//! - [`RadixSortEngine`]: stable LSD radix sort of records by their `u32` key.
//!
//! Filtering and sorting share the same architecture: each workgroup sorts its own elements
//! locally and counts them per bucket, the per-group counts are scanned with the
//! [`ScanEngine`], and a final shuffle writes every element at its global position. Logical
//! workloads larger than the device's per-dimension dispatch limit are split in windows by the
//! [`DispatchBatcher`].

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]
#![allow(clippy::too_many_arguments)]

pub use batch::{DispatchBatcher, DispatchWindow};
pub use config::EngineConfig;
pub use element::GpuElement;
pub use error::{Error, Result};
pub use filter::{FilterEngine, Predicate};
pub use radix_sort::{bits_required, num_radix_passes, RadixSortEngine};
pub use scan::{ScanEngine, ScanLevel, ScanPlan};
pub use tensor::ScalarDest;

/// Splitting of large dispatches into windows fitting the device limits.
pub mod batch;
/// Extensions over naga-oil’s Composer.
pub mod composer;
/// Engine configuration.
pub mod config;
/// Description of the element types the engines can process.
pub mod element;
/// Error types.
pub mod error;
/// Stable stream compaction.
pub mod filter;
/// Device and queue initialization.
pub mod gpu;
/// Helpers for recording compute dispatches.
pub mod kernel;
/// Stable LSD radix sort.
pub mod radix_sort;
/// Group-recursive exclusive prefix sum.
pub mod scan;
/// Typed GPU buffers.
pub mod tensor;

mod shader;

#[cfg(test)]
pub(crate) mod test_utils;
