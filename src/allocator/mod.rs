//! Composite allocator devices.
//!
//! An allocator is a [`StorageDevice`](crate::device::StorageDevice) that
//! owns no medium of its own: it composes other devices and decides which
//! one holds each reference. The built-in
//! [`SimpleRecencyAllocator`] keeps a bounded working set on an upper
//! (memory) device and spills by recency to a lower device.

mod recency;
mod stats;

pub use recency::{RecencyConfig, RecencyPolicy, SimpleRecencyAllocator};
pub use stats::{AllocatorStats, AllocatorStatsSummary};
