//! oxipool - a per-process tiered storage engine for reference-counted values
//!
//! oxipool manages named values whose total size can exceed the memory they
//! are allowed to occupy: clients `put` a value and receive a numeric ref, the
//! engine decides where the bytes physically live (memory, serialized
//! files, user-defined media), materializes them back on `get`, and
//! reclaims them on `remove`.
//!
//! # Features
//!
//! - RCU-swapped per-reference placement state with one-shot readiness
//!   signaling, so long-running I/O completes lazily
//! - Pluggable [`StorageDevice`](device::StorageDevice) /
//!   [`StorageResource`](resource::StorageResource) contracts
//! - A two-tier [`SimpleRecencyAllocator`](allocator::SimpleRecencyAllocator)
//!   with LRU/MRU eviction and hit/miss/evict counters
//! - A serialization file device with a stackable byte-stream filter chain
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use oxipool::prelude::*;
//!
//! let upper = Arc::new(CpuRamDevice::new());
//! let lower = SerializationFileDevice::new(
//!     FileDeviceConfig::new("/tmp/pool"),
//!     Arc::new(BincodeCodec::<Vec<u8>>::new()),
//! )?;
//! let sra = SimpleRecencyAllocator::new(RecencyConfig::new(100 << 20, 1 << 30), upper, lower)?;
//!
//! oxipool::set_default_device(Arc::new(sra));
//! let id = oxipool::put(Arc::new(vec![1u8, 2, 3]), 3)?;
//! let value = oxipool::get(id)?;
//! ```

#![warn(missing_docs)]

pub mod allocator;
pub mod codec;
pub mod config;
pub mod datastore;
pub mod device;
pub mod error;
pub mod filter;
pub mod resource;
pub mod state;
pub mod task;

// Re-exports for convenience
pub use codec::PoolValue;
pub use datastore::{get, global, put, remove, set_default_device, set_device, Datastore};
pub use error::{PoolError, Result};
pub use state::{FileRef, RefId, RefState, StorageState};

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::allocator::{RecencyConfig, RecencyPolicy, SimpleRecencyAllocator};
    pub use crate::codec::{BincodeCodec, BytesCodec, PoolValue, Serializer};
    pub use crate::datastore::Datastore;
    pub use crate::device::{
        CpuRamDevice, FileDeviceConfig, SerializationFileDevice, StorageDevice,
    };
    pub use crate::error::{PoolError, Result};
    pub use crate::filter::{ByteFilter, XorFilter};
    pub use crate::resource::{CpuRamResource, FilesystemResource, StorageResource};
    pub use crate::state::{RefId, RefState};
}
